//! Current-weather lookup backed by OpenWeatherMap.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::tools::{InputSchema, PropertySchema, Tool, ToolContext, ToolError, ToolSchema};

const DEFAULT_BASE_URL: &str = "https://api.openweathermap.org";

pub struct WeatherTool {
    client: Client,
    api_key: String,
    base_url: String,
}

impl WeatherTool {
    pub fn new(client: Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl Tool for WeatherTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "lookup_weather".to_string(),
            description: "Look up current weather information for a given location".to_string(),
            parameters: InputSchema::new()
                .property(
                    "city_name",
                    PropertySchema::string("The location to look up weather information for"),
                    true,
                )
                .property(
                    "country_code",
                    PropertySchema::string("Optional country code, e.g. 'IN' for India"),
                    false,
                ),
        }
    }

    async fn run(&self, arguments: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let city = arguments["city_name"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("city_name is required".to_string()))?;
        let query = match arguments["country_code"].as_str().filter(|c| !c.is_empty()) {
            Some(country) => format!("{city},{country}"),
            None => city.to_string(),
        };

        debug!(%query, "fetching weather");
        let response = self
            .client
            .get(format!("{}/data/2.5/weather", self.base_url))
            .query(&[("q", query.as_str()), ("appid", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| ToolError::execution(format!("weather request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ToolError::execution(format!(
                "weather service returned HTTP {}",
                response.status()
            )));
        }
        let data: Value = response
            .json()
            .await
            .map_err(|e| ToolError::execution(format!("malformed weather response: {e}")))?;

        let kelvin = data["main"]["temp"]
            .as_f64()
            .ok_or_else(|| ToolError::execution("weather response missing temperature"))?;
        let celsius = ((kelvin - 273.15) * 10.0).round() / 10.0;

        Ok(json!({
            "location": data["name"],
            "temperature_celsius": celsius,
            "weather_main": data["weather"][0]["main"],
            "weather_report": data["weather"][0]["description"],
        }))
    }
}
