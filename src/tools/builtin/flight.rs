//! Flight tools: live position via FlightAware AeroAPI, offer search via
//! the Amadeus self-service API.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::tools::{InputSchema, PropertySchema, Tool, ToolContext, ToolError, ToolSchema};

const AEROAPI_BASE_URL: &str = "https://aeroapi.flightaware.com/aeroapi";
const AMADEUS_BASE_URL: &str = "https://test.api.amadeus.com";

/// Real-time flight status lookup.
pub struct FlightPositionTool {
    client: Client,
    api_key: String,
    base_url: String,
}

impl FlightPositionTool {
    pub fn new(client: Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: AEROAPI_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl Tool for FlightPositionTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "get_flight_position".to_string(),
            description: "Retrieve the real-time flight status for a given flight number"
                .to_string(),
            parameters: InputSchema::new().property(
                "flight_number",
                PropertySchema::string("The flight number, e.g. 'AA100'"),
                true,
            ),
        }
    }

    async fn run(&self, arguments: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let flight_number = arguments["flight_number"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("flight_number is required".to_string()))?;

        debug!(flight_number, "fetching flight status");
        let response = self
            .client
            .get(format!("{}/flights/{flight_number}", self.base_url))
            .header("x-apikey", &self.api_key)
            .send()
            .await
            .map_err(|e| ToolError::execution(format!("flight request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ToolError::execution(format!(
                "flight service returned HTTP {}",
                response.status()
            )));
        }
        let data: Value = response
            .json()
            .await
            .map_err(|e| ToolError::execution(format!("malformed flight response: {e}")))?;

        match data["flights"].as_array().and_then(|f| f.first()) {
            Some(flight) => Ok(flight.clone()),
            None => Ok(json!({
                "message": format!("No recent flights found for {flight_number}")
            })),
        }
    }
}

/// Flight-offer search. City names are resolved to IATA codes first, then
/// offers are fetched; once results are in, a proactive summary is requested
/// so the user hears the highlights without waiting for the full reply.
pub struct FlightSearchTool {
    client: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
}

impl FlightSearchTool {
    pub fn new(
        client: Client,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            base_url: AMADEUS_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn access_token(&self) -> Result<String, ToolError> {
        let response = self
            .client
            .post(format!("{}/v1/security/oauth2/token", self.base_url))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.api_key.as_str()),
                ("client_secret", self.api_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ToolError::execution(format!("auth request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ToolError::execution(format!(
                "auth returned HTTP {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::execution(format!("malformed auth response: {e}")))?;
        body["access_token"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ToolError::execution("auth response missing access_token"))
    }

    async fn city_code(&self, token: &str, keyword: &str) -> Result<Option<String>, ToolError> {
        let response = self
            .client
            .get(format!("{}/v1/reference-data/locations", self.base_url))
            .bearer_auth(token)
            .query(&[("keyword", keyword), ("subType", "CITY")])
            .send()
            .await
            .map_err(|e| ToolError::execution(format!("location lookup failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ToolError::execution(format!(
                "location lookup returned HTTP {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::execution(format!("malformed location response: {e}")))?;
        Ok(body["data"][0]["iataCode"].as_str().map(str::to_string))
    }
}

#[async_trait]
impl Tool for FlightSearchTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "search_flights".to_string(),
            description: "Search for available flight offers between two cities".to_string(),
            parameters: InputSchema::new()
                .property(
                    "origin",
                    PropertySchema::string("Name of the departure city, e.g. 'New York'"),
                    true,
                )
                .property(
                    "destination",
                    PropertySchema::string("Name of the destination city, e.g. 'London'"),
                    true,
                )
                .property(
                    "departure_date",
                    PropertySchema::string("Departure date in YYYY-MM-DD format"),
                    true,
                )
                .property(
                    "adults",
                    PropertySchema::integer("Number of adult travelers, 12+ years")
                        .with_default(json!(1)),
                    false,
                ),
        }
    }

    async fn run(&self, arguments: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let origin = arguments["origin"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("origin is required".to_string()))?;
        let destination = arguments["destination"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("destination is required".to_string()))?;
        let departure_date = arguments["departure_date"].as_str().ok_or_else(|| {
            ToolError::InvalidArguments("departure_date is required".to_string())
        })?;
        let adults = arguments["adults"].as_u64().unwrap_or(1);

        let token = self.access_token().await?;

        let origin_code = self.city_code(&token, origin).await?;
        let dest_code = self.city_code(&token, destination).await?;
        let (origin_code, dest_code) = match (origin_code, dest_code) {
            (Some(o), Some(d)) => (o, d),
            _ => {
                return Ok(json!({
                    "message": format!("Could not find airports for {origin} or {destination}")
                }))
            }
        };

        debug!(%origin_code, %dest_code, departure_date, "searching flight offers");
        let response = self
            .client
            .get(format!("{}/v2/shopping/flight-offers", self.base_url))
            .bearer_auth(&token)
            .query(&[
                ("originLocationCode", origin_code.as_str()),
                ("destinationLocationCode", dest_code.as_str()),
                ("departureDate", departure_date),
                ("adults", &adults.to_string()),
            ])
            .send()
            .await
            .map_err(|e| ToolError::execution(format!("offer search failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ToolError::execution(format!(
                "offer search returned HTTP {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::execution(format!("malformed offer response: {e}")))?;

        let offers = summarize_offers(&body);
        if offers.is_empty() {
            return Ok(json!({
                "message": format!(
                    "No flight offers found from {origin} to {destination} on {departure_date}"
                )
            }));
        }

        ctx.say(format!(
            "Found {} flight options:\n{}\nSummarize the best flight options by price and timing clearly.",
            offers.len(),
            offers.join("\n")
        ))
        .await;

        Ok(json!({ "offers": offers }))
    }
}

/// One line per offer: first segment's flight number, overall departure and
/// arrival times, total price.
fn summarize_offers(body: &Value) -> Vec<String> {
    let Some(data) = body["data"].as_array() else {
        return Vec::new();
    };
    data.iter()
        .filter_map(|offer| {
            let segments = offer["itineraries"][0]["segments"].as_array()?;
            let first = segments.first()?;
            let last = segments.last()?;
            let carrier = first["carrierCode"].as_str()?;
            let number = first["number"].as_str()?;
            let departs = first["departure"]["at"].as_str()?;
            let arrives = last["arrival"]["at"].as_str()?;
            let price = offer["price"]["total"].as_str().unwrap_or("N/A");
            Some(format!(
                "Flight {carrier}{number}: departs {departs}, arrives {arrives}, price {price} EUR"
            ))
        })
        .collect()
}
