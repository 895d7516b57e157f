//! Calendar listing via the Microsoft Graph API.
//!
//! Expects a pre-acquired delegated access token; interactive sign-in is
//! the host application's problem.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::tools::{InputSchema, Tool, ToolContext, ToolError, ToolSchema};

const GRAPH_BASE_URL: &str = "https://graph.microsoft.com";

pub struct CalendarTool {
    client: Client,
    access_token: String,
    base_url: String,
}

impl CalendarTool {
    pub fn new(client: Client, access_token: impl Into<String>) -> Self {
        Self {
            client,
            access_token: access_token.into(),
            base_url: GRAPH_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl Tool for CalendarTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "get_my_calendars".to_string(),
            description: "Get the list of calendars for the authenticated user".to_string(),
            parameters: InputSchema::new(),
        }
    }

    async fn run(&self, _arguments: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let response = self
            .client
            .get(format!("{}/v1.0/me/calendars", self.base_url))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| ToolError::execution(format!("calendar request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ToolError::execution(format!(
                "calendar service returned HTTP {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::execution(format!("malformed calendar response: {e}")))?;

        let calendars: Vec<String> = body["value"]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|c| {
                        let name = c["name"].as_str()?;
                        let id = c["id"].as_str()?;
                        Some(format!("{name} | {id}"))
                    })
                    .collect()
            })
            .unwrap_or_default();

        if calendars.is_empty() {
            return Ok(json!({ "message": "No calendars found" }));
        }
        Ok(json!({ "calendars": calendars }))
    }
}
