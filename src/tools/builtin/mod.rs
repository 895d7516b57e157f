//! Bundled tools, each behind its own API credential.

mod calendar;
mod flight;
mod news;
mod weather;

use std::env;
use std::sync::Arc;

use reqwest::Client;
use tracing::info;

pub use calendar::CalendarTool;
pub use flight::{FlightPositionTool, FlightSearchTool};
pub use news::{FactualNewsTool, NewsSummaryTool};
pub use weather::WeatherTool;

use crate::errors::AgentResult;
use crate::tools::ToolRegistry;

/// Registers every builtin tool whose credentials are present in the
/// environment. Missing credentials skip the tool; a half-configured
/// environment still yields a working agent.
pub fn register_from_env(registry: &mut ToolRegistry) -> AgentResult<usize> {
    let client = Client::new();
    let before = registry.len();

    if let Ok(key) = env::var("WEATHER_API_KEY") {
        registry.register(Arc::new(WeatherTool::new(client.clone(), key)))?;
    }
    if let Ok(key) = env::var("FLIGHT_API_KEY") {
        registry.register(Arc::new(FlightPositionTool::new(client.clone(), key)))?;
    }
    if let (Ok(key), Ok(secret)) = (env::var("AMADEUS_API_KEY"), env::var("AMADEUS_API_SECRET")) {
        registry.register(Arc::new(FlightSearchTool::new(client.clone(), key, secret)))?;
    }
    if let Ok(key) = env::var("EVENT_REGISTRY_API_KEY") {
        registry.register(Arc::new(NewsSummaryTool::new(client.clone(), key)))?;
    }
    if let Ok(key) = env::var("NEWSDATA_API_KEY") {
        registry.register(Arc::new(FactualNewsTool::new(client.clone(), key)))?;
    }
    if let Ok(token) = env::var("OUTLOOK_ACCESS_TOKEN") {
        registry.register(Arc::new(CalendarTool::new(client, token)))?;
    }

    let registered = registry.len() - before;
    info!(registered, "builtin tools loaded from environment");
    Ok(registered)
}
