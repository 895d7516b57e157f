//! News tools: recent headlines from Event Registry, archived factual
//! lookups from NewsData.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use crate::tools::{InputSchema, PropertySchema, Tool, ToolContext, ToolError, ToolSchema};

const EVENT_REGISTRY_BASE_URL: &str = "https://eventregistry.org";
const NEWSDATA_BASE_URL: &str = "https://newsdata.io";

const HEADLINE_LIMIT: usize = 3;

/// General news headlines, newest first.
pub struct NewsSummaryTool {
    client: Client,
    api_key: String,
    base_url: String,
}

impl NewsSummaryTool {
    pub fn new(client: Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: EVENT_REGISTRY_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl Tool for NewsSummaryTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "get_news_summary".to_string(),
            description: "Get general news headlines and daily news updates".to_string(),
            parameters: InputSchema::new(),
        }
    }

    async fn run(&self, _arguments: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let response = self
            .client
            .post(format!("{}/api/v1/article/getArticles", self.base_url))
            .json(&json!({
                "action": "getArticles",
                "lang": "eng",
                "articlesSortBy": "date",
                "articlesCount": HEADLINE_LIMIT,
                "apiKey": self.api_key,
            }))
            .send()
            .await
            .map_err(|e| ToolError::execution(format!("news request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ToolError::execution(format!(
                "news service returned HTTP {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::execution(format!("malformed news response: {e}")))?;

        let titles: Vec<&str> = body["articles"]["results"]
            .as_array()
            .map(|articles| {
                articles
                    .iter()
                    .filter_map(|a| a["title"].as_str())
                    .take(HEADLINE_LIMIT)
                    .collect()
            })
            .unwrap_or_default();

        debug!(count = titles.len(), "fetched headlines");
        if titles.is_empty() {
            return Ok(json!({ "message": "No news found" }));
        }
        Ok(json!({ "summary": format!("Recent news: {}", titles.join(". ")) }))
    }
}

/// Archived news search for factual or historical queries.
pub struct FactualNewsTool {
    client: Client,
    api_key: String,
    base_url: String,
}

impl FactualNewsTool {
    pub fn new(client: Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: NEWSDATA_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl Tool for FactualNewsTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "get_factual_news".to_string(),
            description: "Get factual or historical news data from the news archive".to_string(),
            parameters: InputSchema::new().property(
                "query",
                PropertySchema::string("Topic to search the archive for"),
                true,
            ),
        }
    }

    async fn run(&self, arguments: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let query = arguments["query"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("query is required".to_string()))?;

        debug!(query, "searching news archive");
        let response = self
            .client
            .get(format!("{}/api/1/archive", self.base_url))
            .query(&[
                ("apikey", self.api_key.as_str()),
                ("q", query),
                ("country", "us,in,gb"),
            ])
            .send()
            .await
            .map_err(|e| ToolError::execution(format!("archive request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ToolError::execution(format!(
                "archive service returned HTTP {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::execution(format!("malformed archive response: {e}")))?;

        let articles: Vec<String> = body["results"]
            .as_array()
            .map(|results| {
                results
                    .iter()
                    .take(HEADLINE_LIMIT)
                    .map(|a| {
                        format!(
                            "{} ({})",
                            a["title"].as_str().unwrap_or("No title"),
                            a["source_id"].as_str().unwrap_or("Unknown source"),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        if articles.is_empty() {
            return Ok(json!({
                "message": format!("No factual data found about {query}")
            }));
        }
        Ok(json!({
            "summary": format!("Factual data: {}", articles.join(". "))
        }))
    }
}
