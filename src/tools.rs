//! Tool implementations executed by the worker.
//!
//! Every tool takes a JSON argument object and returns either
//! `{"success": true, ...}` or `{"success": false, "error": "..."}`.
//! Expected failures (missing arguments, backend errors) are reported that
//! way; `ToolError` is reserved for calls that cannot be executed at all.

use std::time::Duration;

use reqwest::header::ACCEPT;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::WorkerConfig;
use crate::models::{tool_failure, ToolDescriptor};

/// Upper bound for a single backend request. Kept below the bridge's
/// default timeout so a slow backend still yields a tool result.
const HTTP_TIMEOUT: Duration = Duration::from_secs(8);

/// Errors that prevent a tool from running.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool arguments must be a JSON object, got {0}")]
    InvalidArguments(String),

    #[error("Backend URL cannot be extended: {0}")]
    InvalidBaseUrl(Url),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// The tools the worker knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Weather,
    CurrentTime,
    CurrencyExchange,
    WikiSummary,
}

impl ToolKind {
    /// All tools, in `tools/list` order.
    pub const ALL: [ToolKind; 4] = [
        ToolKind::Weather,
        ToolKind::CurrentTime,
        ToolKind::CurrencyExchange,
        ToolKind::WikiSummary,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::Weather => "getWeather",
            ToolKind::CurrentTime => "getCurrentTime",
            ToolKind::CurrencyExchange => "getCurrencyExchange",
            ToolKind::WikiSummary => "getWikiSummary",
        }
    }

    pub fn descriptor(&self) -> ToolDescriptor {
        let (description, input_schema) = match self {
            ToolKind::Weather => (
                "Get weather of any city using OpenWeatherMap API.",
                json!({
                    "type": "object",
                    "properties": {"city": {"type": "string"}},
                    "required": ["city"]
                }),
            ),
            ToolKind::CurrentTime => (
                "Returns the current server time.",
                json!({"type": "object", "properties": {}}),
            ),
            ToolKind::CurrencyExchange => (
                "Fetch currency exchange rate from one currency to another.",
                json!({
                    "type": "object",
                    "properties": {
                        "from": {"type": "string"},
                        "to": {"type": "string"}
                    },
                    "required": ["from", "to"]
                }),
            ),
            ToolKind::WikiSummary => (
                "Fetch a Wikipedia summary for a topic.",
                json!({
                    "type": "object",
                    "properties": {"topic": {"type": "string"}},
                    "required": ["topic"]
                }),
            ),
        };

        ToolDescriptor {
            name: self.name().to_string(),
            description: description.to_string(),
            input_schema,
        }
    }
}

/// A failed backend fetch.
#[derive(Debug)]
struct FetchFailure {
    message: String,
    /// Parsed error body, when the backend sent one.
    body: Option<Value>,
}

impl FetchFailure {
    /// A string field from the error body, or the transport message.
    fn detail(&self, field: &str) -> &str {
        self.body
            .as_ref()
            .and_then(|body| body.get(field))
            .and_then(Value::as_str)
            .unwrap_or(&self.message)
    }
}

/// Executes tools against their HTTP backends.
#[derive(Debug, Clone)]
pub struct ToolBox {
    client: reqwest::Client,
    config: WorkerConfig,
}

impl ToolBox {
    pub fn new(config: WorkerConfig) -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("toolbridge/", env!("CARGO_PKG_VERSION")))
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(ToolError::Client)?;
        Ok(Self { client, config })
    }

    /// Run `kind` with `arguments`. `null` arguments count as an empty object.
    pub async fn call(&self, kind: ToolKind, arguments: &Value) -> Result<Value, ToolError> {
        let empty = Map::new();
        let args = match arguments {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => return Err(ToolError::InvalidArguments(type_name(other).to_string())),
        };

        debug!("{} called with {:?}", kind.name(), args);
        match kind {
            ToolKind::CurrentTime => Ok(current_time()),
            ToolKind::Weather => self.weather(args).await,
            ToolKind::CurrencyExchange => self.currency_exchange(args).await,
            ToolKind::WikiSummary => self.wiki_summary(args).await,
        }
    }

    async fn weather(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let Some(city) = string_arg(args, "city") else {
            return Ok(tool_failure("City is required."));
        };
        let Some(api_key) = self.config.weather_api_key.as_deref() else {
            return Ok(tool_failure("Weather API key is not configured."));
        };

        let mut url = endpoint(&self.config.weather_base_url, &["data", "2.5", "weather"])?;
        url.query_pairs_mut()
            .append_pair("q", city)
            .append_pair("appid", api_key)
            .append_pair("units", "metric");

        info!("Fetching weather for {}", city);
        match self.get_json(url).await {
            Ok(body) if body.get("main").is_some() => Ok(json!({
                "success": true,
                "city": city,
                "temperature": body["main"]["temp"],
                "condition": body["weather"][0]["description"],
                "humidity": body["main"]["humidity"],
                "feels_like": body["main"]["feels_like"],
            })),
            Ok(_) => Ok(tool_failure(
                "Could not fetch weather: unexpected response from weather service",
            )),
            Err(failure) => {
                warn!("Weather API error: {}", failure.message);
                Ok(tool_failure(format!(
                    "Could not fetch weather: {}",
                    failure.detail("message")
                )))
            }
        }
    }

    async fn wiki_summary(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let Some(topic) = string_arg(args, "topic") else {
            return Ok(tool_failure("Topic is required."));
        };

        let url = endpoint(
            &self.config.wiki_base_url,
            &["api", "rest_v1", "page", "summary", topic],
        )?;

        info!("Fetching Wikipedia summary for {}", topic);
        match self.get_json(url).await {
            Ok(body) => {
                if body.get("type").and_then(Value::as_str) == Some("disambiguation") {
                    return Ok(tool_failure("Topic is ambiguous. Try a more specific name."));
                }
                Ok(json!({
                    "success": true,
                    "title": body.get("title").cloned().unwrap_or(Value::Null),
                    "summary": body.get("extract").cloned().unwrap_or(Value::Null),
                    "url": body
                        .pointer("/content_urls/desktop/page")
                        .cloned()
                        .unwrap_or(Value::Null),
                }))
            }
            Err(failure) => {
                warn!("Wikipedia API error: {}", failure.message);
                Ok(tool_failure(format!(
                    "Could not fetch Wikipedia summary: {}",
                    failure.detail("title")
                )))
            }
        }
    }

    async fn currency_exchange(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let (Some(from), Some(to)) = (string_arg(args, "from"), string_arg(args, "to")) else {
            return Ok(tool_failure(
                "Both 'from' and 'to' currencies are required.",
            ));
        };
        let from = from.to_uppercase();
        let to = to.to_uppercase();

        let url = endpoint(&self.config.exchange_base_url, &["v6", "latest", from.as_str()])?;

        info!("Fetching exchange rate {} -> {}", from, to);
        let body = match self.get_json(url).await {
            Ok(body) => body,
            Err(failure) => {
                warn!("Currency API error: {}", failure.message);
                return Ok(tool_failure(format!(
                    "Error fetching currency exchange: {}",
                    failure.message
                )));
            }
        };

        let Some(rates) = body.get("rates").and_then(Value::as_object) else {
            return Ok(tool_failure("Invalid API response structure."));
        };
        let Some(rate) = rates.get(&to).filter(|rate| rate.is_number()) else {
            return Ok(tool_failure(format!("Currency {} not found.", to)));
        };

        Ok(json!({
            "success": true,
            "from": from,
            "to": to,
            "rate": rate,
            "result": rate,
            "date": body.get("time_last_update_utc").cloned().unwrap_or(Value::Null),
        }))
    }

    async fn get_json(&self, url: Url) -> Result<Value, FetchFailure> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| FetchFailure {
                message: e.to_string(),
                body: None,
            })?;

        let status = response.status();
        let body = response.json::<Value>().await;

        if !status.is_success() {
            return Err(FetchFailure {
                message: format!("Request failed with status code {}", status.as_u16()),
                body: body.ok(),
            });
        }

        body.map_err(|e| FetchFailure {
            message: format!("Invalid JSON from backend: {}", e),
            body: None,
        })
    }
}

/// Current local time in `M/D/YYYY, h:mm:ss AM` form.
fn current_time() -> Value {
    let now = chrono::Local::now();
    json!({
        "success": true,
        "time": now.format("%-m/%-d/%Y, %-I:%M:%S %p").to_string(),
    })
}

/// A non-blank string argument, trimmed.
fn string_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// `base` with `segments` appended as percent-encoded path segments.
fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, ToolError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ToolError::InvalidBaseUrl(base.clone()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
