//! Data models shared by the bridge, the worker, and LLM-facing callers.
//!
//! Tool results are opaque JSON objects; the only field anything here looks
//! at is `success`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::jsonrpc::JsonRpcRequest;

/// A tool as advertised by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Whether a tool result reports success.
///
/// Anything other than `"success": true` counts as failure.
pub fn is_success(result: &Value) -> bool {
    result.get("success").and_then(Value::as_bool).unwrap_or(false)
}

/// A failed tool result: `{"success": false, "error": message}`.
pub fn tool_failure(message: impl Into<String>) -> Value {
    json!({"success": false, "error": message.into()})
}

/// Errors in tool calls proposed by an LLM.
///
/// These are client-input errors: the request never reaches the worker.
#[derive(Debug, Error)]
pub enum ToolInvocationError {
    #[error("Tool name is empty")]
    MissingName,

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(#[source] serde_json::Error),

    #[error("Tool arguments must be a JSON object")]
    ArgumentsNotObject,
}

/// A tool call proposed by an LLM, with its argument string already parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: Value,
}

impl ToolInvocation {
    /// Parse an LLM tool call. An empty or blank argument string means no
    /// arguments.
    pub fn parse(name: &str, arguments: &str) -> Result<Self, ToolInvocationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ToolInvocationError::MissingName);
        }

        let arguments = if arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(arguments).map_err(ToolInvocationError::InvalidArguments)?
        };
        if !arguments.is_object() {
            return Err(ToolInvocationError::ArgumentsNotObject);
        }

        Ok(Self {
            name: name.to_string(),
            arguments,
        })
    }

    /// The `tools/call` request for this invocation (no id; the channel
    /// assigns one).
    pub fn into_request(self) -> JsonRpcRequest {
        JsonRpcRequest::new(
            "tools/call",
            json!({"name": self.name, "arguments": self.arguments}),
        )
    }
}

/// Pull the tool result out of a bridge response
/// (`result.content[0].json`).
///
/// JSON-RPC errors and malformed responses become a failed tool result, so
/// callers always get something with a `success` flag.
pub fn extract_tool_result(response: &Value) -> Value {
    if let Some(error) = response.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error");
        let detail = error
            .get("data")
            .and_then(|data| data.get("message"))
            .and_then(Value::as_str);
        return match detail {
            Some(detail) => tool_failure(format!("{}: {}", message, detail)),
            None => tool_failure(message),
        };
    }

    response
        .pointer("/result/content/0/json")
        .cloned()
        .unwrap_or_else(|| tool_failure("Worker response has no tool content"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_descriptor_uses_camel_case_schema() {
        let descriptor = ToolDescriptor {
            name: "getCurrentTime".to_string(),
            description: "Returns the current server time.".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        };
        let value = serde_json::to_value(&descriptor).unwrap();
        assert!(value.get("inputSchema").is_some());
        assert!(value.get("input_schema").is_none());
    }

    #[test]
    fn test_is_success() {
        assert!(is_success(&json!({"success": true, "time": "now"})));
        assert!(!is_success(&json!({"success": false, "error": "x"})));
        assert!(!is_success(&json!({"success": "yes"})));
        assert!(!is_success(&json!({})));
    }

    #[test]
    fn test_parse_invocation() {
        let invocation = ToolInvocation::parse("getWeather", r#"{"city":"Oslo"}"#).unwrap();
        assert_eq!(invocation.arguments, json!({"city": "Oslo"}));

        let request = invocation.into_request();
        assert_eq!(request.method, "tools/call");
        assert_eq!(
            request.params,
            Some(json!({"name": "getWeather", "arguments": {"city": "Oslo"}}))
        );
    }

    #[test]
    fn test_parse_invocation_empty_arguments() {
        let invocation = ToolInvocation::parse("getCurrentTime", "").unwrap();
        assert_eq!(invocation.arguments, json!({}));
    }

    #[test]
    fn test_parse_invocation_rejects_bad_input() {
        assert!(matches!(
            ToolInvocation::parse("getWeather", "{city: Oslo"),
            Err(ToolInvocationError::InvalidArguments(_))
        ));
        assert!(matches!(
            ToolInvocation::parse("getWeather", "[1, 2]"),
            Err(ToolInvocationError::ArgumentsNotObject)
        ));
        assert!(matches!(
            ToolInvocation::parse("  ", "{}"),
            Err(ToolInvocationError::MissingName)
        ));
    }

    #[test]
    fn test_extract_tool_result() {
        let response = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"content": [{"type": "json", "json": {"success": true, "time": "9:00"}}]}
        });
        assert_eq!(
            extract_tool_result(&response),
            json!({"success": true, "time": "9:00"})
        );
    }

    #[test]
    fn test_extract_tool_result_from_error() {
        let response = json!({
            "id": 1,
            "error": {"code": -32000, "message": "Tool execution error", "data": {"message": "boom"}}
        });
        assert_eq!(
            extract_tool_result(&response),
            json!({"success": false, "error": "Tool execution error: boom"})
        );

        let response = json!({"id": 1, "error": {"code": -32601, "message": "Unknown tool: x"}});
        assert_eq!(
            extract_tool_result(&response),
            json!({"success": false, "error": "Unknown tool: x"})
        );

        assert!(!is_success(&extract_tool_result(&json!({"id": 1, "result": {}}))));
    }
}
