//! Conversation message model.
//!
//! History is append-only: once a message is committed it is never mutated
//! or removed. Assistant text being streamed lives in the reducer's open
//! buffer (see [`crate::core::conversation`]) and only becomes a `Message`
//! when the stream completes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ids;
use crate::core::tools::ToolName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn is_system(self) -> bool {
        self == Role::System
    }
}

/// A structured request for a tool, emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub tool_call_id: String,
    pub tool_name: ToolName,
    pub args: Value,
}

/// The outcome fed back into the conversation; `tool_call_id` matches a
/// preceding [`ToolCallRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultRecord {
    pub tool_call_id: String,
    pub tool_name: ToolName,
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

/// Message payloads. Untagged: plain text for user/system/assistant turns,
/// record sequences for tool traffic (told apart by their `args`/`result`
/// fields).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    ToolCalls(Vec<ToolCallRecord>),
    ToolResults(Vec<ToolResultRecord>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    fn new(role: Role, content: MessageContent) -> Self {
        Self {
            id: ids::message_id(),
            role,
            content,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, MessageContent::Text(content.into()))
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, MessageContent::Text(content.into()))
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, MessageContent::Text(content.into()))
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCallRecord>) -> Self {
        Self::new(Role::Assistant, MessageContent::ToolCalls(calls))
    }

    pub fn tool_results(results: Vec<ToolResultRecord>) -> Self {
        Self::new(Role::Tool, MessageContent::ToolResults(results))
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn tool_calls(&self) -> Option<&[ToolCallRecord]> {
        match &self.content {
            MessageContent::ToolCalls(calls) => Some(calls),
            _ => None,
        }
    }

    pub fn tool_results_content(&self) -> Option<&[ToolResultRecord]> {
        match &self.content {
            MessageContent::ToolResults(results) => Some(results),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_get_unique_ids() {
        let first = Message::user("hello");
        let second = Message::user("hello");
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn tool_records_serialize_with_wire_field_names() {
        let record = ToolCallRecord {
            tool_call_id: "call-1".to_string(),
            tool_name: ToolName::ShowStockPrice,
            args: json!({"symbol": "AAPL", "price": 150.0, "delta": 1.2}),
        };
        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(value["toolCallId"], "call-1");
        assert_eq!(value["toolName"], "showStockPrice");
        assert!(value["args"].is_object());
    }

    #[test]
    fn untagged_content_round_trips_each_shape() {
        let text = MessageContent::Text("plain".to_string());
        let calls = MessageContent::ToolCalls(vec![ToolCallRecord {
            tool_call_id: "call-1".to_string(),
            tool_name: ToolName::ListStocks,
            args: json!({"stocks": []}),
        }]);
        let results = MessageContent::ToolResults(vec![ToolResultRecord {
            tool_call_id: "call-1".to_string(),
            tool_name: ToolName::ListStocks,
            result: json!([]),
            is_error: None,
        }]);

        for content in [text, calls, results] {
            let encoded = serde_json::to_string(&content).expect("serialize");
            let decoded: MessageContent = serde_json::from_str(&encoded).expect("deserialize");
            assert_eq!(decoded, content);
        }
    }

    #[test]
    fn is_error_is_omitted_when_unset() {
        let record = ToolResultRecord {
            tool_call_id: "call-1".to_string(),
            tool_name: ToolName::GetEvents,
            result: json!([]),
            is_error: None,
        };
        let value = serde_json::to_value(&record).expect("serialize");
        assert!(value.get("isError").is_none());
    }
}
