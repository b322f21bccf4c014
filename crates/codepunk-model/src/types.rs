use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ─── Message model ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content part within a message.
///
/// A message carries an ordered list of parts so one assistant turn can mix
/// text with several tool calls. `ToolResult` parts may only appear in
/// user/tool-role messages and `ToolCall` parts only in assistant messages;
/// [`Message::validate`] checks this pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text {
        content: String,
    },
    ToolCall {
        /// Provider-assigned id, unique within the assistant turn.
        id: String,
        name: String,
        /// Fully assembled JSON argument object.
        arguments: Value,
    },
    ToolResult {
        /// Must match a preceding `ToolCall::id` in the same conversation.
        tool_call_id: String,
        content: String,
        is_error: bool,
    },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

/// One immutable conversation entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub parts: Vec<MessagePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn new(session_id: impl Into<String>, role: Role, parts: Vec<MessagePart>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role,
            parts,
            model_id: None,
            provider_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn system(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            session_id,
            Role::System,
            vec![MessagePart::Text {
                content: text.into(),
            }],
        )
    }

    pub fn user(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            session_id,
            Role::User,
            vec![MessagePart::Text {
                content: text.into(),
            }],
        )
    }

    pub fn assistant(session_id: impl Into<String>, parts: Vec<MessagePart>) -> Self {
        Self::new(session_id, Role::Assistant, parts)
    }

    pub fn assistant_text(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::assistant(
            session_id,
            vec![MessagePart::Text {
                content: text.into(),
            }],
        )
    }

    /// A tool-role message carrying the results of one iteration's tool calls.
    pub fn tool_results(session_id: impl Into<String>, parts: Vec<MessagePart>) -> Self {
        Self::new(session_id, Role::Tool, parts)
    }

    pub fn with_model(mut self, provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self.model_id = Some(model_id.into());
        self
    }

    /// Concatenation of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { content } => Some(content.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Tool calls carried by this message, in part order.
    pub fn tool_calls(&self) -> Vec<ToolCallPart> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::ToolCall {
                    id,
                    name,
                    arguments,
                } => Some(ToolCallPart {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, MessagePart::ToolCall { .. }))
    }

    pub fn has_tool_results(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, MessagePart::ToolResult { .. }))
    }

    /// Check the role/part pairing invariant.
    ///
    /// `ToolCall` parts are only valid in assistant messages; `ToolResult`
    /// parts only in user- or tool-role messages.
    pub fn validate(&self) -> Result<(), String> {
        for part in &self.parts {
            match part {
                MessagePart::ToolCall { .. } if self.role != Role::Assistant => {
                    return Err(format!(
                        "tool_call part in {:?}-role message {}",
                        self.role, self.id
                    ));
                }
                MessagePart::ToolResult { .. }
                    if !matches!(self.role, Role::User | Role::Tool) =>
                {
                    return Err(format!(
                        "tool_result part in {:?}-role message {}",
                        self.role, self.id
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// ─── Requests ─────────────────────────────────────────────────────────────────

/// A tool schema advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the argument object.
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormatKind {
    JsonSchema,
    JsonObject,
}

/// Structured-output request. For `JsonSchema` the schema is embedded into a
/// provider-side instruction block; `JsonObject` asks for any JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    pub kind: ResponseFormatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<Value>,
}

/// A fully shaped completion request handed to a provider.
#[derive(Debug, Clone, Serialize)]
pub struct LlmRequest {
    pub model_id: String,
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub response_format: Option<ResponseFormat>,
    /// Attach ephemeral cache-control markers to the system blocks and the
    /// last tool definition.
    pub use_ephemeral_cache: bool,
    /// Stable identifier for providers that key prompt caches explicitly.
    pub system_prompt_cache_id: Option<String>,
}

impl Default for LlmRequest {
    fn default() -> Self {
        Self {
            model_id: String::new(),
            messages: Vec::new(),
            system_prompt: None,
            tools: Vec::new(),
            max_tokens: 4096,
            temperature: 0.2,
            response_format: None,
            use_ephemeral_cache: false,
            system_prompt_cache_id: None,
        }
    }
}

// ─── Responses & stream chunks ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    MaxTokens,
    ToolCall,
    ContentFilter,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,
}

/// Provider-reported prompt-cache activity for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptCacheInfo {
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

/// A model-initiated tool invocation with fully assembled arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPart {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One normalized streaming event.
///
/// Any subset of the fields may be present; `is_complete` marks the terminal
/// chunk of a stream. A `tool_call` is emitted only once its argument JSON
/// has been fully assembled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmStreamChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_delta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default)]
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_cache_info: Option<PromptCacheInfo>,
    /// Tag for out-of-band provider events (e.g. server-tool results).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
}

impl LlmStreamChunk {
    pub fn content(delta: impl Into<String>) -> Self {
        Self {
            content_delta: Some(delta.into()),
            ..Self::default()
        }
    }

    pub fn tool(call: ToolCallPart) -> Self {
        Self {
            tool_call: Some(call),
            ..Self::default()
        }
    }
}

/// A complete (non-streaming or fully collected) provider response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallPart>,
    pub usage: Option<Usage>,
    pub finish_reason: FinishReason,
    pub model_id: String,
    pub provider: String,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Construction ─────────────────────────────────────────────────────────

    #[test]
    fn user_message_has_role_and_text() {
        let m = Message::user("s1", "hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.text(), "hello");
        assert_eq!(m.session_id, "s1");
    }

    #[test]
    fn message_ids_are_unique() {
        let a = Message::user("s", "x");
        let b = Message::user("s", "x");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn assistant_text_concatenates_text_parts() {
        let m = Message::assistant(
            "s",
            vec![
                MessagePart::Text {
                    content: "Hi ".into(),
                },
                MessagePart::ToolCall {
                    id: "tc1".into(),
                    name: "read_file".into(),
                    arguments: json!({"path": "a.txt"}),
                },
                MessagePart::Text {
                    content: "there".into(),
                },
            ],
        );
        assert_eq!(m.text(), "Hi there");
    }

    #[test]
    fn tool_calls_accessor_preserves_order() {
        let m = Message::assistant(
            "s",
            vec![
                MessagePart::ToolCall {
                    id: "a".into(),
                    name: "one".into(),
                    arguments: json!({}),
                },
                MessagePart::ToolCall {
                    id: "b".into(),
                    name: "two".into(),
                    arguments: json!({}),
                },
            ],
        );
        let calls = m.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "a");
        assert_eq!(calls[1].id, "b");
    }

    #[test]
    fn with_model_sets_provider_and_model() {
        let m = Message::assistant_text("s", "x").with_model("anthropic", "claude-sonnet-4-5");
        assert_eq!(m.provider_id.as_deref(), Some("anthropic"));
        assert_eq!(m.model_id.as_deref(), Some("claude-sonnet-4-5"));
    }

    // ── Invariant validation ──────────────────────────────────────────────────

    #[test]
    fn tool_call_in_assistant_message_is_valid() {
        let m = Message::assistant(
            "s",
            vec![MessagePart::ToolCall {
                id: "tc".into(),
                name: "shell".into(),
                arguments: json!({}),
            }],
        );
        assert!(m.validate().is_ok());
    }

    #[test]
    fn tool_call_in_user_message_is_invalid() {
        let mut m = Message::user("s", "x");
        m.parts.push(MessagePart::ToolCall {
            id: "tc".into(),
            name: "shell".into(),
            arguments: json!({}),
        });
        assert!(m.validate().is_err());
    }

    #[test]
    fn tool_result_in_tool_message_is_valid() {
        let m = Message::tool_results(
            "s",
            vec![MessagePart::ToolResult {
                tool_call_id: "tc".into(),
                content: "ok".into(),
                is_error: false,
            }],
        );
        assert!(m.validate().is_ok());
    }

    #[test]
    fn tool_result_in_assistant_message_is_invalid() {
        let mut m = Message::assistant_text("s", "x");
        m.parts.push(MessagePart::ToolResult {
            tool_call_id: "tc".into(),
            content: "out".into(),
            is_error: false,
        });
        assert!(m.validate().is_err());
    }

    // ── Serialization ─────────────────────────────────────────────────────────

    #[test]
    fn message_part_round_trips_through_json() {
        let p = MessagePart::ToolCall {
            id: "tc1".into(),
            name: "grep".into(),
            arguments: json!({"pattern": "fn main"}),
        };
        let text = serde_json::to_string(&p).unwrap();
        let back: MessagePart = serde_json::from_str(&text).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn message_part_uses_snake_case_tags() {
        let p = MessagePart::ToolResult {
            tool_call_id: "tc".into(),
            content: "x".into(),
            is_error: true,
        };
        let text = serde_json::to_string(&p).unwrap();
        assert!(text.contains("\"tool_result\""), "{text}");
    }

    #[test]
    fn image_description_omitted_when_none() {
        let p = MessagePart::Image {
            url: "https://example.com/a.png".into(),
            description: None,
        };
        let text = serde_json::to_string(&p).unwrap();
        assert!(!text.contains("description"), "{text}");
    }

    #[test]
    fn finish_reason_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&FinishReason::MaxTokens).unwrap(),
            "\"max_tokens\""
        );
    }

    #[test]
    fn default_request_has_documented_limits() {
        let r = LlmRequest::default();
        assert_eq!(r.max_tokens, 4096);
        assert!(!r.use_ephemeral_cache);
    }
}
