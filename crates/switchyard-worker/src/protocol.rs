//! Worker wire protocol.
//!
//! Workers speak newline-delimited JSON over stdio. Commands carry a `type`
//! and an `id`; the worker answers each with a `response` line carrying the
//! same id. Every other line is an event. Events are normalized here into
//! [`WorkerEvent`] so nothing downstream cares whether a worker build emits
//! camelCase or snake_case field names.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use switchyard_core::ImageContent;

/// How a prompt sent to a mid-turn worker is merged into the turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamingBehavior {
    /// Inject into the current generation.
    Steer,
    /// Run after the current turn.
    FollowUp,
}

/// Image as the worker expects it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename = "image", rename_all = "camelCase")]
pub struct WireImage {
    /// Base64 payload.
    pub data: String,
    /// MIME type.
    pub mime_type: String,
}

impl From<&ImageContent> for WireImage {
    fn from(image: &ImageContent) -> Self {
        Self {
            data: image.data.clone(),
            mime_type: image.mime_type.clone(),
        }
    }
}

/// Command sent to a worker.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WorkerCommand {
    /// Start a turn, or inject into a running one when `streaming_behavior` is set.
    Prompt {
        /// Prompt text.
        message: String,
        /// Attached images.
        #[serde(skip_serializing_if = "Vec::is_empty")]
        images: Vec<WireImage>,
        /// Mid-turn merge behavior.
        #[serde(skip_serializing_if = "Option::is_none")]
        streaming_behavior: Option<StreamingBehavior>,
    },
    /// Queue a steering message for the running turn.
    Steer {
        /// Message text.
        message: String,
    },
    /// Queue a message for after the running turn.
    FollowUp {
        /// Message text.
        message: String,
    },
    /// Abort the running turn.
    Abort,
    /// Discard the conversation and start fresh.
    NewSession,
    /// Query worker state.
    GetState,
    /// Switch model.
    SetModel {
        /// Provider id.
        provider: String,
        /// Model id.
        model_id: String,
    },
    /// Set the thinking level.
    SetThinkingLevel {
        /// Level name.
        level: String,
    },
    /// Compact the conversation.
    Compact {
        /// Extra instructions for the summarizer.
        #[serde(skip_serializing_if = "Option::is_none")]
        custom_instructions: Option<String>,
    },
    /// Toggle automatic compaction.
    SetAutoCompaction {
        /// Enabled flag.
        enabled: bool,
    },
    /// Toggle automatic retries.
    SetAutoRetry {
        /// Enabled flag.
        enabled: bool,
    },
    /// Set how steering messages are delivered.
    SetSteeringMode {
        /// Mode name.
        mode: String,
    },
    /// Set how follow-up messages are delivered.
    SetFollowUpMode {
        /// Mode name.
        mode: String,
    },
}

impl WorkerCommand {
    /// Plain prompt for a new turn.
    pub fn prompt(message: impl Into<String>, images: &[ImageContent]) -> Self {
        Self::Prompt {
            message: message.into(),
            images: images.iter().map(WireImage::from).collect(),
            streaming_behavior: None,
        }
    }

    /// Wire `type` of this command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Prompt { .. } => "prompt",
            Self::Steer { .. } => "steer",
            Self::FollowUp { .. } => "follow_up",
            Self::Abort => "abort",
            Self::NewSession => "new_session",
            Self::GetState => "get_state",
            Self::SetModel { .. } => "set_model",
            Self::SetThinkingLevel { .. } => "set_thinking_level",
            Self::Compact { .. } => "compact",
            Self::SetAutoCompaction { .. } => "set_auto_compaction",
            Self::SetAutoRetry { .. } => "set_auto_retry",
            Self::SetSteeringMode { .. } => "set_steering_mode",
            Self::SetFollowUpMode { .. } => "set_follow_up_mode",
        }
    }
}

/// Encode a command with its correlation id as one line (without newline).
pub fn encode_request(id: &str, command: &WorkerCommand) -> Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(command)?;
    if let Value::Object(map) = &mut value {
        let _ = map.insert("id".to_string(), Value::String(id.to_string()));
    }
    serde_json::to_string(&value)
}

/// Acknowledgement of a command.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerResponse {
    /// Correlation id.
    pub id: Option<String>,
    /// Command type being acknowledged.
    pub command: String,
    /// Whether the command succeeded.
    pub success: bool,
    /// Command result.
    pub data: Option<Value>,
    /// Error text when `success` is false.
    pub error: Option<String>,
}

/// Kind of an assistant message delta.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeltaKind {
    /// Message started.
    Start,
    /// Text block started.
    TextStart,
    /// Text appended.
    TextDelta,
    /// Text block finished.
    TextEnd,
    /// Thinking block started.
    ThinkingStart,
    /// Thinking appended.
    ThinkingDelta,
    /// Thinking block finished.
    ThinkingEnd,
    /// Anything else, by wire name.
    Other(String),
}

/// One assistant-message streaming delta.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssistantDelta {
    /// Delta kind.
    pub kind: DeltaKind,
    /// Incremental text (`delta`, or `thinking` for thinking deltas).
    pub delta: Option<String>,
    /// Final block content on `text_end`.
    pub content: Option<String>,
    /// Full text of the partial message so far, when the worker sends it.
    pub partial_text: Option<String>,
}

/// Normalized worker event.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerEvent {
    /// Agent loop started.
    AgentStart,
    /// Assistant message delta.
    MessageUpdate(AssistantDelta),
    /// A message finished.
    MessageEnd {
        /// Stop reason of an assistant message.
        stop_reason: Option<String>,
        /// Provider error text, when the message ended in error.
        error_message: Option<String>,
    },
    /// Tool started.
    ToolExecutionStart {
        /// Tool call id.
        tool_call_id: Option<String>,
        /// Tool name.
        tool_name: String,
        /// Display label (`args.label`, else the tool name).
        label: String,
    },
    /// Tool finished.
    ToolExecutionEnd {
        /// Tool call id.
        tool_call_id: Option<String>,
        /// Tool name.
        tool_name: String,
        /// Whether the tool failed.
        is_error: bool,
    },
    /// Agent loop finished. Terminal event of a turn.
    AgentEnd,
    /// The worker asked for interactive input.
    ExtensionUiRequest {
        /// Request id to answer.
        id: String,
        /// UI method (`select`, `confirm`, ...).
        method: String,
        /// Options for `select`.
        options: Vec<String>,
    },
    /// The process exited. Synthesized by the client, never sent by workers.
    Exited {
        /// Exit code, if any.
        code: Option<i32>,
    },
    /// Unrecognized event, passed through.
    Other {
        /// Wire `type`.
        event_type: String,
        /// Raw payload.
        payload: Value,
    },
}

impl WorkerEvent {
    /// Whether this event ends a turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AgentEnd | Self::Exited { .. })
    }
}

/// A decoded stdout line.
#[derive(Clone, Debug, PartialEq)]
pub enum Incoming {
    /// Command acknowledgement.
    Response(WorkerResponse),
    /// Event.
    Event(WorkerEvent),
}

/// Decode one stdout line. Returns `None` for non-JSON noise.
pub fn decode_line(line: &str) -> Option<Incoming> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    if !value.is_object() {
        return None;
    }
    if value.get("type").and_then(Value::as_str) == Some("response") {
        let response = serde_json::from_value(value).ok()?;
        return Some(Incoming::Response(response));
    }
    Some(Incoming::Event(normalize_event(value)))
}

/// Map a raw event object onto [`WorkerEvent`], accepting either naming style.
pub fn normalize_event(value: Value) -> WorkerEvent {
    let event_type = str_field(&value, "type", "type").unwrap_or_default().to_string();
    match event_type.as_str() {
        "agent_start" => WorkerEvent::AgentStart,
        "agent_end" => WorkerEvent::AgentEnd,
        "message_update" => {
            let ame = field(&value, "assistantMessageEvent", "assistant_message_event")
                .cloned()
                .unwrap_or(Value::Null);
            WorkerEvent::MessageUpdate(normalize_delta(&ame))
        }
        "message_end" => {
            let message = value.get("message").unwrap_or(&Value::Null);
            let stop_reason = message
                .get("role")
                .and_then(Value::as_str)
                .filter(|role| *role == "assistant")
                .and_then(|_| str_field(message, "stopReason", "stop_reason"))
                .or_else(|| str_field(&value, "stopReason", "stop_reason"))
                .map(str::to_string);
            let error_message = str_field(message, "errorMessage", "error_message")
                .or_else(|| str_field(&value, "errorMessage", "error_message"))
                .map(str::to_string);
            WorkerEvent::MessageEnd {
                stop_reason,
                error_message,
            }
        }
        "tool_execution_start" => {
            let tool_name = str_field(&value, "toolName", "tool_name")
                .unwrap_or_default()
                .to_string();
            let label = value
                .get("args")
                .and_then(|a| a.get("label"))
                .and_then(Value::as_str)
                .filter(|l| !l.is_empty())
                .map_or_else(|| tool_name.clone(), str::to_string);
            WorkerEvent::ToolExecutionStart {
                tool_call_id: str_field(&value, "toolCallId", "tool_call_id").map(str::to_string),
                tool_name,
                label,
            }
        }
        "tool_execution_end" => WorkerEvent::ToolExecutionEnd {
            tool_call_id: str_field(&value, "toolCallId", "tool_call_id").map(str::to_string),
            tool_name: str_field(&value, "toolName", "tool_name")
                .unwrap_or_default()
                .to_string(),
            is_error: field(&value, "isError", "is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        "extension_ui_request" => WorkerEvent::ExtensionUiRequest {
            id: str_field(&value, "id", "id").unwrap_or_default().to_string(),
            method: str_field(&value, "method", "method")
                .unwrap_or_default()
                .to_string(),
            options: value
                .get("options")
                .and_then(Value::as_array)
                .map(|opts| {
                    opts.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        },
        _ => WorkerEvent::Other {
            event_type,
            payload: value,
        },
    }
}

fn normalize_delta(ame: &Value) -> AssistantDelta {
    let kind = match str_field(ame, "type", "type").unwrap_or_default() {
        "start" => DeltaKind::Start,
        "text_start" => DeltaKind::TextStart,
        "text_delta" => DeltaKind::TextDelta,
        "text_end" => DeltaKind::TextEnd,
        "thinking_start" => DeltaKind::ThinkingStart,
        "thinking_delta" => DeltaKind::ThinkingDelta,
        "thinking_end" => DeltaKind::ThinkingEnd,
        other => DeltaKind::Other(other.to_string()),
    };
    let delta = ame
        .get("delta")
        .and_then(Value::as_str)
        .filter(|d| !d.is_empty())
        .or_else(|| {
            (kind == DeltaKind::ThinkingDelta)
                .then(|| ame.get("thinking").and_then(Value::as_str))
                .flatten()
        })
        .map(str::to_string);
    AssistantDelta {
        kind,
        delta,
        content: ame.get("content").and_then(content_text),
        partial_text: ame.get("partial").and_then(|p| p.get("content")).and_then(content_text),
    }
}

/// Flatten a content value (string, or array of `{type: "text", text}` blocks).
fn content_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(blocks) => {
            let text: String = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    }
}

fn field<'a>(value: &'a Value, camel: &str, snake: &str) -> Option<&'a Value> {
    value.get(camel).or_else(|| value.get(snake))
}

fn str_field<'a>(value: &'a Value, camel: &str, snake: &str) -> Option<&'a str> {
    field(value, camel, snake).and_then(Value::as_str)
}

/// Headless answer to an `extension_ui_request`.
///
/// `select` picks the first option, `confirm` confirms, everything else is
/// cancelled so the worker never blocks on a human.
pub fn auto_ui_response(id: &str, method: &str, options: &[String]) -> Value {
    let mut map = Map::new();
    let _ = map.insert("type".into(), Value::from("extension_ui_response"));
    let _ = map.insert("id".into(), Value::from(id));
    match (method, options.first()) {
        ("select", Some(first)) => {
            let _ = map.insert("value".into(), Value::from(first.as_str()));
        }
        ("confirm", _) => {
            let _ = map.insert("confirmed".into(), Value::Bool(true));
        }
        _ => {
            let _ = map.insert("cancelled".into(), Value::Bool(true));
        }
    }
    Value::Object(map)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_prompt_with_id() {
        let cmd = WorkerCommand::Prompt {
            message: "hi".into(),
            images: vec![WireImage {
                data: "AAAA".into(),
                mime_type: "image/png".into(),
            }],
            streaming_behavior: Some(StreamingBehavior::FollowUp),
        };
        let line = encode_request("req_1", &cmd).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "prompt",
                "id": "req_1",
                "message": "hi",
                "images": [{"type": "image", "data": "AAAA", "mimeType": "image/png"}],
                "streamingBehavior": "followUp"
            })
        );
    }

    #[test]
    fn encode_unit_and_renamed_fields() {
        let abort: Value = serde_json::from_str(&encode_request("req_2", &WorkerCommand::Abort).unwrap()).unwrap();
        assert_eq!(abort, json!({"type": "abort", "id": "req_2"}));

        let set_model = WorkerCommand::SetModel {
            provider: "anthropic".into(),
            model_id: "claude".into(),
        };
        let value = serde_json::to_value(&set_model).unwrap();
        assert_eq!(value, json!({"type": "set_model", "provider": "anthropic", "modelId": "claude"}));
        assert_eq!(set_model.name(), "set_model");

        let plain = serde_json::to_value(WorkerCommand::prompt("x", &[])).unwrap();
        assert_eq!(plain, json!({"type": "prompt", "message": "x"}));
    }

    #[test]
    fn decode_response() {
        let line = r#"{"type":"response","id":"req_3","command":"get_state","success":true,"data":{"isStreaming":false}}"#;
        let Some(Incoming::Response(resp)) = decode_line(line) else {
            panic!("expected response");
        };
        assert_eq!(resp.id.as_deref(), Some("req_3"));
        assert!(resp.success);
        assert_eq!(resp.data.unwrap()["isStreaming"], false);
    }

    #[test]
    fn decode_ignores_noise() {
        assert!(decode_line("starting worker...").is_none());
        assert!(decode_line("42").is_none());
        assert!(decode_line("").is_none());
    }

    #[test]
    fn message_update_accepts_both_namings() {
        let camel = json!({"type": "message_update", "assistantMessageEvent": {"type": "text_delta", "delta": "Hel"}});
        let snake = json!({"type": "message_update", "assistant_message_event": {"type": "text_delta", "delta": "Hel"}});
        let expected = WorkerEvent::MessageUpdate(AssistantDelta {
            kind: DeltaKind::TextDelta,
            delta: Some("Hel".into()),
            content: None,
            partial_text: None,
        });
        assert_eq!(normalize_event(camel), expected);
        assert_eq!(normalize_event(snake), expected);
    }

    #[test]
    fn text_end_content_and_partial() {
        let event = json!({
            "type": "message_update",
            "assistantMessageEvent": {
                "type": "text_end",
                "content": [{"type": "text", "text": "Hello"}, {"type": "image"}, {"type": "text", "text": " world"}],
                "partial": {"content": [{"type": "text", "text": "Hello wor"}]}
            }
        });
        let WorkerEvent::MessageUpdate(delta) = normalize_event(event) else {
            panic!("expected message update");
        };
        assert_eq!(delta.kind, DeltaKind::TextEnd);
        assert_eq!(delta.content.as_deref(), Some("Hello world"));
        assert_eq!(delta.partial_text.as_deref(), Some("Hello wor"));
    }

    #[test]
    fn thinking_delta_falls_back_to_thinking_field() {
        let event = json!({"type": "message_update", "assistantMessageEvent": {"type": "thinking_delta", "thinking": "hmm"}});
        let WorkerEvent::MessageUpdate(delta) = normalize_event(event) else {
            panic!("expected message update");
        };
        assert_eq!(delta.delta.as_deref(), Some("hmm"));
    }

    #[test]
    fn tool_events_snake_case() {
        let start = json!({"type": "tool_execution_start", "tool_name": "bash", "tool_call_id": "t1", "args": {"label": "List files"}});
        assert_eq!(
            normalize_event(start),
            WorkerEvent::ToolExecutionStart {
                tool_call_id: Some("t1".into()),
                tool_name: "bash".into(),
                label: "List files".into(),
            }
        );
        let end = json!({"type": "tool_execution_end", "toolName": "bash", "toolCallId": "t1", "isError": true});
        assert_eq!(
            normalize_event(end),
            WorkerEvent::ToolExecutionEnd {
                tool_call_id: Some("t1".into()),
                tool_name: "bash".into(),
                is_error: true,
            }
        );
    }

    #[test]
    fn message_end_stop_reason_from_assistant_only() {
        let assistant = json!({"type": "message_end", "message": {"role": "assistant", "stopReason": "error", "errorMessage": "429"}});
        assert_eq!(
            normalize_event(assistant),
            WorkerEvent::MessageEnd {
                stop_reason: Some("error".into()),
                error_message: Some("429".into()),
            }
        );
        let user = json!({"type": "message_end", "message": {"role": "user", "stopReason": "stop"}});
        assert_eq!(
            normalize_event(user),
            WorkerEvent::MessageEnd {
                stop_reason: None,
                error_message: None,
            }
        );
    }

    #[test]
    fn unknown_event_passes_through() {
        let event = normalize_event(json!({"type": "auto_compaction_start"}));
        assert!(matches!(event, WorkerEvent::Other { ref event_type, .. } if event_type == "auto_compaction_start"));
        assert!(!event.is_terminal());
        assert!(WorkerEvent::AgentEnd.is_terminal());
    }

    #[test]
    fn ui_auto_responses() {
        let options = vec!["yes".to_string(), "no".to_string()];
        assert_eq!(
            auto_ui_response("u1", "select", &options),
            json!({"type": "extension_ui_response", "id": "u1", "value": "yes"})
        );
        assert_eq!(
            auto_ui_response("u2", "select", &[]),
            json!({"type": "extension_ui_response", "id": "u2", "cancelled": true})
        );
        assert_eq!(
            auto_ui_response("u3", "confirm", &[]),
            json!({"type": "extension_ui_response", "id": "u3", "confirmed": true})
        );
        assert_eq!(
            auto_ui_response("u4", "input", &[]),
            json!({"type": "extension_ui_response", "id": "u4", "cancelled": true})
        );
    }
}
