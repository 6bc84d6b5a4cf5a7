//! Inbound message model.
//!
//! Channel adapters translate their platform payloads into an
//! [`InboundMessage`] and hand it to the dispatcher. The gateway only talks
//! back through the [`Responder`] attached to the message and never touches
//! channel-specific transport.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::SessionKey;

/// Kind of conversation a message arrived in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    /// One-to-one direct message.
    #[default]
    Dm,
    /// Group chat (including forum supergroups).
    Group,
    /// Broadcast-style channel.
    Channel,
}

/// Where an inbound message came from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageSource {
    /// Channel name, e.g. `telegram`, `discord`, `webhook`.
    pub channel: String,
    /// Conversation kind.
    pub chat_type: ChatType,
    /// Channel-native chat identifier.
    pub chat_id: String,
    /// Channel-native sender identifier.
    pub sender_id: String,
    /// Display name of the sender.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Bot account the message was received on (multi-account channels).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Guild/server identifier (discord-style channels).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<String>,
    /// Forum topic identifier inside a group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,
    /// Thread identifier inside a channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl MessageSource {
    /// Direct-message source.
    pub fn dm(channel: impl Into<String>, sender_id: impl Into<String>) -> Self {
        let sender_id = sender_id.into();
        Self {
            channel: channel.into(),
            chat_type: ChatType::Dm,
            chat_id: sender_id.clone(),
            sender_id,
            ..Self::default()
        }
    }

    /// Group-chat source.
    pub fn group(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_type: ChatType::Group,
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            ..Self::default()
        }
    }

    /// Whether this is a direct message.
    pub fn is_dm(&self) -> bool {
        self.chat_type == ChatType::Dm
    }
}

/// Base64-encoded image attached to a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageContent {
    /// Base64 payload.
    pub data: String,
    /// MIME type, e.g. `image/png`.
    pub mime_type: String,
}

/// Errors a channel adapter can report back when delivering output.
#[derive(Debug, Error)]
pub enum ResponderError {
    /// The platform rejected or failed the delivery.
    #[error("channel delivery failed: {0}")]
    Delivery(String),
    /// The conversation can no longer receive output.
    #[error("channel closed")]
    Closed,
}

/// Outbound half of a channel adapter, scoped to one inbound message.
#[async_trait]
pub trait Responder: Send + Sync {
    /// Deliver a reply to the conversation.
    async fn respond(&self, text: &str) -> Result<(), ResponderError>;

    /// Toggle the platform typing indicator. Default: no-op.
    async fn set_typing(&self, _typing: bool) -> Result<(), ResponderError> {
        Ok(())
    }
}

/// One unit of inbound work.
#[derive(Clone)]
pub struct InboundMessage {
    /// Origin of the message.
    pub source: MessageSource,
    /// Pre-resolved session key. When `None` the router derives one.
    pub session_key: Option<SessionKey>,
    /// Message text.
    pub text: String,
    /// Attached images.
    pub images: Vec<ImageContent>,
    /// Receive time.
    pub received_at: DateTime<Utc>,
    responder: Arc<dyn Responder>,
}

impl InboundMessage {
    /// Create a message with no images and no pre-resolved session key.
    pub fn new(source: MessageSource, text: impl Into<String>, responder: Arc<dyn Responder>) -> Self {
        Self {
            source,
            session_key: None,
            text: text.into(),
            images: Vec::new(),
            received_at: Utc::now(),
            responder,
        }
    }

    /// Attach images.
    #[must_use]
    pub fn with_images(mut self, images: Vec<ImageContent>) -> Self {
        self.images = images;
        self
    }

    /// Pin the session key instead of letting the router derive it.
    #[must_use]
    pub fn with_session_key(mut self, key: SessionKey) -> Self {
        self.session_key = Some(key);
        self
    }

    /// Deliver a reply through the originating channel.
    pub async fn respond(&self, text: &str) -> Result<(), ResponderError> {
        self.responder.respond(text).await
    }

    /// Toggle the typing indicator on the originating channel.
    pub async fn set_typing(&self, typing: bool) -> Result<(), ResponderError> {
        self.responder.set_typing(typing).await
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("source", &self.source)
            .field("session_key", &self.session_key)
            .field("text_len", &self.text.len())
            .field("images", &self.images.len())
            .finish_non_exhaustive()
    }
}

/// Test helpers shared by downstream crates.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::{Responder, ResponderError, async_trait};
    use std::sync::Mutex;

    /// Responder that records every reply and typing toggle.
    #[derive(Debug, Default)]
    pub struct RecordingResponder {
        replies: Mutex<Vec<String>>,
        typing: Mutex<Vec<bool>>,
    }

    impl RecordingResponder {
        /// Replies delivered so far.
        pub fn replies(&self) -> Vec<String> {
            self.replies
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        }

        /// Typing toggles in order.
        pub fn typing(&self) -> Vec<bool> {
            self.typing
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait]
    impl Responder for RecordingResponder {
        async fn respond(&self, text: &str) -> Result<(), ResponderError> {
            self.replies
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(text.to_owned());
            Ok(())
        }

        async fn set_typing(&self, typing: bool) -> Result<(), ResponderError> {
            self.typing
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(typing);
            Ok(())
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::testing::RecordingResponder;
    use super::*;

    #[test]
    fn source_deserializes_camel_case_with_defaults() {
        let json = r#"{"channel":"telegram","chatType":"group","chatId":"-100","senderId":"42","topicId":"7"}"#;
        let source: MessageSource = serde_json::from_str(json).unwrap();
        assert_eq!(source.chat_type, ChatType::Group);
        assert_eq!(source.topic_id.as_deref(), Some("7"));
        assert!(source.account_id.is_none());
        assert!(!source.is_dm());
    }

    #[test]
    fn dm_constructor_uses_sender_as_chat() {
        let source = MessageSource::dm("discord", "u1");
        assert!(source.is_dm());
        assert_eq!(source.chat_id, "u1");
    }

    #[tokio::test]
    async fn respond_goes_through_responder() {
        let responder = Arc::new(RecordingResponder::default());
        let msg = InboundMessage::new(MessageSource::dm("cli", "me"), "hi", responder.clone());
        msg.set_typing(true).await.unwrap();
        msg.respond("hello").await.unwrap();
        assert_eq!(responder.replies(), vec!["hello".to_string()]);
        assert_eq!(responder.typing(), vec![true]);
    }

    #[test]
    fn debug_hides_text() {
        let msg = InboundMessage::new(
            MessageSource::dm("cli", "me"),
            "secret",
            Arc::new(RecordingResponder::default()),
        );
        let dbg = format!("{msg:?}");
        assert!(!dbg.contains("secret"));
        assert!(dbg.contains("text_len"));
    }
}
