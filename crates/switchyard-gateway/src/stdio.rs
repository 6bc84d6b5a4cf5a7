//! Built-in `stdio` channel.
//!
//! Each stdin line is one inbound message: either a JSON object
//!
//! ```text
//! {"text": "hi", "source": {"channel": "stdio", "chatType": "group", "chatId": "g1", "senderId": "me"}}
//! ```
//!
//! or plain text, which is sent as a direct message from the local user.
//! Lines starting with `/mode` or `/reset` are control commands for the
//! session the line would have been routed to.
//!
//! Replies and typing changes go to stdout as JSON lines.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use switchyard_core::{ImageContent, InboundMessage, MessageSource, Responder, ResponderError, SessionKey};
use switchyard_runtime::{Gateway, SessionRouter};
use switchyard_settings::MessageMode;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Channel name used for stdin messages.
pub const STDIO_CHANNEL: &str = "stdio";
/// Sender id of plain-text lines.
pub const LOCAL_SENDER: &str = "local";

/// JSON form of an inbound stdin line.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireMessage {
    /// Message text.
    pub text: String,
    /// Origin. Defaults to a DM from the local user.
    pub source: Option<MessageSource>,
    /// Explicit session key.
    pub session_key: Option<SessionKey>,
    /// Attached images.
    pub images: Vec<ImageContent>,
}

impl WireMessage {
    fn source(&self) -> MessageSource {
        self.source
            .clone()
            .unwrap_or_else(|| MessageSource::dm(STDIO_CHANNEL, LOCAL_SENDER))
    }
}

/// Control commands accepted on stdin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Control {
    /// `/mode <steer|follow-up|interrupt|default>`.
    Mode(Option<MessageMode>),
    /// `/reset`.
    Reset,
}

/// One parsed stdin line.
#[derive(Debug)]
pub enum StdinLine {
    /// Work for the gateway.
    Message(WireMessage),
    /// Session control.
    Control(WireMessage, Control),
}

/// Parse a line. Blank lines yield `None`; malformed control commands yield
/// an error string for the user.
pub fn parse_line(line: &str) -> Option<Result<StdinLine, String>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let wire = if line.starts_with('{') {
        match serde_json::from_str::<WireMessage>(line) {
            Ok(wire) => wire,
            Err(e) => return Some(Err(format!("invalid message JSON: {e}"))),
        }
    } else {
        WireMessage {
            text: line.to_string(),
            ..WireMessage::default()
        }
    };
    Some(match parse_control(&wire.text) {
        Some(Ok(control)) => Ok(StdinLine::Control(wire, control)),
        Some(Err(e)) => Err(e),
        None => Ok(StdinLine::Message(wire)),
    })
}

fn parse_control(text: &str) -> Option<Result<Control, String>> {
    let mut words = text.split_whitespace();
    match words.next()? {
        "/reset" => Some(Ok(Control::Reset)),
        "/mode" => Some(match words.next() {
            Some("default") => Ok(Control::Mode(None)),
            Some(mode) => mode.parse::<MessageMode>().map(|m| Control::Mode(Some(m))),
            None => Err("usage: /mode <steer|follow-up|interrupt|default>".to_string()),
        }),
        _ => None,
    }
}

/// A line written to stdout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OutputLine {
    /// Reply to a conversation.
    Reply {
        /// Conversation the reply belongs to.
        chat_id: String,
        /// Reply text.
        text: String,
    },
    /// Typing indicator change.
    Typing {
        /// Conversation.
        chat_id: String,
        /// Indicator state.
        on: bool,
    },
    /// Control command result or input error.
    Notice {
        /// Message for the operator.
        text: String,
    },
}

/// Responder that forwards to the stdout writer task.
#[derive(Debug)]
pub struct StdoutResponder {
    chat_id: String,
    tx: mpsc::UnboundedSender<OutputLine>,
}

impl StdoutResponder {
    /// Responder for `chat_id`.
    pub fn new(chat_id: impl Into<String>, tx: mpsc::UnboundedSender<OutputLine>) -> Self {
        Self {
            chat_id: chat_id.into(),
            tx,
        }
    }
}

#[async_trait]
impl Responder for StdoutResponder {
    async fn respond(&self, text: &str) -> Result<(), ResponderError> {
        self.tx
            .send(OutputLine::Reply {
                chat_id: self.chat_id.clone(),
                text: text.to_string(),
            })
            .map_err(|_| ResponderError::Closed)
    }

    async fn set_typing(&self, typing: bool) -> Result<(), ResponderError> {
        self.tx
            .send(OutputLine::Typing {
                chat_id: self.chat_id.clone(),
                on: typing,
            })
            .map_err(|_| ResponderError::Closed)
    }
}

/// Write output lines as JSON until every sender is gone.
pub fn spawn_writer<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<OutputLine>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let mut json = match serde_json::to_string(&line) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "failed to encode output line");
                    continue;
                }
            };
            json.push('\n');
            if let Err(e) = writer.write_all(json.as_bytes()).await {
                warn!(error = %e, "stdout closed");
                break;
            }
            let _ = writer.flush().await;
        }
    })
}

/// Read stdin lines and dispatch them until EOF or cancellation.
pub async fn run<R>(gateway: Gateway, reader: R, tx: mpsc::UnboundedSender<OutputLine>, cancel: CancellationToken)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("stdin closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                break;
            }
        };
        match parse_line(&line) {
            None => {}
            Some(Err(e)) => notice(&tx, e),
            Some(Ok(StdinLine::Message(wire))) => {
                let source = wire.source();
                let responder = Arc::new(StdoutResponder::new(source.chat_id.clone(), tx.clone()));
                let mut message = InboundMessage::new(source, wire.text, responder).with_images(wire.images);
                if let Some(key) = wire.session_key {
                    message = message.with_session_key(key);
                }
                let outcome = gateway.dispatch(message).await;
                debug!(?outcome, "stdin message dispatched");
            }
            Some(Ok(StdinLine::Control(wire, control))) => {
                let text = apply_control(&gateway, &wire, control).await;
                notice(&tx, text);
            }
        }
    }
}

async fn apply_control(gateway: &Gateway, wire: &WireMessage, control: Control) -> String {
    let session_key = match &wire.session_key {
        Some(key) => key.clone(),
        None => {
            let settings = gateway.settings();
            SessionRouter::new(&settings)
                .route(&wire.source(), &wire.text, None)
                .session_key
        }
    };
    match control {
        Control::Mode(mode) => {
            if gateway.set_mode_override(&session_key, mode) {
                let label = mode.map_or("default", MessageMode::as_str);
                format!("mode for {session_key} set to {label}")
            } else {
                format!("no active session {session_key}")
            }
        }
        Control::Reset => match gateway.reset_session(&session_key).await {
            Ok(cleared) => format!("session {session_key} reset ({cleared} queued messages dropped)"),
            Err(e) => format!("reset failed: {e}"),
        },
    }
}

fn notice(tx: &mpsc::UnboundedSender<OutputLine>, text: String) {
    let _ = tx.send(OutputLine::Notice { text });
}

/// Resolve once no turn is queued or running.
pub async fn wait_idle(gateway: &Gateway, poll: Duration) {
    loop {
        let stats = gateway.stats();
        let busy = stats.queue.details.iter().any(|s| s.processing);
        if !busy && stats.queue.total_pending == 0 && stats.pool.active == 0 && stats.waiting.waiting == 0 {
            return;
        }
        tokio::time::sleep(poll).await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
