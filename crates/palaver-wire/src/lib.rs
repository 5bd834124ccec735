#![deny(unsafe_code)]

//! Wire-level message types for the palaver protocol.
//!
//! One JSON object per message, tagged by a `type` field. Calls and replies
//! are correlated through the call's globally-unique `id`; the `iid` field is
//! a process-local sequence number used only for ordering and debugging,
//! never for identity.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity block attached to messages, naming the sending endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub id: String,
}

impl Origin {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "origin:{}", self.id)
    }
}

/// The call a reply answers: the originating call's id and event name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRef {
    pub id: String,
    pub event: String,
}

/// The message a handshake-accept answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRef {
    pub id: String,
}

/// Protocol message.
///
/// The serde tag doubles as the wire-level `type` field, so the JSON shapes
/// are exactly `{"type":"call",...}`, `{"type":"reply",...}`,
/// `{"type":"handshake",...}`, `{"type":"handshake-accept",...}`,
/// `{"type":"ping"}` and `{"type":"pong"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// An outbound request, routed to zero or more remote handlers.
    Call {
        id: String,
        #[serde(rename = "iid")]
        seq: u64,
        event: String,
        payload: Value,
        origin: Origin,
    },
    /// A response to a call. `part` is zero-based and strictly increasing
    /// per call; exactly one reply per terminating handler carries
    /// `done = true`.
    Reply {
        id: String,
        #[serde(rename = "iid")]
        seq: u64,
        part: u64,
        done: bool,
        to: CallRef,
        origin: Origin,
        payload: Value,
    },
    /// Session-establishment request, sent once when a connection opens.
    Handshake {
        id: String,
        origin: Origin,
        payload: Value,
    },
    /// Session-establishment acknowledgement.
    HandshakeAccept {
        id: String,
        origin: Origin,
        to: PeerRef,
        payload: Value,
    },
    /// Liveness probe.
    Ping,
    /// Response to a ping.
    Pong,
}

impl Message {
    /// The message's own unique id, if its kind carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Message::Call { id, .. }
            | Message::Reply { id, .. }
            | Message::Handshake { id, .. }
            | Message::HandshakeAccept { id, .. } => Some(id),
            Message::Ping | Message::Pong => None,
        }
    }

    /// Wire name of this message's kind (the `type` tag).
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Call { .. } => "call",
            Message::Reply { .. } => "reply",
            Message::Handshake { .. } => "handshake",
            Message::HandshakeAccept { .. } => "handshake-accept",
            Message::Ping => "ping",
            Message::Pong => "pong",
        }
    }

    /// Check the shape contract for this message's declared kind.
    ///
    /// Typed decoding already rejects missing or mistyped fields; this
    /// enforces the value-level rules that the types cannot: ids, event
    /// names and origin ids must be non-empty.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let fail = |field| Err(ValidationError::new(self.kind(), field));
        match self {
            Message::Call {
                id, event, origin, ..
            } => {
                if id.is_empty() {
                    return fail("id");
                }
                if event.is_empty() {
                    return fail("event");
                }
                if origin.id.is_empty() {
                    return fail("origin.id");
                }
            }
            Message::Reply { id, to, origin, .. } => {
                if id.is_empty() {
                    return fail("id");
                }
                if origin.id.is_empty() {
                    return fail("origin.id");
                }
                if to.id.is_empty() {
                    return fail("to.id");
                }
                if to.event.is_empty() {
                    return fail("to.event");
                }
            }
            Message::Handshake { id, origin, .. } => {
                if id.is_empty() {
                    return fail("id");
                }
                if origin.id.is_empty() {
                    return fail("origin.id");
                }
            }
            Message::HandshakeAccept { id, origin, to, .. } => {
                if id.is_empty() {
                    return fail("id");
                }
                if origin.id.is_empty() {
                    return fail("origin.id");
                }
                if to.id.is_empty() {
                    return fail("to.id");
                }
            }
            Message::Ping | Message::Pong => {}
        }
        Ok(())
    }
}

/// A decoded message violates the shape contract for its declared kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Wire name of the offending message kind.
    pub kind: &'static str,
    /// The field that failed the contract.
    pub field: &'static str,
}

impl ValidationError {
    fn new(kind: &'static str, field: &'static str) -> Self {
        Self { kind, field }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} message has an invalid {}", self.kind, self.field)
    }
}

impl std::error::Error for ValidationError {}

/// Generate a fresh globally-unique message id.
pub fn new_message_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Per-session sequence counters: one for calls, one for replies.
///
/// Sequence numbers order messages of one kind within a single session; they
/// are deliberately not shared across sessions so that tests and embedders
/// never see cross-session interference.
#[derive(Debug, Default)]
pub struct SeqCounters {
    calls: AtomicU64,
    replies: AtomicU64,
}

impl SeqCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_call(&self) -> u64 {
        self.calls.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_reply(&self) -> u64 {
        self.replies.fetch_add(1, Ordering::Relaxed)
    }
}

/// Builds well-formed outgoing messages for one session.
///
/// Owns the session's sequence counters and stamps every message with the
/// local origin, so construction sites cannot get either wrong.
#[derive(Debug)]
pub struct MessageFactory {
    origin: Origin,
    seq: SeqCounters,
}

impl MessageFactory {
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            seq: SeqCounters::new(),
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Build a call for `event`. A missing payload is the JSON null.
    pub fn call(&self, event: impl Into<String>, payload: Value) -> Message {
        Message::Call {
            id: new_message_id(),
            seq: self.seq.next_call(),
            event: event.into(),
            payload,
            origin: self.origin.clone(),
        }
    }

    /// Build a reply to `call_id`/`event` carrying the given part index.
    pub fn reply(
        &self,
        to_id: impl Into<String>,
        to_event: impl Into<String>,
        part: u64,
        done: bool,
        payload: Value,
    ) -> Message {
        Message::Reply {
            id: new_message_id(),
            seq: self.seq.next_reply(),
            part,
            done,
            to: CallRef {
                id: to_id.into(),
                event: to_event.into(),
            },
            origin: self.origin.clone(),
            payload,
        }
    }

    pub fn handshake(&self, payload: Value) -> Message {
        Message::Handshake {
            id: new_message_id(),
            origin: self.origin.clone(),
            payload,
        }
    }

    /// Build the acknowledgement for a received handshake message.
    pub fn handshake_accept(&self, to_id: impl Into<String>, payload: Value) -> Message {
        Message::HandshakeAccept {
            id: new_message_id(),
            origin: self.origin.clone(),
            to: PeerRef { id: to_id.into() },
            payload,
        }
    }
}
