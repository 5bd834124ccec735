#![deny(unsafe_code)]

//! Bidirectional call/reply correlation over an injected transport.
//!
//! A [`Session`] turns an ordered stream of inbound messages into matched
//! responses for outstanding local calls, and turns inbound calls into one
//! or more locally-produced replies. Session establishment is gated by a
//! handshake exchange and the link is probed by a ping/pong heartbeat — all
//! multiplexed over the same message stream.
//!
//! The session never owns a connection. It is constructed with a
//! [`Transport`] capability (send a message) and the transport collaborator
//! feeds received messages back through [`Session::dispatch`]. See
//! `palaver-stream` for a byte-stream transport.
//!
//! ```ignore
//! let (session, mut events) = Session::new(Origin::new("cli-1"), transport, SessionConfig::default())?;
//!
//! // Handle incoming calls.
//! session.on("order-milk", |payload, _replier| async move {
//!     serde_json::json!({ "id": "123", "total": "$123.00" })
//! });
//!
//! // Establish the session, then call out.
//! session.open().await?;
//! let handle = session.call("order-milk", serde_json::json!({ "size": "litre" }), CallOptions::new()).await?;
//! let outcome = handle.result().await?;
//! ```

mod errors;
mod handshake;
mod keepalive;
mod session;
mod transport;
mod types;

pub use errors::{CallError, ContractViolation, DispatchError, HandshakeError};
pub use handshake::{AutoAccept, HandshakePolicy, NoAccept};
pub use session::{CallCanceler, CallHandle, Replier, Session};
pub use transport::Transport;
pub use types::{
    CallOptions, CallOutcome, DoneCallback, HandlerId, ReplyCallback, SessionConfig, SessionEvent,
    TimerKind,
};

pub use palaver_wire::{CallRef, Message, Origin, PeerRef, ValidationError};

#[cfg(test)]
mod tests;
