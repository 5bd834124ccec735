//! Handshake state machine and the accept policy seam.

use palaver_wire::Origin;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::errors::HandshakeError;

/// Session establishment states.
///
/// `Init → AwaitingAccept → Ready`, or `AwaitingAccept → TimedOut` when the
/// handshake timer fires first. A timed-out session may attempt `open()`
/// again; a ready one may not.
pub(crate) enum HandshakeState {
    Init,
    AwaitingAccept {
        timer: AbortHandle,
        waiter: Option<oneshot::Sender<Result<(), HandshakeError>>>,
    },
    Ready,
    TimedOut,
}

impl HandshakeState {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            HandshakeState::Init => "init",
            HandshakeState::AwaitingAccept { .. } => "awaiting-accept",
            HandshakeState::Ready => "ready",
            HandshakeState::TimedOut => "timed-out",
        }
    }
}

/// Decides whether this endpoint answers a peer-initiated handshake.
///
/// The engine never hard-codes the answer: issuing the accept is the
/// listening role's job and stays an application decision. Returning
/// `Some(payload)` makes the engine send a handshake-accept carrying that
/// payload; `None` sends nothing. Either way the handshake is surfaced as
/// [`SessionEvent::HandshakeReceived`](crate::SessionEvent::HandshakeReceived).
pub trait HandshakePolicy: Send + Sync {
    fn accept(&self, origin: &Origin, payload: &Value) -> Option<Value>;
}

/// Never answers a handshake (the default). Use for the initiating role, or
/// when the application layer issues accepts itself.
pub struct NoAccept;

impl HandshakePolicy for NoAccept {
    fn accept(&self, _origin: &Origin, _payload: &Value) -> Option<Value> {
        None
    }
}

/// Answers every handshake with a null-payload accept. Use for a listening
/// role that admits any peer.
pub struct AutoAccept;

impl HandshakePolicy for AutoAccept {
    fn accept(&self, _origin: &Origin, _payload: &Value) -> Option<Value> {
        Some(Value::Null)
    }
}
