//! Error taxonomy for the session layer.
//!
//! None of these are retried internally; every failure is surfaced to the
//! immediate caller. The only swallowed conditions are the documented drops:
//! an incoming call with no registered handler, and a reply whose call id is
//! no longer (or never was) in the routing table.

use std::io;

use palaver_wire::ValidationError;

use crate::types::TimerKind;

/// The capability contract was violated at construction time.
///
/// The transport itself cannot be absent (it is a constructor parameter),
/// so this only covers the origin contract: `origin.id` must be a non-empty
/// string.
#[derive(Debug)]
pub struct ContractViolation {
    pub requirement: &'static str,
}

impl std::fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "contract violation: {}", self.requirement)
    }
}

impl std::error::Error for ContractViolation {}

/// Error from an outgoing call.
#[derive(Debug)]
pub enum CallError {
    /// One of the call's two timers expired before resolution. Any parts
    /// received so far are discarded on this path.
    Timeout { call_id: String, timer: TimerKind },
    /// The transport refused the outgoing call message.
    Transport(io::Error),
    /// The session was closed or dropped before the call resolved.
    SessionClosed,
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Timeout { call_id, timer } => {
                write!(f, "timeout until {timer} has been exceeded, {call_id}")
            }
            CallError::Transport(e) => write!(f, "transport error: {e}"),
            CallError::SessionClosed => write!(f, "session closed"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// Error from dispatching a batch of inbound messages.
#[derive(Debug)]
pub enum DispatchError {
    /// A message failed the shape contract for its declared kind. Messages
    /// earlier in the batch were already dispatched; later ones were not.
    Validation(ValidationError),
    /// A protocol-mandated response (pong, handshake-accept) could not be
    /// sent.
    Transport(io::Error),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Validation(e) => {
                write!(f, "message does not conform to the api: {e}")
            }
            DispatchError::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatchError::Validation(e) => Some(e),
            DispatchError::Transport(e) => Some(e),
        }
    }
}

impl From<ValidationError> for DispatchError {
    fn from(e: ValidationError) -> Self {
        DispatchError::Validation(e)
    }
}

/// Failure result of session establishment.
///
/// A handshake timeout is an ordinary value, never a panic, so callers can
/// decide their own retry policy.
#[derive(Debug)]
pub enum HandshakeError {
    /// No handshake-accept arrived within the configured timeout. The
    /// session is left timed out; the transport-level close path cleans up.
    TimedOut,
    /// `open()` was called while a handshake was already in flight or
    /// complete.
    AlreadyOpen,
    /// The session was closed before the handshake resolved.
    Closed,
    /// The transport refused the outgoing handshake message.
    Transport(io::Error),
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeError::TimedOut => write!(f, "handshake timed out"),
            HandshakeError::AlreadyOpen => write!(f, "handshake already in progress"),
            HandshakeError::Closed => write!(f, "session closed during handshake"),
            HandshakeError::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandshakeError::Transport(e) => Some(e),
            _ => None,
        }
    }
}
