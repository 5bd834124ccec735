//! Session configuration, call options and the internal signal set.

use std::sync::Arc;
use std::time::Duration;

use palaver_wire::Origin;
use serde_json::Value;

/// Invoked for every non-final reply with `(payload, part)`.
pub type ReplyCallback = Arc<dyn Fn(Value, u64) + Send + Sync>;

/// Invoked once with the final payload and every accumulated part.
pub type DoneCallback = Arc<dyn Fn(Value, &[Value]) + Send + Sync>;

/// Configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long `open()` waits for the peer's handshake-accept.
    pub handshake_timeout: Duration,
    /// Heartbeat period once the handshake is ready. `None` disables the
    /// heartbeat entirely.
    pub ping_frequency: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(2000),
            ping_frequency: Some(Duration::from_millis(200)),
        }
    }
}

impl SessionConfig {
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn ping_frequency(mut self, frequency: Option<Duration>) -> Self {
        self.ping_frequency = frequency;
        self
    }
}

/// Per-call options for [`Session::call`](crate::Session::call).
///
/// Timeouts default to 2000 ms each; `None` disables a timer. `keep_alive`
/// leaves the routing entry registered after the call completes so late and
/// duplicate replies keep invoking `on_reply` — a mode for long-lived
/// multiplexed calls. The entry is then retained until `cancel()`, so the
/// caller owns the cleanup.
#[derive(Clone)]
pub struct CallOptions {
    pub(crate) on_reply: Option<ReplyCallback>,
    pub(crate) on_done: Option<DoneCallback>,
    pub(crate) reply_timeout: Option<Duration>,
    pub(crate) done_timeout: Option<Duration>,
    pub(crate) keep_alive: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            on_reply: None,
            on_done: None,
            reply_timeout: Some(Self::DEFAULT_REPLY_TIMEOUT),
            done_timeout: Some(Self::DEFAULT_DONE_TIMEOUT),
            keep_alive: false,
        }
    }
}

impl CallOptions {
    pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(2000);
    pub const DEFAULT_DONE_TIMEOUT: Duration = Duration::from_millis(2000);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_reply(mut self, f: impl Fn(Value, u64) + Send + Sync + 'static) -> Self {
        self.on_reply = Some(Arc::new(f));
        self
    }

    pub fn on_done(mut self, f: impl Fn(Value, &[Value]) + Send + Sync + 'static) -> Self {
        self.on_done = Some(Arc::new(f));
        self
    }

    /// Override the first-reply timer. `None` disables it.
    pub fn reply_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Override the completion timer. `None` disables it.
    pub fn done_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.done_timeout = timeout;
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

impl std::fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOptions")
            .field("on_reply", &self.on_reply.is_some())
            .field("on_done", &self.on_done.is_some())
            .field("reply_timeout", &self.reply_timeout)
            .field("done_timeout", &self.done_timeout)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

/// What a completed call resolved to.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    /// Payload of the terminating reply; null when canceled.
    pub data: Value,
    /// Every reply payload received, in completion order, including the
    /// terminating one.
    pub parts: Vec<Value>,
    /// True when the call was canceled (locally or by session close)
    /// instead of completed by the peer.
    pub canceled: bool,
}

/// Which of a pending call's two timers fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// No reply of any kind arrived in time.
    FirstReply,
    /// Replies arrived but no terminating reply did.
    Done,
}

impl std::fmt::Display for TimerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimerKind::FirstReply => write!(f, "first reply"),
            TimerKind::Done => write!(f, "done"),
        }
    }
}

/// Token identifying one handler registration, returned by
/// [`Session::on`](crate::Session::on) and consumed by
/// [`Session::off`](crate::Session::off).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) u64);

/// Internal lifecycle signals, delivered on the channel returned by
/// [`Session::new`](crate::Session::new).
///
/// These are a fixed set of named signals rather than a generic event
/// emitter; application traffic goes through the handler registry instead.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The handshake completed; application traffic is live. Emitted once.
    Ready,
    /// The session was closed; all pending calls were resolved as canceled.
    Closed,
    /// The peer initiated a handshake. Whether to answer it is the
    /// [`HandshakePolicy`](crate::HandshakePolicy)'s decision.
    HandshakeReceived { origin: Origin, payload: Value },
    /// A pong was observed between the last two heartbeat ticks.
    LivenessOk,
    /// No pong was observed between the last two heartbeat ticks. Emitted
    /// once per missed tick.
    LivenessFailed,
}
