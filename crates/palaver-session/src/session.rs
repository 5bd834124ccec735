//! The session: correlation table, handler registry and message dispatch.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────────────────────────────┐
//!            │               Session                │
//!            ├──────────────────────────────────────┤
//!            │  transport: Arc<dyn Transport>       │
//!            │  calls:    call id -> PendingCall    │
//!            │  handlers: event   -> handler list   │
//!            │  handshake state / keepalive state   │
//!            └──────────────┬───────────────────────┘
//!                           │
//!                     dispatch(batch)
//!                           │
//!     ┌─────────────────────┼─────────────────────────┐
//!     │                     │                         │
//!  reply? (in calls)   call? (in handlers)    handshake / ping / pong
//!     │                     │                         │
//! ┌───▼────────┐   ┌────────▼─────────┐   ┌───────────▼───────────┐
//! │ feed the   │   │ spawn one task   │   │ drive the handshake   │
//! │ pending    │   │ per handler,     │   │ and keepalive state   │
//! │ call       │   │ stream replies   │   │ machines              │
//! └────────────┘   └──────────────────┘   └───────────────────────┘
//! ```
//!
//! # Key invariant
//!
//! Every terminal transition of a pending call — done received, cancel,
//! either timeout, session close — runs under the routing-table lock and
//! takes the call's result sender and both timer handles together, exactly
//! once. Whichever path gets there first wins; the others find the entry
//! gone (or its sender spent) and back off.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};

use palaver_wire::{Message, MessageFactory, Origin};

use crate::errors::{CallError, ContractViolation, DispatchError, HandshakeError};
use crate::handshake::{HandshakePolicy, HandshakeState, NoAccept};
use crate::transport::Transport;
use crate::types::{
    CallOptions, CallOutcome, DoneCallback, HandlerId, ReplyCallback, SessionConfig, SessionEvent,
    TimerKind,
};

type HandlerFuture = Pin<Box<dyn Future<Output = Value> + Send>>;
type BoxedHandler = Arc<dyn Fn(Value, Replier) -> HandlerFuture + Send + Sync>;

/// One outstanding local call.
///
/// The take-once fields (`tx`, the two timers) make duplicate resolution
/// structurally impossible: a terminal path that cannot take `tx` has lost
/// the race and does nothing.
struct PendingCall {
    parts: Vec<Value>,
    on_reply: Option<ReplyCallback>,
    on_done: Option<DoneCallback>,
    keep_alive: bool,
    tx: Option<oneshot::Sender<Result<CallOutcome, CallError>>>,
    reply_timer: Option<AbortHandle>,
    done_timer: Option<AbortHandle>,
}

impl PendingCall {
    fn clear_timers(&mut self) {
        if let Some(t) = self.reply_timer.take() {
            t.abort();
        }
        if let Some(t) = self.done_timer.take() {
            t.abort();
        }
    }
}

pub(crate) struct Inner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) factory: MessageFactory,
    pub(crate) config: SessionConfig,
    policy: Box<dyn HandshakePolicy>,

    calls: Mutex<HashMap<String, PendingCall>>,
    handlers: Mutex<HashMap<String, Vec<(HandlerId, BoxedHandler)>>>,
    next_handler_id: AtomicU64,

    pub(crate) events: mpsc::UnboundedSender<SessionEvent>,
    handshake: Mutex<HandshakeState>,
    pub(crate) keepalive: Mutex<Option<AbortHandle>>,
    pub(crate) pong_seen: AtomicBool,
    closed: AtomicBool,
}

/// A bidirectional call/reply session over an injected transport.
///
/// Cheap to clone; all clones share the same state. The transport
/// collaborator feeds received messages in through [`Session::dispatch`] and
/// the session puts outgoing messages on the wire through the
/// [`Transport`] it was constructed with.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session for one transport connection.
    ///
    /// Returns the session and the receiver for its internal lifecycle
    /// signals. Fails if `origin.id` is empty — the origin capability is a
    /// construction-time contract, not something to discover deep inside a
    /// call path.
    pub fn new(
        origin: Origin,
        transport: impl Transport + 'static,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), ContractViolation> {
        Self::with_policy(origin, transport, config, NoAccept)
    }

    /// Like [`Session::new`], with an explicit handshake accept policy.
    pub fn with_policy(
        origin: Origin,
        transport: impl Transport + 'static,
        config: SessionConfig,
        policy: impl HandshakePolicy + 'static,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), ContractViolation> {
        if origin.id.is_empty() {
            return Err(ContractViolation {
                requirement: "origin.id must be a non-empty string",
            });
        }
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            transport: Arc::new(transport),
            factory: MessageFactory::new(origin),
            config,
            policy: Box::new(policy),
            calls: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            next_handler_id: AtomicU64::new(0),
            events,
            handshake: Mutex::new(HandshakeState::Init),
            keepalive: Mutex::new(None),
            pong_seen: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        Ok((Self { inner }, events_rx))
    }

    /// The local endpoint identity stamped on outgoing messages.
    pub fn origin(&self) -> &Origin {
        self.inner.factory.origin()
    }

    /// True once the handshake has completed.
    pub fn is_ready(&self) -> bool {
        matches!(*self.inner.handshake.lock(), HandshakeState::Ready)
    }

    /// Number of calls currently registered in the routing table.
    pub fn outstanding_calls(&self) -> usize {
        self.inner.calls.lock().len()
    }

    // ========================================================================
    // Outgoing calls
    // ========================================================================

    /// Issue a call to whatever peers handle `event`.
    ///
    /// Registers the pending call, arms its two timers, sends the call
    /// message, and returns immediately with a handle. The handle resolves
    /// when the terminating reply arrives, a timer fires, or the call is
    /// canceled.
    ///
    /// Note that a peer with no handler for `event` never answers at all;
    /// such calls end in a first-reply timeout by design.
    pub async fn call(
        &self,
        event: impl Into<String>,
        payload: Value,
        options: CallOptions,
    ) -> Result<CallHandle, CallError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CallError::SessionClosed);
        }

        let message = self.inner.factory.call(event.into(), payload);
        let call_id = match &message {
            Message::Call { id, .. } => id.clone(),
            _ => unreachable!("factory.call builds a call message"),
        };

        let (tx, rx) = oneshot::channel();
        let reply_timer = options
            .reply_timeout
            .map(|d| Inner::spawn_call_timer(&self.inner, &call_id, d, TimerKind::FirstReply));
        let done_timer = options
            .done_timeout
            .map(|d| Inner::spawn_call_timer(&self.inner, &call_id, d, TimerKind::Done));

        self.inner.calls.lock().insert(
            call_id.clone(),
            PendingCall {
                parts: Vec::new(),
                on_reply: options.on_reply,
                on_done: options.on_done,
                keep_alive: options.keep_alive,
                tx: Some(tx),
                reply_timer,
                done_timer,
            },
        );

        if let Err(e) = self.inner.transport.send(&message).await {
            self.inner.discard_call(&call_id);
            return Err(CallError::Transport(e));
        }
        tracing::trace!(call_id = %call_id, "call sent");

        Ok(CallHandle {
            message,
            call_id,
            rx,
            inner: self.inner.clone(),
        })
    }

    // ========================================================================
    // Handler registry
    // ========================================================================

    /// Register a handler for incoming calls to `event`.
    ///
    /// The handler receives the call payload and a [`Replier`] for streaming
    /// intermediate replies; its return value becomes the terminating reply.
    /// Returns the token [`Session::off`] removes it by.
    pub fn on<F, Fut>(&self, event: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(Value, Replier) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        let id = HandlerId(self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed));
        let boxed: BoxedHandler = Arc::new(move |payload, replier| Box::pin(handler(payload, replier)));
        self.inner
            .handlers
            .lock()
            .entry(event.into())
            .or_default()
            .push((id, boxed));
        id
    }

    /// Remove a handler registration. Returns false if it was not present.
    pub fn off(&self, event: &str, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.lock();
        let Some(list) = handlers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(hid, _)| *hid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(event);
        }
        removed
    }

    // ========================================================================
    // Inbound dispatch
    // ========================================================================

    /// Dispatch an ordered batch of received messages.
    ///
    /// Messages are validated and initiated in batch order; the returned
    /// future completes once every message has been fully processed,
    /// including all replies streamed by local handlers. Completion order of
    /// the handler work is not the batch order — handlers run concurrently
    /// and may finish however they like.
    pub async fn dispatch(&self, messages: Vec<Message>) -> Result<(), DispatchError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            tracing::debug!("session closed, dropping {} inbound message(s)", messages.len());
            return Ok(());
        }

        let mut joins: Vec<JoinHandle<()>> = Vec::new();
        for message in messages {
            message.validate()?;
            match message {
                Message::Call {
                    id, event, payload, ..
                } => joins.extend(Inner::spawn_incoming_call(&self.inner, id, event, payload)),
                Message::Reply {
                    part,
                    done,
                    to,
                    payload,
                    ..
                } => self.inner.handle_reply(&to.id, part, done, payload),
                Message::Handshake {
                    id,
                    origin,
                    payload,
                } => self.handle_handshake(id, origin, payload).await?,
                Message::HandshakeAccept { .. } => Inner::handle_handshake_accept(&self.inner),
                Message::Ping => {
                    self.inner
                        .transport
                        .send(&Message::Pong)
                        .await
                        .map_err(DispatchError::Transport)?;
                }
                Message::Pong => {
                    self.inner.pong_seen.store(true, Ordering::SeqCst);
                }
            }
        }

        for join in joins {
            if let Err(e) = join.await {
                tracing::warn!(error = %e, "incoming-call handler task failed");
            }
        }
        Ok(())
    }

    async fn handle_handshake(
        &self,
        handshake_id: String,
        origin: Origin,
        payload: Value,
    ) -> Result<(), DispatchError> {
        let _ = self.inner.events.send(SessionEvent::HandshakeReceived {
            origin: origin.clone(),
            payload: payload.clone(),
        });
        if let Some(accept_payload) = self.inner.policy.accept(&origin, &payload) {
            let accept = self
                .inner
                .factory
                .handshake_accept(handshake_id, accept_payload);
            self.inner
                .transport
                .send(&accept)
                .await
                .map_err(DispatchError::Transport)?;
        }
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Establish the session: send a handshake and wait for the peer's
    /// accept.
    ///
    /// Call this on the transport's connection-open signal. A missing accept
    /// resolves to `Err(HandshakeError::TimedOut)` after the configured
    /// timeout — a value for the caller's retry policy, not a panic.
    pub async fn open(&self) -> Result<(), HandshakeError> {
        self.open_with(Value::Null).await
    }

    /// Like [`Session::open`], with an application payload on the handshake.
    pub async fn open_with(&self, payload: Value) -> Result<(), HandshakeError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(HandshakeError::Closed);
        }

        let rx = {
            let mut handshake = self.inner.handshake.lock();
            match *handshake {
                HandshakeState::Init | HandshakeState::TimedOut => {}
                HandshakeState::AwaitingAccept { .. } | HandshakeState::Ready => {
                    return Err(HandshakeError::AlreadyOpen);
                }
            }
            let (tx, rx) = oneshot::channel();
            let timer = Inner::spawn_handshake_timer(&self.inner);
            *handshake = HandshakeState::AwaitingAccept {
                timer,
                waiter: Some(tx),
            };
            rx
        };

        let message = self.inner.factory.handshake(payload);
        if let Err(e) = self.inner.transport.send(&message).await {
            let mut handshake = self.inner.handshake.lock();
            if let HandshakeState::AwaitingAccept { timer, .. } = &*handshake {
                timer.abort();
            }
            *handshake = HandshakeState::Init;
            return Err(HandshakeError::Transport(e));
        }
        tracing::debug!("handshake sent, awaiting accept");

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(HandshakeError::Closed),
        }
    }

    /// Tear the session down.
    ///
    /// Every outstanding call resolves as canceled (not done), the heartbeat
    /// stops, and [`SessionEvent::Closed`] is emitted. Idempotent. Call this
    /// on the transport's connection-close signal.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.stop_keepalive();

        let waiter = {
            let mut handshake = self.inner.handshake.lock();
            match &mut *handshake {
                HandshakeState::AwaitingAccept { timer, waiter } => {
                    timer.abort();
                    let w = waiter.take();
                    *handshake = HandshakeState::Init;
                    w
                }
                _ => None,
            }
        };
        if let Some(w) = waiter {
            let _ = w.send(Err(HandshakeError::Closed));
        }

        let entries: Vec<PendingCall> = {
            let mut calls = self.inner.calls.lock();
            calls.drain().map(|(_, entry)| entry).collect()
        };
        for mut entry in entries {
            entry.clear_timers();
            if let Some(tx) = entry.tx.take() {
                let _ = tx.send(Ok(CallOutcome {
                    data: Value::Null,
                    parts: entry.parts,
                    canceled: true,
                }));
            }
        }

        let _ = self.inner.events.send(SessionEvent::Closed);
        tracing::debug!("session closed");
    }

    /// Stop the heartbeat loop. Idempotent, safe when it never started.
    pub fn stop_keepalive(&self) {
        self.inner.stop_keepalive();
    }
}

impl Inner {
    fn spawn_call_timer(
        inner: &Arc<Inner>,
        call_id: &str,
        after: Duration,
        timer: TimerKind,
    ) -> AbortHandle {
        let inner = inner.clone();
        let call_id = call_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            inner.expire_call(&call_id, timer);
        })
        .abort_handle()
    }

    fn spawn_handshake_timer(inner: &Arc<Inner>) -> AbortHandle {
        let inner = inner.clone();
        let after = inner.config.handshake_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            inner.expire_handshake();
        })
        .abort_handle()
    }

    /// A call timer fired. Loses cleanly if the call already resolved.
    fn expire_call(&self, call_id: &str, timer: TimerKind) {
        let tx = {
            let mut calls = self.calls.lock();
            let Some(mut entry) = calls.remove(call_id) else {
                return;
            };
            let Some(tx) = entry.tx.take() else {
                // Completed keep-alive entry: it lives until cancel().
                calls.insert(call_id.to_string(), entry);
                return;
            };
            entry.clear_timers();
            tx
        };
        tracing::debug!(call_id = %call_id, %timer, "call timed out");
        let _ = tx.send(Err(CallError::Timeout {
            call_id: call_id.to_string(),
            timer,
        }));
    }

    /// Cancel resolves (never rejects) with whatever parts arrived so far.
    /// For an already-completed keep-alive call it just releases the entry.
    pub(crate) fn cancel_call(&self, call_id: &str) {
        let settled = {
            let mut calls = self.calls.lock();
            let Some(mut entry) = calls.remove(call_id) else {
                return;
            };
            entry.clear_timers();
            entry.tx.take().map(|tx| (tx, std::mem::take(&mut entry.parts)))
        };
        if let Some((tx, parts)) = settled {
            tracing::debug!(call_id = %call_id, "call canceled");
            let _ = tx.send(Ok(CallOutcome {
                data: Value::Null,
                parts,
                canceled: true,
            }));
        }
    }

    /// Drop a call without resolving it (the caller already has the error).
    fn discard_call(&self, call_id: &str) {
        if let Some(mut entry) = self.calls.lock().remove(call_id) {
            entry.clear_timers();
        }
    }

    /// Route a received reply to its pending call.
    fn handle_reply(&self, to_id: &str, part: u64, done: bool, payload: Value) {
        enum After {
            Part(Option<ReplyCallback>),
            Done {
                on_done: Option<DoneCallback>,
                tx: oneshot::Sender<Result<CallOutcome, CallError>>,
                parts: Vec<Value>,
            },
        }

        let after = {
            let mut calls = self.calls.lock();
            let Some(entry) = calls.get_mut(to_id) else {
                tracing::debug!(call_id = %to_id, "reply for unknown call, dropping");
                return;
            };

            // The first-reply timer is cleared by any reply and never
            // re-armed.
            if let Some(t) = entry.reply_timer.take() {
                t.abort();
            }
            entry.parts.push(payload.clone());

            if done {
                if let Some(tx) = entry.tx.take() {
                    if let Some(t) = entry.done_timer.take() {
                        t.abort();
                    }
                    let on_done = entry.on_done.clone();
                    let parts = entry.parts.clone();
                    let keep_alive = entry.keep_alive;
                    if !keep_alive {
                        calls.remove(to_id);
                    }
                    After::Done { on_done, tx, parts }
                } else {
                    // Keep-alive call that already completed: late and
                    // duplicate replies keep feeding on_reply, done or not.
                    After::Part(entry.on_reply.clone())
                }
            } else {
                After::Part(entry.on_reply.clone())
            }
        };

        // Callbacks run outside the table lock.
        match after {
            After::Part(cb) => {
                if let Some(cb) = cb {
                    cb(payload, part);
                }
            }
            After::Done { on_done, tx, parts } => {
                if let Some(cb) = on_done {
                    cb(payload.clone(), &parts);
                }
                let _ = tx.send(Ok(CallOutcome {
                    data: payload,
                    parts,
                    canceled: false,
                }));
            }
        }
    }

    /// Fan an incoming call out to every registered handler.
    ///
    /// All handlers of one call share a single part counter, so the caller
    /// sees strictly increasing parts. Each handler terminates its own
    /// stream with a done reply: with N handlers the single caller receives
    /// N done-replies and its final `data` is whichever lands last — a race,
    /// not registration order.
    fn spawn_incoming_call(
        inner: &Arc<Inner>,
        call_id: String,
        event: String,
        payload: Value,
    ) -> Vec<JoinHandle<()>> {
        let handlers: Vec<BoxedHandler> = inner
            .handlers
            .lock()
            .get(&event)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            // No reply is ever sent; the remote caller runs into its
            // first-reply timeout. Intended behavior, not an error path.
            tracing::debug!(%event, "no handler registered, dropping call");
            return Vec::new();
        }

        let part = Arc::new(AtomicU64::new(0));
        handlers
            .into_iter()
            .map(|handler| {
                let replier = Replier {
                    inner: inner.clone(),
                    to_id: call_id.clone(),
                    to_event: event.clone(),
                    part: part.clone(),
                };
                let inner = inner.clone();
                let (call_id, event, payload, part) = (
                    call_id.clone(),
                    event.clone(),
                    payload.clone(),
                    part.clone(),
                );
                tokio::spawn(async move {
                    let value = handler(payload, replier).await;
                    let n = part.fetch_add(1, Ordering::SeqCst);
                    let reply = inner.factory.reply(&call_id, &event, n, true, value);
                    if let Err(e) = inner.transport.send(&reply).await {
                        tracing::warn!(call_id = %call_id, error = %e, "failed to send done reply");
                    }
                })
            })
            .collect()
    }

    fn handle_handshake_accept(inner: &Arc<Inner>) {
        let waiter = {
            let mut handshake = inner.handshake.lock();
            match &mut *handshake {
                HandshakeState::AwaitingAccept { timer, waiter } => {
                    timer.abort();
                    let w = waiter.take();
                    *handshake = HandshakeState::Ready;
                    w
                }
                other => {
                    tracing::debug!(state = other.name(), "unexpected handshake-accept, ignoring");
                    return;
                }
            }
        };
        if let Some(w) = waiter {
            let _ = w.send(Ok(()));
        }
        let _ = inner.events.send(SessionEvent::Ready);
        tracing::debug!("handshake accepted, session ready");
        Inner::start_keepalive(inner);
    }

    fn expire_handshake(&self) {
        let waiter = {
            let mut handshake = self.handshake.lock();
            match &mut *handshake {
                HandshakeState::AwaitingAccept { waiter, .. } => {
                    let w = waiter.take();
                    *handshake = HandshakeState::TimedOut;
                    w
                }
                _ => return,
            }
        };
        tracing::debug!("handshake timed out");
        if let Some(w) = waiter {
            let _ = w.send(Err(HandshakeError::TimedOut));
        }
    }
}

/// Handle to an outstanding call.
pub struct CallHandle {
    message: Message,
    call_id: String,
    rx: oneshot::Receiver<Result<CallOutcome, CallError>>,
    inner: Arc<Inner>,
}

impl CallHandle {
    /// The call message that went on the wire.
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The call's correlation id.
    pub fn id(&self) -> &str {
        &self.call_id
    }

    /// Resolve the call as canceled: `{data: null, parts: so-far,
    /// canceled: true}`. A no-op if the call already resolved.
    pub fn cancel(&self) {
        self.inner.cancel_call(&self.call_id);
    }

    /// A detachable canceler for this call, for cancellation from another
    /// task while the handle itself is being awaited.
    pub fn canceler(&self) -> CallCanceler {
        CallCanceler {
            call_id: self.call_id.clone(),
            inner: self.inner.clone(),
        }
    }

    /// Wait for the call's terminal transition.
    pub async fn result(self) -> Result<CallOutcome, CallError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(CallError::SessionClosed),
        }
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("call_id", &self.call_id)
            .finish_non_exhaustive()
    }
}

/// Cancels one call; clone of the handle's cancel capability.
#[derive(Clone)]
pub struct CallCanceler {
    call_id: String,
    inner: Arc<Inner>,
}

impl CallCanceler {
    pub fn cancel(&self) {
        self.inner.cancel_call(&self.call_id);
    }
}

/// Streams intermediate replies from inside a call handler.
///
/// Each `reply` sends a non-final reply with the next part index; the
/// handler's return value becomes the final one.
#[derive(Clone)]
pub struct Replier {
    inner: Arc<Inner>,
    to_id: String,
    to_event: String,
    part: Arc<AtomicU64>,
}

impl Replier {
    pub async fn reply(&self, payload: Value) -> std::io::Result<()> {
        let n = self.part.fetch_add(1, Ordering::SeqCst);
        let message = self
            .inner
            .factory
            .reply(&self.to_id, &self.to_event, n, false, payload);
        self.inner.transport.send(&message).await
    }
}
