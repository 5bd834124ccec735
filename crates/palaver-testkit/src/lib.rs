#![deny(unsafe_code)]

//! Test transports and wiring helpers for palaver sessions.
//!
//! The session-level conformance tests live here rather than in
//! `palaver-session` so the session crate never needs a transport
//! implementation as a dev-dependency.

use std::io;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use palaver_session::{AutoAccept, Session, SessionConfig, SessionEvent, Transport};
use palaver_wire::{Message, Origin};

/// A transport that records every sent message and optionally forwards it
/// into a channel, so tests can both assert on the wire and drive a peer.
#[derive(Clone, Default)]
pub struct TestTransport {
    sent: Arc<Mutex<Vec<Message>>>,
    outbox: Option<mpsc::UnboundedSender<Message>>,
}

impl TestTransport {
    /// A transport that only records. Sends always succeed.
    pub fn recording() -> Self {
        Self::default()
    }

    /// A transport that records and forwards every message into the
    /// returned receiver — the "wire" a peer's pump reads from.
    pub fn piped() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                sent: Arc::new(Mutex::new(Vec::new())),
                outbox: Some(tx),
            },
            rx,
        )
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    /// Sent replies as `(part, done, payload)` triples.
    pub fn sent_replies(&self) -> Vec<(u64, bool, serde_json::Value)> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                Message::Reply {
                    part, done, payload, ..
                } => Some((part, done, payload)),
                _ => None,
            })
            .collect()
    }
}

impl Transport for TestTransport {
    fn send<'a>(&'a self, msg: &'a Message) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            self.sent.lock().push(msg.clone());
            if let Some(outbox) = &self.outbox {
                let _ = outbox.send(msg.clone());
            }
            Ok(())
        })
    }
}

/// Drive a session's dispatch from a message channel, one message per
/// batch, until the channel closes or dispatch fails.
pub fn pump(session: Session, mut rx: mpsc::UnboundedReceiver<Message>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = session.dispatch(vec![message]).await {
                tracing::warn!(error = %e, "dispatch failed, pump stopping");
                break;
            }
        }
    })
}

/// Two sessions wired back to back: whatever one sends, the other
/// dispatches. Side `b` auto-accepts handshakes (the listening role).
pub struct LinkedPair {
    pub a: Session,
    pub a_events: mpsc::UnboundedReceiver<SessionEvent>,
    pub a_transport: TestTransport,
    pub a_pump: JoinHandle<()>,
    pub b: Session,
    pub b_events: mpsc::UnboundedReceiver<SessionEvent>,
    pub b_transport: TestTransport,
    pub b_pump: JoinHandle<()>,
}

/// Build a linked pair with the given config on both sides.
pub fn linked_pair(config: SessionConfig) -> LinkedPair {
    let (a_transport, a_wire) = TestTransport::piped();
    let (b_transport, b_wire) = TestTransport::piped();

    let (a, a_events) = Session::new(Origin::new("side-a"), a_transport.clone(), config.clone())
        .expect("origin is non-empty");
    let (b, b_events) = Session::with_policy(
        Origin::new("side-b"),
        b_transport.clone(),
        config,
        AutoAccept,
    )
    .expect("origin is non-empty");

    let a_pump = pump(b.clone(), a_wire);
    let b_pump = pump(a.clone(), b_wire);

    LinkedPair {
        a,
        a_events,
        a_transport,
        a_pump,
        b,
        b_events,
        b_transport,
        b_pump,
    }
}
