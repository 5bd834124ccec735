//! Ping/pong heartbeat.
//!
//! The loop starts once the handshake is ready and runs independently of the
//! correlation table: pings and pongs never touch it. Each tick first judges
//! the previous interval — did a pong arrive since the last ping? — and
//! emits the matching liveness signal, then sends the next ping and clears
//! the flag.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use palaver_wire::Message;

use crate::session::Inner;
use crate::types::SessionEvent;

impl Inner {
    /// Start the heartbeat loop. A no-op when already running or when the
    /// session was configured without a ping frequency.
    pub(crate) fn start_keepalive(inner: &Arc<Inner>) {
        let Some(frequency) = inner.config.ping_frequency else {
            return;
        };
        let mut slot = inner.keepalive.lock();
        if slot.is_some() {
            return;
        }

        // Seed the flag so the first tick judges the interval after the
        // first ping rather than the pre-ping silence.
        inner.pong_seen.store(true, Ordering::SeqCst);

        let inner = inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(frequency).await;
                // Judge and clear in one step so a pong racing the tick is
                // never lost between the read and the reset.
                let alive = inner.pong_seen.swap(false, Ordering::SeqCst);
                let _ = inner.events.send(if alive {
                    SessionEvent::LivenessOk
                } else {
                    SessionEvent::LivenessFailed
                });
                if !alive {
                    tracing::warn!("no pong since last heartbeat tick");
                }
                if let Err(e) = inner.transport.send(&Message::Ping).await {
                    tracing::warn!(error = %e, "heartbeat ping failed");
                }
            }
        });
        *slot = Some(handle.abort_handle());
    }

    /// Cancel the heartbeat. Idempotent: safe when not running, safe to call
    /// repeatedly.
    pub(crate) fn stop_keepalive(&self) {
        if let Some(handle) = self.keepalive.lock().take() {
            handle.abort();
        }
    }
}
