//! The transport capability consumed by a session.
//!
//! The engine never owns a connection: it is handed something that can put a
//! message on the wire, and the transport collaborator feeds received
//! messages back through [`Session::dispatch`](crate::Session::dispatch).
//! Connection lifecycle, retries and TLS are the transport's problem.

use std::io;

use futures::future::BoxFuture;
use palaver_wire::Message;

/// Something that can send one protocol message to the peer.
///
/// Implementations encode and frame the message however their medium
/// requires (`palaver-stream` does newline-delimited JSON over byte
/// streams). `send` takes `&self` because replies, pings and timer-driven
/// traffic are produced from concurrent tasks.
pub trait Transport: Send + Sync {
    fn send<'a>(&'a self, msg: &'a Message) -> BoxFuture<'a, io::Result<()>>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn send<'a>(&'a self, msg: &'a Message) -> BoxFuture<'a, io::Result<()>> {
        (**self).send(msg)
    }
}
