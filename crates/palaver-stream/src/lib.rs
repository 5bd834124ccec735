#![deny(unsafe_code)]

//! Byte-stream plumbing for palaver sessions.
//!
//! Two pieces:
//! - [`LineCodec`] — the framing contract: one JSON object per delimiter-
//!   terminated line.
//! - [`split`] / [`StreamSender`] / [`FramedReader`] — framed message IO
//!   over any `AsyncRead + AsyncWrite` byte stream. The sender half is a
//!   session [`Transport`](palaver_session::Transport); the reader half is
//!   pulled by the host and fed into
//!   [`Session::dispatch`](palaver_session::Session::dispatch).
//!
//! Connection management — reconnects, TLS, backoff — stays outside; this
//! crate only moves messages across an established stream.
//!
//! ```ignore
//! let (sender, mut reader) = palaver_stream::split(tcp_stream, LineCodec::default());
//! let (session, events) = Session::new(origin, sender, SessionConfig::default())?;
//!
//! let pump = session.clone();
//! tokio::spawn(async move {
//!     while let Ok(Some(message)) = reader.recv().await {
//!         if pump.dispatch(vec![message]).await.is_err() {
//!             break;
//!         }
//!     }
//!     pump.close();
//! });
//! ```

mod codec;
mod framed;

pub use codec::{CodecError, LineCodec, END_OF_MESSAGE};
pub use framed::{split, FramedReader, StreamSender};
