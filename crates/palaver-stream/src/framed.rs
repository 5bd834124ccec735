//! Framed message IO over async byte streams.
//!
//! Works with any `AsyncRead + AsyncWrite` stream — TCP sockets, Unix domain
//! sockets, `tokio::io::duplex` pairs in tests. The write side implements
//! the session's [`Transport`] capability; the read side is a pull loop the
//! host drives into [`Session::dispatch`](palaver_session::Session::dispatch).

use std::io;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use palaver_session::Transport;
use palaver_wire::Message;

use crate::codec::{CodecError, LineCodec};

fn codec_to_io(e: CodecError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

/// Split a byte stream into the session's two transport roles.
pub fn split<S>(stream: S, codec: LineCodec) -> (StreamSender<WriteHalf<S>>, FramedReader<ReadHalf<S>>)
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (read, write) = tokio::io::split(stream);
    (
        StreamSender::new(write, codec.clone()),
        FramedReader::new(read, codec),
    )
}

/// The outbound half: encodes messages and writes delimited frames.
///
/// Sends are serialized through an async lock because the session produces
/// traffic from concurrent tasks (replies, pings, timers).
pub struct StreamSender<W> {
    writer: tokio::sync::Mutex<W>,
    codec: LineCodec,
}

impl<W> StreamSender<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W, codec: LineCodec) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
            codec,
        }
    }

    pub async fn send(&self, message: &Message) -> io::Result<()> {
        let frame = self.codec.encode(message).map_err(codec_to_io)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(frame.as_bytes()).await?;
        writer.flush().await
    }
}

impl<W> Transport for StreamSender<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn send<'a>(&'a self, msg: &'a Message) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(StreamSender::send(self, msg))
    }
}

/// The inbound half: buffers stream bytes and yields one message per frame.
pub struct FramedReader<R> {
    reader: R,
    codec: LineCodec,
    delimiter: Vec<u8>,
    buf: Vec<u8>,
}

impl<R> FramedReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, codec: LineCodec) -> Self {
        let delimiter = codec.delimiter().as_bytes().to_vec();
        Self {
            reader,
            codec,
            delimiter,
            buf: Vec::new(),
        }
    }

    /// Receive the next message.
    ///
    /// Returns `Ok(None)` on clean end of stream. A decode failure or an
    /// EOF with residual undelimited bytes is an error — the codec contract
    /// gives up the whole buffer rather than resynchronizing.
    pub async fn recv(&mut self) -> io::Result<Option<Message>> {
        loop {
            while let Some(pos) = find(&self.buf, &self.delimiter) {
                let frame: Vec<u8> = self.buf.drain(..pos + self.delimiter.len()).collect();
                let segment = &frame[..pos];
                if segment.is_empty() {
                    continue;
                }
                let message = self.codec.decode_one(segment).map_err(codec_to_io)?;
                tracing::trace!(kind = message.kind(), "frame received");
                return Ok(Some(message));
            }

            let mut chunk = [0u8; 4096];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                if !self.buf.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("eof with {} undelimited trailing bytes", self.buf.len()),
                    ));
                }
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// First occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
