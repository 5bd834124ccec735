//! Delimiter-framed JSON codec.
//!
//! `encode` is JSON-serialize plus a trailing delimiter; `decode` splits a
//! buffer on the delimiter, drops empty segments and parses each one. The
//! two are mutual inverses for well-formed input. A parse failure on any
//! segment fails the whole buffer — there is no partial recovery of the
//! remaining segments.

use palaver_wire::Message;

/// Default frame delimiter.
pub const END_OF_MESSAGE: &str = "\n";

/// Encode/decode failure. Fatal to the offending send or receive.
#[derive(Debug)]
pub enum CodecError {
    /// The message could not be JSON-serialized.
    Encode(serde_json::Error),
    /// A segment could not be parsed as a message.
    Decode(serde_json::Error),
    /// The buffer is not valid UTF-8.
    Utf8(std::str::Utf8Error),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Encode(e) => write!(f, "message could not be encoded: {e}"),
            CodecError::Decode(e) => write!(f, "message could not be decoded: {e}"),
            CodecError::Utf8(e) => write!(f, "buffer is not valid utf-8: {e}"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Encode(e) | CodecError::Decode(e) => Some(e),
            CodecError::Utf8(e) => Some(e),
        }
    }
}

/// One-message-per-line framing with a configurable delimiter.
#[derive(Debug, Clone)]
pub struct LineCodec {
    delimiter: String,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(END_OF_MESSAGE)
    }
}

impl LineCodec {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
        }
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    /// Serialize one message and append the delimiter.
    pub fn encode(&self, message: &Message) -> Result<String, CodecError> {
        let mut frame = serde_json::to_string(message).map_err(CodecError::Encode)?;
        frame.push_str(&self.delimiter);
        Ok(frame)
    }

    /// Split a received buffer into messages.
    pub fn decode(&self, buffer: &[u8]) -> Result<Vec<Message>, CodecError> {
        let text = std::str::from_utf8(buffer).map_err(CodecError::Utf8)?;
        text.split(&self.delimiter)
            .filter(|segment| !segment.is_empty())
            .map(|segment| serde_json::from_str(segment).map_err(CodecError::Decode))
            .collect()
    }

    /// Parse one already-deframed segment.
    pub fn decode_one(&self, segment: &[u8]) -> Result<Message, CodecError> {
        let text = std::str::from_utf8(segment).map_err(CodecError::Utf8)?;
        serde_json::from_str(text).map_err(CodecError::Decode)
    }
}
