//! Recorder: byte-exact capture of one HTTP exchange
//!
//! The fetcher writes every request byte and every raw response byte here.
//! Downstream stages replay whichever layer they need:
//!
//! - recorded output: the request exactly as sent
//! - raw input: status line, headers and body exactly as received
//! - message body: raw input after the header block
//! - entity: message body with transfer coding (chunking) removed
//! - content: entity with content coding (gzip, deflate) removed

mod chunked;
mod decode;

pub use chunked::{dechunk, ChunkedDecoder};
pub use decode::decode_content;

use crate::RecorderError;
use encoding_rs::{Encoding, WINDOWS_1252};
use std::borrow::Cow;
use std::io::Cursor;

/// Captured request and response bytes for one fetch attempt
#[derive(Debug, Clone)]
pub struct Recorder {
    output: Vec<u8>,
    input: Vec<u8>,
    message_body_begin: Option<usize>,
    chunked: bool,
    content_encoding: Option<String>,
    charset: &'static Encoding,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            output: Vec::new(),
            input: Vec::new(),
            message_body_begin: None,
            chunked: false,
            content_encoding: None,
            charset: WINDOWS_1252,
        }
    }

    // ===== Capture =====

    pub fn record_output(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }

    pub fn record_input(&mut self, bytes: &[u8]) {
        self.input.extend_from_slice(bytes);
    }

    /// Marks the offset in the raw input where the header block ends
    pub fn mark_message_body_begin(&mut self, offset: usize) {
        self.message_body_begin = Some(offset.min(self.input.len()));
    }

    /// Drops every input byte past `len`
    pub fn truncate_input(&mut self, len: usize) {
        self.input.truncate(len);
    }

    /// Discards the recorded body, keeping status line and headers
    pub fn truncate_to_message_body_begin(&mut self) {
        if let Some(begin) = self.message_body_begin {
            self.input.truncate(begin);
        }
    }

    pub fn set_chunked(&mut self, chunked: bool) {
        self.chunked = chunked;
    }

    pub fn set_content_encoding(&mut self, encoding: Option<String>) {
        self.content_encoding = encoding;
    }

    pub fn set_charset(&mut self, charset: &'static Encoding) {
        self.charset = charset;
    }

    // ===== Replay =====

    pub fn charset(&self) -> &'static Encoding {
        self.charset
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    /// The request exactly as written to the socket
    pub fn recorded_output(&self) -> &[u8] {
        &self.output
    }

    /// The raw response exactly as read from the socket
    pub fn replay_input(&self) -> &[u8] {
        &self.input
    }

    pub fn recorded_input_size(&self) -> u64 {
        self.input.len() as u64
    }

    /// Length of the status line and header block, if it was completed
    pub fn header_size(&self) -> Option<usize> {
        self.message_body_begin
    }

    /// Raw input after the header block, still transfer-coded
    pub fn message_body(&self) -> &[u8] {
        match self.message_body_begin {
            Some(begin) => &self.input[begin.min(self.input.len())..],
            None => &[],
        }
    }

    /// Message body with chunked framing removed
    ///
    /// A body cut short by a timeout or the length cap de-chunks to the data
    /// that did arrive.
    pub fn entity(&self) -> Result<Cow<'_, [u8]>, RecorderError> {
        let body = self.message_body();
        if self.chunked {
            Ok(Cow::Owned(dechunk(body)?))
        } else {
            Ok(Cow::Borrowed(body))
        }
    }

    /// Entity with content coding removed
    pub fn content(&self) -> Result<Cow<'_, [u8]>, RecorderError> {
        let entity = self.entity()?;
        let Some(encoding) = self.content_encoding.as_deref() else {
            return Ok(entity);
        };
        match entity {
            Cow::Borrowed(bytes) => decode_content(encoding, bytes),
            Cow::Owned(bytes) => Ok(Cow::Owned(decode_content(encoding, &bytes)?.into_owned())),
        }
    }

    /// Content decoded to text with the resolved charset
    pub fn content_replay_string(&self) -> Result<String, RecorderError> {
        let content = self.content()?;
        let (text, _) = self.charset.decode_without_bom_handling(&content);
        Ok(text.into_owned())
    }

    /// At most `max_chars` characters of the decoded content
    pub fn content_replay_prefix_string(&self, max_chars: usize) -> Result<String, RecorderError> {
        let text = self.content_replay_string()?;
        Ok(text.chars().take(max_chars).collect())
    }

    // ===== Stream views =====

    pub fn replay_input_reader(&self) -> Cursor<&[u8]> {
        Cursor::new(&self.input)
    }

    pub fn message_body_reader(&self) -> Cursor<&[u8]> {
        Cursor::new(self.message_body())
    }

    pub fn entity_reader(&self) -> Result<Cursor<Cow<'_, [u8]>>, RecorderError> {
        Ok(Cursor::new(self.entity()?))
    }

    pub fn content_reader(&self) -> Result<Cursor<Cow<'_, [u8]>>, RecorderError> {
        Ok(Cursor::new(self.content()?))
    }
}
