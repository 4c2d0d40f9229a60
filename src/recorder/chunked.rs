//! Incremental decoder for `Transfer-Encoding: chunked`
//!
//! The same decoder serves two callers: the read loop feeds it as bytes
//! arrive to learn when the final chunk has been seen, and the recorder
//! runs it over the whole message body to produce the entity.

use crate::RecorderError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    /// Reading a chunk-size line
    Size,
    /// Copying chunk data; bytes remaining in the chunk
    Data(u64),
    /// Expecting the CRLF that closes a chunk
    DataEnd,
    /// Reading trailer lines after the zero-size chunk
    Trailer,
    Done,
}

#[derive(Debug, Clone)]
pub struct ChunkedDecoder {
    state: State,
    line: Vec<u8>,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Size,
            line: Vec::new(),
        }
    }

    /// True once the terminating zero-size chunk and trailers were consumed
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Feeds raw framed bytes, appending de-chunked data to `out`
    pub fn feed(&mut self, mut data: &[u8], out: &mut Vec<u8>) -> Result<(), RecorderError> {
        while !data.is_empty() {
            match self.state {
                State::Done => return Ok(()),
                State::Size | State::Trailer => {
                    let Some(newline) = data.iter().position(|&b| b == b'\n') else {
                        self.line.extend_from_slice(data);
                        return Ok(());
                    };
                    self.line.extend_from_slice(&data[..newline]);
                    data = &data[newline + 1..];
                    let line = std::mem::take(&mut self.line);
                    self.end_of_line(&line)?;
                }
                State::Data(remaining) => {
                    let take = remaining.min(data.len() as u64) as usize;
                    out.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        State::DataEnd
                    } else {
                        State::Data(left)
                    };
                }
                State::DataEnd => match data[0] {
                    b'\r' => data = &data[1..],
                    b'\n' => {
                        data = &data[1..];
                        self.state = State::Size;
                    }
                    // missing CRLF; treat the byte as the next size line
                    _ => self.state = State::Size,
                },
            }
        }
        Ok(())
    }

    fn end_of_line(&mut self, line: &[u8]) -> Result<(), RecorderError> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if self.state == State::Trailer {
            if line.is_empty() {
                self.state = State::Done;
            }
            return Ok(());
        }

        // tolerate blank lines between chunks and leading whitespace
        let Some(start) = line.iter().position(|b| !b.is_ascii_whitespace()) else {
            return Ok(());
        };
        // lines may have ended in a bare LF; httparse wants CRLF
        let mut size_line = Vec::with_capacity(line.len() - start + 2);
        size_line.extend_from_slice(&line[start..]);
        size_line.extend_from_slice(b"\r\n");
        let size = match httparse::parse_chunk_size(&size_line) {
            Ok(httparse::Status::Complete((_, size))) => size,
            Ok(httparse::Status::Partial) | Err(_) => {
                return Err(RecorderError::ChunkSize(
                    String::from_utf8_lossy(line).into_owned(),
                ))
            }
        };
        self.state = if size == 0 {
            State::Trailer
        } else {
            State::Data(size)
        };
        Ok(())
    }
}

/// De-chunks a complete (or truncated) message body
pub fn dechunk(body: &[u8]) -> Result<Vec<u8>, RecorderError> {
    let mut decoder = ChunkedDecoder::new();
    let mut out = Vec::with_capacity(body.len());
    decoder.feed(body, &mut out)?;
    Ok(out)
}
