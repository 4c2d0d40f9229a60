//! Response reading: status line and headers, body framing, and the read
//! loop that enforces the socket timeout, the overall deadline, the length
//! cap and the bandwidth limit while every byte goes into the recorder

use super::connect::AsyncStream;
use crate::recorder::{ChunkedDecoder, Recorder};
use crate::state::ResponseHeaders;
use crate::FetchFailure;
use encoding_rs::Encoding;
use std::io;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::{sleep, timeout, Instant};

const MAX_HEADERS: usize = 256;
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Status line and headers of a response
#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: ResponseHeaders,
    /// Bytes taken by the status line and header block
    pub header_len: usize,
}

/// Parses a response head once the whole header block is present
///
/// Returns `Ok(None)` while more bytes are needed.
pub(crate) fn parse_head(buf: &[u8]) -> Result<Option<ResponseHead>, String> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut slots);
    let header_len = match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(e.to_string()),
    };

    let mut headers = ResponseHeaders::new();
    for header in response.headers.iter() {
        // header bytes are ISO-8859-1
        let value: String = header.value.iter().map(|&b| b as char).collect();
        headers.push(header.name, value.trim());
    }
    Ok(Some(ResponseHead {
        status: response.code.unwrap_or_default(),
        reason: response.reason.unwrap_or_default().to_string(),
        headers,
        header_len,
    }))
}

/// How the end of the message body is found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// No body (1xx, 204, 304)
    Empty,
    Chunked,
    Length(u64),
    /// Read until the server closes the connection
    UntilClose,
}

pub(crate) fn framing(head: &ResponseHead) -> Framing {
    if (100..200).contains(&head.status) || head.status == 204 || head.status == 304 {
        return Framing::Empty;
    }
    let chunked = head
        .headers
        .get_all("transfer-encoding")
        .flat_map(|v| v.split(','))
        .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return Framing::Chunked;
    }
    match head
        .headers
        .get("content-length")
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        Some(length) => Framing::Length(length),
        None => Framing::UntilClose,
    }
}

/// The `charset` parameter of a Content-Type value, unquoted
pub(crate) fn charset_param(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("charset") {
            return None;
        }
        Some(value.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
    })
}

/// Picks the text encoding for a response
///
/// Returns the encoding and, when the header named a charset that is not
/// recognized, that charset value.
pub(crate) fn resolve_charset(
    content_type: Option<&str>,
    default: &'static Encoding,
) -> (&'static Encoding, Option<String>) {
    let Some(label) = content_type.and_then(charset_param) else {
        return (default, None);
    };
    match Encoding::for_label(label.as_bytes()) {
        Some(encoding) => (encoding, None),
        None => (default, Some(label)),
    }
}

/// Time, size and bandwidth limits of one attempt
#[derive(Debug, Clone)]
pub(crate) struct ReadBudget {
    socket_timeout: Duration,
    deadline: Instant,
    /// Response byte cap; 0 is unlimited
    max_length: u64,
    /// Bytes per second; 0 is unlimited
    max_rate: u64,
    read_started: Instant,
}

#[derive(Debug)]
enum ReadEvent {
    Data,
    Eof,
    Timeout,
    LengthCap,
    Failed(io::Error),
}

/// How reading the body ended, when it did not end normally
#[derive(Debug, Default)]
pub(crate) struct BodyOutcome {
    pub time_truncated: bool,
    pub length_truncated: bool,
    pub error: Option<io::Error>,
}

impl ReadBudget {
    pub fn new(
        socket_timeout: Duration,
        deadline: Instant,
        max_length: u64,
        max_kb_sec: u64,
    ) -> Self {
        Self {
            socket_timeout,
            deadline,
            max_length,
            max_rate: max_kb_sec.saturating_mul(1024),
            read_started: Instant::now(),
        }
    }

    async fn read_some(
        &self,
        stream: &mut Box<dyn AsyncStream>,
        recorder: &mut Recorder,
        buf: &mut [u8],
    ) -> ReadEvent {
        let mut want = buf.len();
        if self.max_length > 0 {
            // one byte past the cap shows the response was longer
            let allowed = (self.max_length + 1).saturating_sub(recorder.recorded_input_size());
            if allowed == 0 {
                return ReadEvent::LengthCap;
            }
            want = want.min(allowed as usize);
        }

        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return ReadEvent::Timeout;
        }
        let wait = self.socket_timeout.min(remaining);

        match timeout(wait, stream.read(&mut buf[..want])).await {
            Err(_) => ReadEvent::Timeout,
            Ok(Ok(0)) => ReadEvent::Eof,
            Ok(Ok(n)) => {
                recorder.record_input(&buf[..n]);
                self.throttle(recorder.recorded_input_size()).await;
                ReadEvent::Data
            }
            Ok(Err(e)) => ReadEvent::Failed(e),
        }
    }

    /// Sleeps until `total` bytes are no faster than the rate limit allows
    async fn throttle(&self, total: u64) {
        if self.max_rate == 0 {
            return;
        }
        let required = Duration::from_secs_f64(total as f64 / self.max_rate as f64);
        let elapsed = self.read_started.elapsed();
        if required <= elapsed {
            return;
        }
        let pause = (required - elapsed).min(self.deadline.saturating_duration_since(Instant::now()));
        sleep(pause).await;
    }
}

/// Reads until the header block is complete
pub(crate) async fn read_head(
    stream: &mut Box<dyn AsyncStream>,
    recorder: &mut Recorder,
    budget: &ReadBudget,
    target: &str,
) -> Result<ResponseHead, FetchFailure> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let parsed = parse_head(recorder.replay_input()).map_err(|message| {
            FetchFailure::MalformedResponse {
                target: target.to_string(),
                message,
            }
        })?;
        if let Some(head) = parsed {
            recorder.mark_message_body_begin(head.header_len);
            return Ok(head);
        }

        match budget.read_some(stream, recorder, &mut buf).await {
            ReadEvent::Data => continue,
            ReadEvent::Eof if recorder.replay_input().is_empty() => {
                return Err(FetchFailure::NoResponse {
                    target: target.to_string(),
                })
            }
            ReadEvent::Eof => {
                return Err(FetchFailure::MalformedResponse {
                    target: target.to_string(),
                    message: "connection closed inside response headers".to_string(),
                })
            }
            ReadEvent::Timeout => {
                return Err(FetchFailure::ResponseTimeout {
                    target: target.to_string(),
                })
            }
            ReadEvent::LengthCap => {
                return Err(FetchFailure::MalformedResponse {
                    target: target.to_string(),
                    message: "length cap reached inside response headers".to_string(),
                })
            }
            ReadEvent::Failed(e) => return Err(FetchFailure::Io(e)),
        }
    }
}

/// Reads the message body according to its framing
///
/// Bytes already read past the header block count toward the body.
pub(crate) async fn read_body(
    stream: &mut Box<dyn AsyncStream>,
    recorder: &mut Recorder,
    budget: &ReadBudget,
    mut framing: Framing,
    header_len: usize,
) -> BodyOutcome {
    let mut outcome = BodyOutcome::default();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut decoder = ChunkedDecoder::new();
    let mut scratch = Vec::new();
    let mut fed = header_len;

    loop {
        let input_len = recorder.replay_input().len();
        match framing {
            Framing::Empty => {
                recorder.truncate_input(header_len);
                return outcome;
            }
            Framing::Length(length) => {
                let body_len = input_len.saturating_sub(header_len) as u64;
                if body_len >= length {
                    recorder.truncate_input(header_len + length as usize);
                    return outcome;
                }
            }
            Framing::Chunked => {
                scratch.clear();
                let fed_result = decoder.feed(&recorder.replay_input()[fed..], &mut scratch);
                fed = input_len;
                if let Err(e) = fed_result {
                    tracing::debug!("bad chunk framing ({}), reading to end of stream", e);
                    framing = Framing::UntilClose;
                } else if decoder.is_done() {
                    return outcome;
                }
            }
            Framing::UntilClose => {}
        }

        match budget.read_some(stream, recorder, &mut buf).await {
            ReadEvent::Data => continue,
            ReadEvent::Eof => return outcome,
            ReadEvent::Timeout => {
                outcome.time_truncated = true;
                return outcome;
            }
            ReadEvent::LengthCap => {
                outcome.length_truncated = true;
                return outcome;
            }
            ReadEvent::Failed(e) => {
                outcome.error = Some(e);
                return outcome;
            }
        }
    }
}
