use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

// ==================================================================================================
// Wire constants
// ==================================================================================================

/// Prefix of every event line that carries a payload.
pub const DATA_PREFIX: &str = "data: ";

/// Payload that terminates an OpenAI-style completion stream.
pub const DONE_SENTINEL: &str = "[DONE]";

// ==================================================================================================
// Line Decoder
// ==================================================================================================

/// Longest line kept in memory. Longer lines are dropped whole.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits a chunked byte stream into text lines.
///
/// Bytes are buffered until a line terminator arrives, so lines (and
/// multi-byte UTF-8 characters) split across network chunks are reassembled
/// before decoding. `\n`, `\r\n` and a bare `\r` all end a line.
///
/// A line that grows past [`MAX_LINE_BYTES`] is discarded up to its
/// terminator and counted in [`take_oversized`](Self::take_oversized).
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    /// Previous chunk ended on `\r`; a leading `\n` belongs to it
    after_cr: bool,
    /// Current line overflowed and is being skipped
    discarding: bool,
    oversized: u64,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a network chunk and return every line it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut rest = chunk;
        if self.after_cr && !rest.is_empty() {
            self.after_cr = false;
            if rest[0] == b'\n' {
                rest = &rest[1..];
            }
        }

        let mut lines = Vec::new();
        while let Some(pos) = rest.iter().position(|&b| b == b'\n' || b == b'\r') {
            self.push(&rest[..pos]);
            if let Some(line) = self.take_line() {
                lines.push(line);
            }

            let terminator = rest[pos];
            rest = &rest[pos + 1..];
            if terminator == b'\r' {
                match rest.first() {
                    Some(b'\n') => rest = &rest[1..],
                    Some(_) => {}
                    None => self.after_cr = true,
                }
            }
        }
        self.push(rest);

        lines
    }

    /// Flush the final unterminated line, if any, at end of body.
    pub fn finish(&mut self) -> Option<String> {
        self.after_cr = false;
        if self.buffer.is_empty() && !self.discarding {
            return None;
        }
        self.take_line()
    }

    /// Number of lines dropped for exceeding [`MAX_LINE_BYTES`] since the
    /// last call.
    pub fn take_oversized(&mut self) -> u64 {
        std::mem::take(&mut self.oversized)
    }

    fn push(&mut self, bytes: &[u8]) {
        if self.discarding {
            return;
        }
        if self.buffer.len() + bytes.len() > MAX_LINE_BYTES {
            self.buffer = Vec::new();
            self.discarding = true;
            self.oversized += 1;
            return;
        }
        self.buffer.extend_from_slice(bytes);
    }

    fn take_line(&mut self) -> Option<String> {
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        Some(line)
    }
}

// ==================================================================================================
// Frame Parsing
// ==================================================================================================

/// One `data:` payload of a completion stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// The `[DONE]` sentinel
    Done,
    /// A completion chunk; `text` may be empty
    Chunk {
        text: String,
        finish_reason: Option<String>,
    },
    /// Payload that was not a usable completion chunk
    Malformed,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Option<Vec<Choice>>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    finish_reason: Option<Value>,
}

/// Parse one event line. Returns `None` for lines that carry no payload
/// (comments, `event:` lines, blank keep-alives).
pub fn parse_line(line: &str) -> Option<StreamFrame> {
    let payload = line.strip_prefix(DATA_PREFIX)?;

    if payload.trim() == DONE_SENTINEL {
        return Some(StreamFrame::Done);
    }

    let frame = match serde_json::from_str::<CompletionChunk>(payload) {
        Ok(chunk) => {
            let first = chunk.choices.and_then(|choices| choices.into_iter().next());
            match first {
                Some(choice) => StreamFrame::Chunk {
                    text: choice.text.unwrap_or_default(),
                    finish_reason: choice.finish_reason.and_then(finish_reason_string),
                },
                None => StreamFrame::Chunk {
                    text: String::new(),
                    finish_reason: None,
                },
            }
        }
        Err(_) => StreamFrame::Malformed,
    };

    Some(frame)
}

fn finish_reason_string(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

// ==================================================================================================
// Stream Progress
// ==================================================================================================

/// Token and completion signals accumulated over one response stream.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StreamProgress {
    pub tokens_received: u64,
    /// Elapsed time at the first non-empty fragment
    pub first_token_at: Option<Duration>,
    pub finish_reason: Option<String>,
    pub completed: bool,
    pub malformed_frames: u64,
}

impl StreamProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one frame into the progress. `elapsed` is the time since the
    /// request started. Returns `true` once reading should stop.
    pub fn observe(&mut self, frame: StreamFrame, elapsed: Duration) -> bool {
        match frame {
            StreamFrame::Done => {
                self.completed = true;
                true
            }
            StreamFrame::Chunk {
                text,
                finish_reason,
            } => {
                if !text.is_empty() {
                    self.tokens_received += 1;
                    if self.first_token_at.is_none() {
                        self.first_token_at = Some(elapsed);
                    }
                }
                if let Some(reason) = finish_reason {
                    self.finish_reason = Some(reason);
                    self.completed = true;
                }
                false
            }
            StreamFrame::Malformed => {
                self.malformed_frames += 1;
                false
            }
        }
    }
}
