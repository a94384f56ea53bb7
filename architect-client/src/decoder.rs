//! Incremental decoder for `data:` frames
//!
//! Network chunks split frames (and UTF-8 sequences) at arbitrary byte
//! offsets, so bytes are buffered until a blank line closes a frame.

use shared_types::{StreamEvent, DONE_SENTINEL};

/// One decoded unit of the generation stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(StreamEvent),
    /// End-of-stream sentinel
    Done,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed frame {payload:?}: {reason}")]
    Malformed { payload: String, reason: String },
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every frame it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Frame, DecodeError>> {
        self.buffer
            .extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));

        let mut frames = Vec::new();
        while let Some(end) = find_blank_line(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end + 2).take(end).collect();
            if let Some(frame) = decode(&raw) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Decode whatever is left once the transport has closed.
    pub fn finish(&mut self) -> Option<Result<Frame, DecodeError>> {
        let raw = std::mem::take(&mut self.buffer);
        decode(&raw)
    }
}

fn find_blank_line(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

/// `None` for frames without data lines (keep-alive comments, blank input).
fn decode(raw: &[u8]) -> Option<Result<Frame, DecodeError>> {
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text,
        Err(_) => return Some(Err(DecodeError::InvalidUtf8)),
    };

    let data_lines: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();
    if data_lines.is_empty() {
        return None;
    }

    let payload = data_lines.join("\n");
    if payload.trim() == DONE_SENTINEL {
        return Some(Ok(Frame::Done));
    }

    Some(
        serde_json::from_str::<StreamEvent>(&payload)
            .map(Frame::Event)
            .map_err(|e| DecodeError::Malformed {
                reason: e.to_string(),
                payload,
            }),
    )
}
