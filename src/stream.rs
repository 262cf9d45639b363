//! Incremental decoding of the chat endpoint's streaming body.
//!
//! The body is a sequence of newline-terminated lines. Lines starting with
//! `data: ` carry one chunk of the reply; `data: [DONE]` marks the end.
//! Anything else (blank separators, comments, other fields) is skipped.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::{Stream, StreamExt, stream};

use crate::api::TransportError;

const DATA_PREFIX: &str = "data: ";
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(String),
    Done,
}

/// Longest unterminated line kept in memory before it is discarded.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Splits raw byte fragments into frames. A line is only decoded once its
/// terminating `\n` has arrived, so fragments may cut anywhere, including
/// inside a multi-byte character.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no newline.
    scanned: usize,
    /// Set while skipping the tail of an oversized line.
    discarding: bool,
    max_line: usize,
}

impl Default for LineFramer {
    fn default() -> Self { Self::with_max_line(MAX_LINE_BYTES) }
}

impl LineFramer {
    pub fn new() -> Self { Self::default() }

    pub fn with_max_line(max_line: usize) -> Self {
        Self { buf: Vec::new(), scanned: 0, discarding: false, max_line }
    }

    pub fn feed(&mut self, fragment: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(fragment);
        let mut frames = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(pos) = self.buf[from..].iter().position(|b| *b == b'\n') {
            let end = from + pos;
            if self.discarding {
                self.discarding = false;
            } else if let Some(frame) = parse_line(&self.buf[start..end]) {
                frames.push(frame);
            }
            start = end + 1;
            from = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();
        if self.buf.len() > self.max_line {
            tracing::warn!(bytes = self.buf.len(), limit = self.max_line, "dropping oversized stream line");
            self.buf.clear();
            self.scanned = 0;
            self.discarding = true;
        }
        frames
    }

    /// Bytes of the current unterminated line.
    pub fn pending(&self) -> usize { self.buf.len() }
}

fn parse_line(raw: &[u8]) -> Option<Frame> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let line = String::from_utf8_lossy(raw);
    let payload = line.strip_prefix(DATA_PREFIX)?;
    if payload == DONE_SENTINEL {
        Some(Frame::Done)
    } else {
        Some(Frame::Data(payload.to_string()))
    }
}

struct ChunkState<S> {
    body: Pin<Box<S>>,
    framer: LineFramer,
    pending: VecDeque<Frame>,
    finished: bool,
}

/// Turns a body of byte fragments into the stream of chunk payloads.
///
/// The stream ends at the `[DONE]` frame (the rest of the body is not read),
/// at the end of the body, or right after yielding a body error. An
/// unterminated final line is dropped.
pub fn data_chunks<S, B, E>(body: S) -> impl Stream<Item = Result<String, TransportError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<TransportError>,
{
    let state = ChunkState { body: Box::pin(body), framer: LineFramer::new(), pending: VecDeque::new(), finished: false };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(frame) = st.pending.pop_front() {
                match frame {
                    Frame::Data(chunk) => return Some((Ok(chunk), st)),
                    Frame::Done => return None,
                }
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => {
                    let frames = st.framer.feed(bytes.as_ref());
                    st.pending.extend(frames);
                }
                Some(Err(e)) => {
                    st.finished = true;
                    let err: TransportError = e.into();
                    return Some((Err(err), st));
                }
                None => {
                    if st.framer.pending() > 0 {
                        tracing::debug!(bytes = st.framer.pending(), "dropping unterminated trailing line");
                    }
                    return None;
                }
            }
        }
    })
}
