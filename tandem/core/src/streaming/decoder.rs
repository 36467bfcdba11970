//! Stream Decoder
//!
//! Turns the raw byte fragments of one response body into discrete
//! [`StreamEvent`]s. The body is a sequence of `data: <json>` records separated
//! by blank lines. Fragment boundaries are arbitrary: a record, or even a
//! single UTF-8 character, may be split across fragments.

use std::collections::VecDeque;

use bytes::{Buf, BytesMut};
use futures::{Stream, StreamExt};
use serde::Deserialize;

use crate::backend::{ByteStream, TransportError};
use crate::messages::ServerId;

/// A protocol event decoded from the response body
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// A chunk of generated text
    Content {
        /// The text to append
        text: String,
        /// Which model produced it (dual mode only)
        model_index: Option<usize>,
    },
    /// A logical stream finished successfully
    Complete {
        /// Identifier the server stored the response under
        message_id: Option<ServerId>,
        /// Which model finished (absent: every model)
        model_index: Option<usize>,
    },
    /// A logical stream failed
    Error {
        /// User-visible error text
        message: String,
        /// Which model failed (absent: every model)
        model_index: Option<usize>,
    },
}

impl StreamEvent {
    /// Whether this event ends a logical stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// The model index this event is addressed to
    #[must_use]
    pub fn model_index(&self) -> Option<usize> {
        match self {
            Self::Content { model_index, .. }
            | Self::Complete { model_index, .. }
            | Self::Error { model_index, .. } => *model_index,
        }
    }
}

/// One JSON payload as the server writes it
#[derive(Debug, Default, Deserialize)]
struct WirePayload {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    done: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message_id: Option<WireId>,
    #[serde(default)]
    model_index: Option<usize>,
}

/// Server message ids are strings, but older servers send integers
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(i64),
}

impl From<WireId> for ServerId {
    fn from(id: WireId) -> Self {
        match id {
            WireId::Text(s) => ServerId(s),
            WireId::Number(n) => ServerId(n.to_string()),
        }
    }
}

/// Text shown in place of content when the transport fails
#[must_use]
pub fn failure_text(error: &TransportError) -> String {
    format!("Error: {error}")
}

/// Extract the payload of a `data:` line.
///
/// Returns `None` for blank lines, comments, other SSE fields and the
/// `[DONE]` sentinel.
fn extract_data(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }
    let data = trimmed
        .strip_prefix("data: ")
        .or_else(|| trimmed.strip_prefix("data:"))?
        .trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    Some(data)
}

/// Decode one record into zero, one or two events.
///
/// Malformed records decode to nothing.
pub fn decode_record(data: &str) -> Vec<StreamEvent> {
    let payload: WirePayload = match serde_json::from_str(data) {
        Ok(p) => p,
        Err(e) => {
            tracing::debug!(error = %e, record = %truncate(data, 80), "Dropping malformed record");
            return Vec::new();
        }
    };

    let model_index = payload.model_index;

    if let Some(message) = payload.error {
        return vec![StreamEvent::Error {
            message,
            model_index,
        }];
    }

    let mut events = Vec::with_capacity(2);
    if let Some(text) = payload.content.filter(|c| !c.is_empty()) {
        events.push(StreamEvent::Content { text, model_index });
    }
    if payload.done.unwrap_or(false) {
        events.push(StreamEvent::Complete {
            message_id: payload.message_id.map(ServerId::from),
            model_index,
        });
    }
    events
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Longest line buffered while waiting for its newline
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental decoder state for one response body
///
/// Feed fragments with [`Decoder::push`] and call [`Decoder::finish`] when the
/// transport closes. Once every lane has seen a terminal event the decoder is
/// finished and ignores further input.
///
/// A line longer than the limit is dropped as malformed, up to and including
/// its newline.
#[derive(Debug)]
pub struct Decoder {
    buffer: BytesMut,
    /// Bytes of `buffer` already known to hold no newline
    scanned: usize,
    max_line: usize,
    /// Inside a line that exceeded `max_line`
    oversize: bool,
    lanes: Vec<bool>,
    finished: bool,
}

impl Decoder {
    /// Create a decoder expecting `lanes` logical streams (1 or 2)
    #[must_use]
    pub fn new(lanes: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            scanned: 0,
            max_line: MAX_LINE_BYTES,
            oversize: false,
            lanes: vec![false; lanes.max(1)],
            finished: false,
        }
    }

    /// Override the line length limit
    #[must_use]
    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }

    /// Whether every logical stream has terminated
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Consume a fragment and return the events it completes
    pub fn push(&mut self, fragment: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.buffer.extend_from_slice(fragment);

        loop {
            let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n')
            else {
                self.scanned = self.buffer.len();
                if self.scanned > self.max_line {
                    tracing::debug!(len = self.scanned, limit = self.max_line, "Dropping oversize line");
                    self.buffer.clear();
                    self.scanned = 0;
                    self.oversize = true;
                }
                break;
            };

            let newline = self.scanned + offset;
            let line = self.buffer.split_to(newline + 1);
            self.scanned = 0;
            if std::mem::take(&mut self.oversize) {
                continue;
            }
            self.decode_line(&line[..newline], &mut events);
            if self.finished {
                self.buffer.clear();
                break;
            }
        }
        events
    }

    /// Signal transport close.
    ///
    /// Decodes any unterminated trailing line, then reports a premature close
    /// if some logical stream never terminated.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        if self.buffer.has_remaining() && !self.oversize {
            let rest = self.buffer.split();
            self.decode_line(&rest, &mut events);
        }
        if !self.finished {
            events.push(self.abort(&TransportError::PrematureClose));
        }
        events
    }

    /// Terminate every open lane because the transport failed
    pub fn abort(&mut self, error: &TransportError) -> StreamEvent {
        self.finished = true;
        self.buffer.clear();
        self.scanned = 0;
        self.lanes.iter_mut().for_each(|done| *done = true);
        StreamEvent::Error {
            message: failure_text(error),
            model_index: None,
        }
    }

    fn decode_line(&mut self, raw: &[u8], events: &mut Vec<StreamEvent>) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let Ok(line) = std::str::from_utf8(raw) else {
            tracing::debug!(len = raw.len(), "Dropping record with invalid UTF-8");
            return;
        };
        let Some(data) = extract_data(line) else {
            return;
        };
        for event in decode_record(data) {
            if self.accept(&event) {
                events.push(event);
            }
            if self.finished {
                return;
            }
        }
    }

    /// Lane bookkeeping. Returns false for events that must be dropped.
    fn accept(&mut self, event: &StreamEvent) -> bool {
        match event.model_index() {
            Some(index) if index >= self.lanes.len() => {
                tracing::debug!(index, lanes = self.lanes.len(), "Dropping event for unknown model index");
                false
            }
            Some(index) if self.lanes[index] => {
                tracing::debug!(index, "Dropping event after lane terminated");
                false
            }
            Some(index) => {
                if event.is_terminal() {
                    self.lanes[index] = true;
                    self.finished = self.lanes.iter().all(|done| *done);
                }
                true
            }
            None => {
                if event.is_terminal() {
                    self.lanes.iter_mut().for_each(|done| *done = true);
                    self.finished = true;
                }
                true
            }
        }
    }
}

/// Decode a response body into a lazy, finite event sequence.
///
/// The sequence ends once every lane has terminated, or with a synthetic
/// error when the transport closes or fails first.
pub fn decode(body: ByteStream, lanes: usize) -> impl Stream<Item = StreamEvent> + Send {
    futures::stream::unfold(
        (body, Decoder::new(lanes), VecDeque::new()),
        |(mut body, mut decoder, mut pending)| async move {
            loop {
                if let Some(event) = pending.pop_front() {
                    return Some((event, (body, decoder, pending)));
                }
                if decoder.is_finished() {
                    return None;
                }
                match body.next().await {
                    Some(Ok(fragment)) => pending.extend(decoder.push(&fragment)),
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "Transport failed mid-stream");
                        pending.push_back(decoder.abort(&e));
                    }
                    None => pending.extend(decoder.finish()),
                }
            }
        },
    )
}
