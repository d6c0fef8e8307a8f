use crate::error::ClientError;
use crate::exchange::ResponseBody;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{trace, warn};

const DATA_PREFIX: &str = "data: ";
const CLOSED_EARLY: &str = "connection closed before completion";

/// One record of the chat response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    ContentDelta(String),
    Completed,
    Error(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::ContentDelta(_))
    }
}

/// Push decoder for `data: {json}\n` records.
///
/// Chunks may split a record anywhere, including inside a multi-byte character, so
/// the incomplete tail is kept as raw bytes until its newline arrives.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    carry: Vec<u8>,
    terminated: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a `completed` or `error` record has been produced.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.terminated {
            return events;
        }
        self.carry.extend_from_slice(chunk);
        let mut start = 0;
        while let Some(offset) = self.carry[start..].iter().position(|byte| *byte == b'\n') {
            let end = start + offset;
            let line = String::from_utf8_lossy(&self.carry[start..end]).into_owned();
            start = end + 1;
            if self.accept(&line, &mut events) {
                break;
            }
        }
        if self.terminated {
            self.carry.clear();
        } else {
            self.carry.drain(..start);
        }
        events
    }

    /// Decode a trailing record that arrived without its newline.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.terminated || self.carry.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        let mut events = Vec::new();
        self.accept(&line, &mut events);
        events.pop()
    }

    /// Returns true once a terminal record has been accepted.
    fn accept(&mut self, line: &str, events: &mut Vec<StreamEvent>) -> bool {
        if let Some(event) = parse_line(line) {
            self.terminated = event.is_terminal();
            events.push(event);
        }
        self.terminated
    }
}

/// Decode a single line. Lines without the `data: ` prefix are ignored.
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let payload = line.strip_prefix(DATA_PREFIX)?.trim();
    if payload.is_empty() {
        return None;
    }
    let record: Value = match serde_json::from_str(payload) {
        Ok(record) => record,
        Err(err) => {
            warn!(%err, %payload, "skipping malformed stream record");
            return None;
        }
    };
    let Value::Object(fields) = record else {
        trace!(%payload, "ignoring non-object stream record");
        return None;
    };
    if let Some(error) = fields.get("error").filter(|value| truthy(value)) {
        let message = match error {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        return Some(StreamEvent::Error(message));
    }
    if fields.get("done").is_some_and(truthy) {
        return Some(StreamEvent::Completed);
    }
    match fields.get("content") {
        Some(Value::String(delta)) if !delta.is_empty() => {
            Some(StreamEvent::ContentDelta(delta.clone()))
        }
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Events decoded from a response body, consumed once.
pub type FrameStream = BoxStream<'static, Result<StreamEvent, ClientError>>;

struct DecodeState {
    body: ResponseBody,
    decoder: FrameDecoder,
    pending: VecDeque<Result<StreamEvent, ClientError>>,
    exhausted: bool,
}

/// Turn a response body into stream events.
///
/// The stream ends right after the first terminal event. A transport failure is
/// yielded as `Err` and ends the stream; running out of body without a terminal
/// event yields `ClientError::StreamTerminated`.
pub fn decode_stream(body: ResponseBody) -> FrameStream {
    let state = DecodeState {
        body,
        decoder: FrameDecoder::new(),
        pending: VecDeque::new(),
        exhausted: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.exhausted {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    state
                        .pending
                        .extend(state.decoder.push(&chunk).into_iter().map(Ok));
                    state.exhausted = state.decoder.is_terminated();
                }
                Some(Err(err)) => {
                    state.exhausted = true;
                    state.pending.push_back(Err(err));
                }
                None => {
                    state.exhausted = true;
                    state.pending.extend(state.decoder.finish().map(Ok));
                    if !state.decoder.is_terminated() {
                        state
                            .pending
                            .push_back(Err(ClientError::StreamTerminated(CLOSED_EARLY.into())));
                    }
                }
            }
        }
    })
    .boxed()
}

/// Fail the body with `ClientError::Stalled` when no chunk arrives within `after`.
///
/// Any bytes reset the clock, including comment and keepalive lines that decode to
/// no event.
pub fn stall_guard(body: ResponseBody, after: Duration) -> ResponseBody {
    stream::unfold(Some(body), move |body| async move {
        let mut body = body?;
        match tokio::time::timeout(after, body.next()).await {
            Ok(Some(item)) => Some((item, Some(body))),
            Ok(None) => None,
            Err(_) => Some((Err(ClientError::Stalled(after)), None)),
        }
    })
    .boxed()
}
