//! Scripted in-process backend.
//!
//! Used by the test suites and by `xtask smoke` to drive the transport and the chat
//! session without a server. Replies are queued per route and consumed in order.

use crate::error::ClientError;
use crate::exchange::{ApiRequest, ApiResponse, HttpExchange};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

#[derive(Debug, Clone)]
enum BodyEnd {
    Close,
    Fail(String),
    Hang,
}

/// One scripted response.
#[derive(Debug, Clone)]
pub struct MockReply {
    status: StatusCode,
    headers: Vec<(String, String)>,
    chunks: Vec<Vec<u8>>,
    end: BodyEnd,
    delay: Option<Duration>,
    gate: Option<Arc<Barrier>>,
    hang: bool,
    pace: Option<Duration>,
}

impl MockReply {
    pub fn status(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            headers: Vec::new(),
            chunks: Vec::new(),
            end: BodyEnd::Close,
            delay: None,
            gate: None,
            hang: false,
            pace: None,
        }
    }

    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self::status(status)
            .header("content-type", "application/json")
            .chunk(body.to_string())
    }

    /// A `200 text/event-stream` body delivered in exactly the given chunks.
    pub fn event_stream<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        let mut reply = Self::status(200).header("content-type", "text/event-stream");
        reply.chunks = chunks.into_iter().map(Into::into).collect();
        reply
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn chunk(mut self, chunk: impl Into<Vec<u8>>) -> Self {
        self.chunks.push(chunk.into());
        self
    }

    /// Wait before answering.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Hold the answer until every party of the barrier has arrived.
    pub fn gated(mut self, barrier: Arc<Barrier>) -> Self {
        self.gate = Some(barrier);
        self
    }

    /// Wait `interval` before each body chunk.
    pub fn paced(mut self, interval: Duration) -> Self {
        self.pace = Some(interval);
        self
    }

    /// Never answer.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Break the connection after the scripted chunks.
    pub fn then_fail(mut self, reason: impl Into<String>) -> Self {
        self.end = BodyEnd::Fail(reason.into());
        self
    }

    /// Keep the connection open and silent after the scripted chunks.
    pub fn then_stall(mut self) -> Self {
        self.end = BodyEnd::Hang;
        self
    }

    fn into_response(self) -> ApiResponse {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        let chunks = stream::iter(self.chunks.into_iter().map(Ok::<_, ClientError>));
        let chunks = match self.pace {
            Some(interval) => chunks
                .then(move |chunk| async move {
                    tokio::time::sleep(interval).await;
                    chunk
                })
                .boxed(),
            None => chunks.boxed(),
        };
        let body = match self.end {
            BodyEnd::Close => chunks,
            BodyEnd::Fail(reason) => chunks
                .chain(stream::once(async move {
                    Err(ClientError::Network(reason))
                }))
                .boxed(),
            BodyEnd::Hang => chunks.chain(stream::pending()).boxed(),
        };
        ApiResponse {
            status: self.status,
            headers,
            body,
        }
    }
}

#[derive(Default)]
struct MockState {
    routes: HashMap<(Method, String), VecDeque<MockReply>>,
    calls: Vec<ApiRequest>,
}

#[derive(Clone, Default)]
pub struct MockExchange {
    state: Arc<Mutex<MockState>>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for `method path`. Query strings are not part of the route.
    pub fn enqueue(&self, method: Method, path: &str, reply: MockReply) -> &Self {
        self.state
            .lock()
            .routes
            .entry((method, path.to_owned()))
            .or_default()
            .push_back(reply);
        self
    }

    pub fn on_get(&self, path: &str, reply: MockReply) -> &Self {
        self.enqueue(Method::GET, path, reply)
    }

    pub fn on_post(&self, path: &str, reply: MockReply) -> &Self {
        self.enqueue(Method::POST, path, reply)
    }

    pub fn calls(&self) -> Vec<ApiRequest> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, path: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.path == path)
            .count()
    }

    pub fn last_call(&self, path: &str) -> Option<ApiRequest> {
        self.state
            .lock()
            .calls
            .iter()
            .rev()
            .find(|call| call.path == path)
            .cloned()
    }

    pub fn pending_replies(&self) -> usize {
        self.state.lock().routes.values().map(VecDeque::len).sum()
    }
}

#[async_trait]
impl HttpExchange for MockExchange {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        let reply = {
            let mut state = self.state.lock();
            state.calls.push(request.clone());
            state
                .routes
                .get_mut(&(request.method.clone(), request.path.clone()))
                .and_then(VecDeque::pop_front)
        };
        let Some(reply) = reply else {
            return Ok(MockReply::json(
                404,
                serde_json::json!({
                    "detail": format!("no scripted reply for {} {}", request.method, request.path)
                }),
            )
            .into_response());
        };
        if let Some(gate) = &reply.gate {
            gate.wait().await;
        }
        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }
        if reply.hang {
            futures::future::pending::<()>().await;
        }
        Ok(reply.into_response())
    }
}
