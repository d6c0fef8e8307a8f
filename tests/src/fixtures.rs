use parlor_core::{
    ApiClient, ChatSession, ClientSettings, MockExchange, MockReply, Navigation, SessionEvent,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

pub const BASE_URL: &str = "http://parlor.test";

pub fn settings() -> ClientSettings {
    ClientSettings::for_base_url(BASE_URL).expect("test settings")
}

pub fn api_over(
    mock: &MockExchange,
    settings: &ClientSettings,
) -> (ApiClient, UnboundedReceiver<Navigation>) {
    ApiClient::with_exchange(Arc::new(mock.clone()), settings)
}

pub struct SessionHarness {
    pub session: ChatSession,
    pub events: UnboundedReceiver<SessionEvent>,
    pub navigation: UnboundedReceiver<Navigation>,
}

pub fn session_over(mock: &MockExchange, settings: &ClientSettings) -> SessionHarness {
    let (api, navigation) = api_over(mock, settings);
    let (session, events) = ChatSession::new(api, settings);
    SessionHarness {
        session,
        events,
        navigation,
    }
}

/// One `data:` record as the backend writes it.
pub fn data_line(record: Value) -> String {
    format!("data: {record}\n\n")
}

pub fn user_json(id: i64, email: &str) -> Value {
    json!({
        "id": id,
        "email": email,
        "is_active": true,
        "roles": ["user"],
        "created_at": "2024-05-01T09:00:00.000001"
    })
}

/// A streamed reply made of the given deltas followed by `done`.
pub fn streamed_reply(conversation_id: Option<i64>, deltas: &[&str]) -> MockReply {
    let mut chunks: Vec<String> = deltas
        .iter()
        .map(|delta| data_line(json!({ "content": delta })))
        .collect();
    chunks.push(data_line(json!({ "done": true })));
    let reply = MockReply::event_stream(chunks);
    match conversation_id {
        Some(id) => reply.header("X-Conversation-Id", id.to_string()),
        None => reply,
    }
}

pub fn drain<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}

/// Wait for the first event matching `pred`, discarding the ones before it.
pub async fn wait_for<F>(rx: &mut UnboundedReceiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("session event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}
