use crate::api::ApiClient;
use crate::config::ClientSettings;
use crate::error::ClientError;
use crate::frames::{decode_stream, stall_guard, StreamEvent};
use crate::model::{ChatData, Message, MessageId, MessageRole};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Sending,
    StreamingResponse,
    Errored,
}

/// Cached data the UI should reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheScope {
    ConversationList,
    Conversation(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PhaseChanged(Phase),
    ConversationAdopted(i64),
    Delta(String),
    Completed(Message),
    /// User-facing description of a failed send.
    Failed(String),
    Cancelled,
    Invalidate(CacheScope),
    SelectionCleared,
}

#[derive(Debug)]
pub enum SendOutcome {
    /// Blank text, or another send is still in flight. Nothing changed.
    Rejected,
    Completed {
        conversation_id: Option<i64>,
        reply: Message,
    },
    Failed {
        error: ClientError,
        message: String,
    },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSessionState {
    pub conversation_id: Option<i64>,
    pub transcript: Vec<Message>,
    pub streaming_buffer: String,
    pub phase: Phase,
}

impl Default for ChatSessionState {
    fn default() -> Self {
        Self {
            conversation_id: None,
            transcript: Vec::new(),
            streaming_buffer: String::new(),
            phase: Phase::Idle,
        }
    }
}

enum StreamEnd {
    Completed,
    Cancelled { after_headers: bool },
}

/// One chat pane: an optimistic transcript plus at most one in-flight send.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    api: ApiClient,
    state: RwLock<ChatSessionState>,
    next_local_id: AtomicU64,
    cancel: Mutex<Option<CancellationToken>>,
    stall_timeout: Duration,
    events_tx: UnboundedSender<SessionEvent>,
}

impl ChatSession {
    pub fn new(api: ApiClient, settings: &ClientSettings) -> (Self, UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = unbounded_channel();
        let inner = SessionInner {
            api,
            state: RwLock::new(ChatSessionState::default()),
            next_local_id: AtomicU64::new(1),
            cancel: Mutex::new(None),
            stall_timeout: settings.stall_timeout,
            events_tx,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    pub fn snapshot(&self) -> ChatSessionState {
        self.inner.state.read().clone()
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.read().phase
    }

    pub fn conversation_id(&self) -> Option<i64> {
        self.inner.state.read().conversation_id
    }

    pub fn transcript(&self) -> Vec<Message> {
        self.inner.state.read().transcript.clone()
    }

    /// Point the session at another conversation. Refused while a send is in flight.
    pub fn select_conversation(&self, conversation_id: Option<i64>) -> bool {
        let mut state = self.inner.state.write();
        if state.phase != Phase::Idle {
            return false;
        }
        if state.conversation_id != conversation_id {
            state.conversation_id = conversation_id;
            state.transcript.clear();
            state.streaming_buffer.clear();
        }
        true
    }

    /// Start a fresh conversation; the server assigns its id on the first send.
    pub fn new_conversation(&self) -> bool {
        self.select_conversation(None)
    }

    /// Fetch chat page data and, when idle, reconcile the transcript with it.
    pub async fn load(&self, conversation_id: Option<i64>) -> Result<ChatData, ClientError> {
        let data = self.inner.api.chat_data(conversation_id).await?;
        let mut state = self.inner.state.write();
        if state.phase == Phase::Idle && state.conversation_id == conversation_id {
            state.transcript = data
                .current_conversation
                .as_ref()
                .filter(|detail| Some(detail.id) == conversation_id)
                .map(|detail| detail.messages.clone())
                .unwrap_or_default();
        }
        Ok(data)
    }

    /// Select a conversation and load its messages.
    pub async fn open(&self, conversation_id: i64) -> Result<ChatData, ClientError> {
        if !self.select_conversation(Some(conversation_id)) {
            return Err(ClientError::InvalidInput(
                "wait for the current reply before switching conversations".into(),
            ));
        }
        self.load(Some(conversation_id)).await
    }

    /// Send `text` to the selected conversation and consume the streamed reply.
    ///
    /// Failures never escape: the optimistic user entry is rolled back and the error
    /// is returned inside [`SendOutcome::Failed`].
    pub async fn send(&self, text: &str, title: Option<&str>) -> SendOutcome {
        let text = text.trim();
        if text.is_empty() {
            return SendOutcome::Rejected;
        }

        let (provisional_id, conversation_id, token) = {
            let mut state = self.inner.state.write();
            if state.phase != Phase::Idle {
                debug!(phase = ?state.phase, "send rejected while another is in flight");
                return SendOutcome::Rejected;
            }
            let provisional_id = MessageId::Provisional(self.next_local_id());
            state
                .transcript
                .push(Message::new(provisional_id, MessageRole::User, text));
            state.streaming_buffer.clear();
            state.phase = Phase::Sending;
            let token = CancellationToken::new();
            *self.inner.cancel.lock() = Some(token.clone());
            (provisional_id, state.conversation_id, token)
        };
        self.emit(SessionEvent::PhaseChanged(Phase::Sending));
        info!(?conversation_id, chars = text.len(), "sending chat message");

        let result = self.stream_reply(conversation_id, text, title, &token).await;
        self.inner.cancel.lock().take();

        match result {
            Ok(StreamEnd::Completed) => self.finish_completed(provisional_id),
            Ok(StreamEnd::Cancelled { after_headers }) => {
                self.finish_cancelled(provisional_id, after_headers)
            }
            Err(error) => self.finish_failed(provisional_id, error),
        }
    }

    /// Abort the in-flight send, if any. Returns whether there was one.
    pub fn cancel(&self) -> bool {
        match self.inner.cancel.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn rename(&self, conversation_id: i64, title: &str) -> Result<(), ClientError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ClientError::InvalidInput(
                "conversation title cannot be empty".into(),
            ));
        }
        if let Err(err) = self.inner.api.update_conversation(conversation_id, title).await {
            warn!(conversation_id, %err, "failed to rename conversation");
            return Err(err);
        }
        self.invalidate(Some(conversation_id));
        Ok(())
    }

    /// Delete a conversation. The selected one cannot be deleted while a send is in
    /// flight.
    pub async fn delete(&self, conversation_id: i64) -> Result<(), ClientError> {
        {
            let state = self.inner.state.read();
            if state.phase != Phase::Idle && state.conversation_id == Some(conversation_id) {
                return Err(ClientError::InvalidInput(
                    "wait for the current reply before deleting this conversation".into(),
                ));
            }
        }
        if let Err(err) = self.inner.api.delete_conversation(conversation_id).await {
            warn!(conversation_id, %err, "failed to delete conversation");
            return Err(err);
        }
        let cleared = {
            let mut state = self.inner.state.write();
            if state.conversation_id == Some(conversation_id) {
                state.conversation_id = None;
                if state.phase == Phase::Idle {
                    state.transcript.clear();
                } else {
                    // A send started while the delete was in flight; its conversation is gone.
                    self.cancel();
                }
                true
            } else {
                false
            }
        };
        if cleared {
            self.emit(SessionEvent::SelectionCleared);
        }
        self.invalidate(Some(conversation_id));
        Ok(())
    }

    async fn stream_reply(
        &self,
        conversation_id: Option<i64>,
        text: &str,
        title: Option<&str>,
        token: &CancellationToken,
    ) -> Result<StreamEnd, ClientError> {
        let reply = tokio::select! {
            _ = token.cancelled() => return Ok(StreamEnd::Cancelled { after_headers: false }),
            reply = self.inner.api.send_message(conversation_id, text, title) => reply?,
        };

        {
            let mut state = self.inner.state.write();
            if let (None, Some(assigned)) = (state.conversation_id, reply.conversation_id) {
                state.conversation_id = Some(assigned);
                info!(conversation_id = assigned, "adopted server conversation id");
                self.emit(SessionEvent::ConversationAdopted(assigned));
            }
            state.phase = Phase::StreamingResponse;
        }
        self.emit(SessionEvent::PhaseChanged(Phase::StreamingResponse));

        let mut events = decode_stream(stall_guard(reply.body, self.inner.stall_timeout));
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return Ok(StreamEnd::Cancelled { after_headers: true }),
                next = events.next() => next,
            };
            match next {
                None => {
                    return Err(ClientError::StreamTerminated(
                        "stream ended without a result".into(),
                    ))
                }
                Some(Err(err)) => return Err(err),
                Some(Ok(StreamEvent::ContentDelta(delta))) => {
                    self.inner.state.write().streaming_buffer.push_str(&delta);
                    self.emit(SessionEvent::Delta(delta));
                }
                Some(Ok(StreamEvent::Completed)) => return Ok(StreamEnd::Completed),
                Some(Ok(StreamEvent::Error(message))) => return Err(ClientError::Stream(message)),
            }
        }
    }

    fn finish_completed(&self, provisional_id: MessageId) -> SendOutcome {
        let reply_id = MessageId::Local(self.next_local_id());
        let (reply, conversation_id) = {
            let mut state = self.inner.state.write();
            Self::confirm_provisional(&mut state, provisional_id);
            let content = std::mem::take(&mut state.streaming_buffer);
            let reply = Message::new(reply_id, MessageRole::Assistant, content);
            state.transcript.push(reply.clone());
            state.phase = Phase::Idle;
            (reply, state.conversation_id)
        };
        info!(?conversation_id, chars = reply.content.len(), "reply completed");
        self.emit(SessionEvent::Completed(reply.clone()));
        self.invalidate(conversation_id);
        self.emit(SessionEvent::PhaseChanged(Phase::Idle));
        SendOutcome::Completed {
            conversation_id,
            reply,
        }
    }

    fn finish_failed(&self, provisional_id: MessageId, error: ClientError) -> SendOutcome {
        {
            let mut state = self.inner.state.write();
            state.transcript.retain(|message| message.id != provisional_id);
            state.streaming_buffer.clear();
            state.phase = Phase::Errored;
        }
        self.emit(SessionEvent::PhaseChanged(Phase::Errored));
        let message = error.user_message();
        warn!(%error, "chat send failed, rolled back optimistic message");
        self.emit(SessionEvent::Failed(message.clone()));
        self.inner.state.write().phase = Phase::Idle;
        self.emit(SessionEvent::PhaseChanged(Phase::Idle));
        SendOutcome::Failed { error, message }
    }

    /// Before headers the entry is dropped. After headers the server holds the user
    /// message: the entry is kept and the caches are invalidated.
    fn finish_cancelled(&self, provisional_id: MessageId, after_headers: bool) -> SendOutcome {
        let conversation_id = {
            let mut state = self.inner.state.write();
            if after_headers {
                Self::confirm_provisional(&mut state, provisional_id);
            } else {
                state.transcript.retain(|message| message.id != provisional_id);
            }
            state.streaming_buffer.clear();
            state.phase = Phase::Idle;
            state.conversation_id
        };
        info!(after_headers, "chat send cancelled");
        self.emit(SessionEvent::Cancelled);
        if after_headers {
            self.invalidate(conversation_id);
        }
        self.emit(SessionEvent::PhaseChanged(Phase::Idle));
        SendOutcome::Cancelled
    }

    fn confirm_provisional(state: &mut ChatSessionState, provisional_id: MessageId) {
        if let MessageId::Provisional(n) = provisional_id {
            for message in state
                .transcript
                .iter_mut()
                .filter(|message| message.id == provisional_id)
            {
                message.id = MessageId::Local(n);
            }
        }
    }

    fn invalidate(&self, conversation_id: Option<i64>) {
        self.emit(SessionEvent::Invalidate(CacheScope::ConversationList));
        if let Some(id) = conversation_id {
            self.emit(SessionEvent::Invalidate(CacheScope::Conversation(id)));
        }
    }

    fn next_local_id(&self) -> u64 {
        self.inner.next_local_id.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, event: SessionEvent) {
        self.inner.events_tx.send(event).ok();
    }
}
