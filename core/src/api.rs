use crate::config::ClientSettings;
use crate::error::{error_detail, ClientError};
use crate::exchange::{ApiRequest, ApiResponse, HttpExchange, ReqwestExchange, ResponseBody};
use crate::model::{ChatConfig, ChatData, Conversation, Credentials, User};
use crate::transport::{AuthTransport, Navigation, REFRESH_PATH};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::warn;

pub const CONVERSATION_ID_HEADER: &str = "x-conversation-id";

/// Response to `POST /api/chat/send`: headers have arrived, the body is still open.
pub struct ChatReply {
    /// Id announced by the server in `X-Conversation-Id`.
    pub conversation_id: Option<i64>,
    pub body: ResponseBody,
}

#[derive(Deserialize)]
struct UserEnvelope {
    user: User,
}

#[derive(Serialize)]
struct SendMessageBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<i64>,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
}

#[derive(Serialize)]
struct ConversationBody<'a> {
    conversation_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
}

#[derive(Serialize)]
struct NewConversationBody<'a> {
    title: &'a str,
}

#[derive(Serialize)]
struct ResetRequestBody<'a> {
    email: &'a str,
}

#[derive(Serialize)]
struct ResetConfirmBody<'a> {
    token: &'a str,
    new_password: &'a str,
}

/// Named operations against the backend.
#[derive(Clone)]
pub struct ApiClient {
    transport: AuthTransport,
}

impl ApiClient {
    pub fn new(transport: AuthTransport) -> Self {
        Self { transport }
    }

    /// Client over HTTP with a cookie jar for the session credentials.
    pub fn connect(
        settings: &ClientSettings,
    ) -> Result<(Self, UnboundedReceiver<Navigation>), ClientError> {
        let exchange = ReqwestExchange::new(settings.base_url.clone())?;
        Ok(Self::with_exchange(Arc::new(exchange), settings))
    }

    pub fn with_exchange(
        exchange: Arc<dyn HttpExchange>,
        settings: &ClientSettings,
    ) -> (Self, UnboundedReceiver<Navigation>) {
        let (transport, navigation) = AuthTransport::new(exchange, settings);
        (Self::new(transport), navigation)
    }

    pub fn transport(&self) -> &AuthTransport {
        &self.transport
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<User, ClientError> {
        let request = ApiRequest::post("/api/auth/login/onsubmit").json(credentials)?;
        let response = self.transport.request_unguarded(request).await?;
        let envelope: UserEnvelope = read_json(response, "Login failed").await?;
        Ok(envelope.user)
    }

    pub async fn register(&self, credentials: &Credentials) -> Result<User, ClientError> {
        let request = ApiRequest::post("/api/auth/register/onsubmit").json(credentials)?;
        let response = self.transport.request_unguarded(request).await?;
        let envelope: UserEnvelope = read_json(response, "Registration failed").await?;
        Ok(envelope.user)
    }

    pub async fn logout(&self) -> Result<(), ClientError> {
        let response = self
            .transport
            .request(ApiRequest::post("/api/auth/logout/onsubmit"))
            .await?;
        expect_success(response, "Logout failed").await
    }

    pub async fn refresh(&self) -> Result<(), ClientError> {
        let response = self
            .transport
            .request_unguarded(ApiRequest::post(REFRESH_PATH))
            .await?;
        expect_success(response, "Token refresh failed").await
    }

    pub async fn current_user(&self) -> Result<User, ClientError> {
        let response = self.transport.request(ApiRequest::get("/api/auth/me")).await?;
        read_json(response, "Not authenticated").await
    }

    pub async fn request_password_reset(&self, email: &str) -> Result<(), ClientError> {
        let request =
            ApiRequest::post("/api/auth/reset/onsubmit/request").json(&ResetRequestBody { email })?;
        let response = self.transport.request_unguarded(request).await?;
        expect_success(response, "Reset request failed").await
    }

    pub async fn confirm_password_reset(
        &self,
        token: &str,
        new_password: &str,
    ) -> Result<(), ClientError> {
        let request = ApiRequest::post("/api/auth/reset/onsubmit/confirm")
            .json(&ResetConfirmBody {
                token,
                new_password,
            })?;
        let response = self.transport.request_unguarded(request).await?;
        expect_success(response, "Password reset failed").await
    }

    /// Data for a page's `onload` endpoint, e.g. `dashboard`.
    pub async fn page_data<T: DeserializeOwned>(&self, page: &str) -> Result<T, ClientError> {
        let page = page.trim_matches('/');
        let response = self
            .transport
            .request(ApiRequest::get(format!("/api/{page}/onload")))
            .await?;
        read_json(response, &format!("Failed to load {page} data")).await
    }

    pub async fn chat_data(&self, conversation_id: Option<i64>) -> Result<ChatData, ClientError> {
        let mut request = ApiRequest::get("/api/chat/onload");
        if let Some(id) = conversation_id {
            request = request.query("conversation_id", id);
        }
        let response = self.transport.request(request).await?;
        read_json(response, "Failed to load chat data").await
    }

    pub async fn chat_config(&self) -> Result<ChatConfig, ClientError> {
        let response = self.transport.request(ApiRequest::get("/api/chat/config")).await?;
        read_json(response, "Failed to check config").await
    }

    pub async fn create_conversation(&self, title: &str) -> Result<Conversation, ClientError> {
        let request = ApiRequest::post("/api/chat/new").json(&NewConversationBody { title })?;
        let response = self.transport.request(request).await?;
        read_json(response, "Failed to create conversation").await
    }

    /// Post a message. Returns once headers arrive; the body streams the reply.
    pub async fn send_message(
        &self,
        conversation_id: Option<i64>,
        message: &str,
        title: Option<&str>,
    ) -> Result<ChatReply, ClientError> {
        let request = ApiRequest::post("/api/chat/send").json(&SendMessageBody {
            conversation_id,
            message,
            title,
        })?;
        let response = self.transport.request(request).await?;
        if !response.is_success() {
            let fallback = format!("Failed to send message ({})", response.status.as_u16());
            return Err(request_error(response, &fallback).await);
        }
        let conversation_id = response.header(CONVERSATION_ID_HEADER).and_then(|raw| {
            raw.trim()
                .parse::<i64>()
                .map_err(|err| warn!(%raw, %err, "ignoring malformed conversation id header"))
                .ok()
        });
        Ok(ChatReply {
            conversation_id,
            body: response.body,
        })
    }

    pub async fn update_conversation(
        &self,
        conversation_id: i64,
        title: &str,
    ) -> Result<(), ClientError> {
        let request = ApiRequest::post("/api/chat/update").json(&ConversationBody {
            conversation_id,
            title: Some(title),
        })?;
        let response = self.transport.request(request).await?;
        expect_success(response, "Failed to update conversation").await
    }

    pub async fn delete_conversation(&self, conversation_id: i64) -> Result<(), ClientError> {
        let request = ApiRequest::post("/api/chat/delete").json(&ConversationBody {
            conversation_id,
            title: None,
        })?;
        let response = self.transport.request(request).await?;
        expect_success(response, "Failed to delete conversation").await
    }
}

async fn request_error(response: ApiResponse, fallback: &str) -> ClientError {
    let status = response.status;
    let body = response.bytes().await.unwrap_or_default();
    let detail = error_detail(&body).unwrap_or_else(|| fallback.to_string());
    ClientError::Request { status, detail }
}

async fn read_json<T: DeserializeOwned>(
    response: ApiResponse,
    fallback: &str,
) -> Result<T, ClientError> {
    if !response.is_success() {
        return Err(request_error(response, fallback).await);
    }
    response.json().await
}

async fn expect_success(response: ApiResponse, fallback: &str) -> Result<(), ClientError> {
    if !response.is_success() {
        return Err(request_error(response, fallback).await);
    }
    Ok(())
}
