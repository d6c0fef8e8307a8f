use crate::config::ClientSettings;
use crate::error::{error_detail, ClientError};
use crate::exchange::{ApiRequest, ApiResponse, HttpExchange};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

pub const REFRESH_PATH: &str = "/api/auth/refresh";

/// Routes under this prefix are auth pages; redirecting from them would loop.
const AUTH_ROUTE_PREFIX: &str = "/auth";

/// Instructions for the UI layer emitted by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    /// The session could not be refreshed; send the user to the login entry point.
    Login { to: String, redirect: String },
}

/// Result of one refresh cycle, shared by every caller that waited on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    Failed(String),
}

type RefreshFuture = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Sends requests and repairs expired sessions.
///
/// Concurrent callers that hit a 401 share a single refresh request: the first one
/// starts the refresh on a background task, the rest await it, and the task clears
/// itself from the lock when it settles.
#[derive(Clone)]
pub struct AuthTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    exchange: Arc<dyn HttpExchange>,
    refresh_lock: Mutex<Option<RefreshFuture>>,
    location: RwLock<String>,
    login_path: String,
    refresh_timeout: Duration,
    navigation_tx: UnboundedSender<Navigation>,
}

impl AuthTransport {
    pub fn new(
        exchange: Arc<dyn HttpExchange>,
        settings: &ClientSettings,
    ) -> (Self, UnboundedReceiver<Navigation>) {
        let (navigation_tx, navigation_rx) = unbounded_channel();
        let inner = TransportInner {
            exchange,
            refresh_lock: Mutex::new(None),
            location: RwLock::new("/".to_string()),
            login_path: settings.login_path.clone(),
            refresh_timeout: settings.refresh_timeout,
            navigation_tx,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            navigation_rx,
        )
    }

    /// Record the route the user is currently looking at.
    pub fn set_location(&self, path: impl Into<String>) {
        *self.inner.location.write() = path.into();
    }

    pub fn location(&self) -> String {
        self.inner.location.read().clone()
    }

    /// Whether a refresh cycle is currently pending.
    pub fn refresh_in_flight(&self) -> bool {
        self.inner.refresh_lock.lock().is_some()
    }

    /// Send a request without any refresh handling.
    pub async fn request_unguarded(&self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        debug!(method = %request.method, path = %request.path, "sending request");
        let response = self.inner.exchange.execute(request).await?;
        debug!(status = %response.status, "received response");
        Ok(response)
    }

    /// Send a request; on a 401 refresh the session once and retry once.
    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        let response = self.request_unguarded(request.clone()).await?;
        if response.status != StatusCode::UNAUTHORIZED || request.path == REFRESH_PATH {
            return Ok(response);
        }

        match self.shared_refresh().await {
            RefreshOutcome::Refreshed => {
                debug!(path = %request.path, "retrying after refresh");
                self.request_unguarded(request).await
            }
            RefreshOutcome::Failed(reason) => Err(ClientError::Authentication { reason }),
        }
    }

    /// Await the pending refresh, creating it if none is in flight.
    fn shared_refresh(&self) -> RefreshFuture {
        let mut slot = self.inner.refresh_lock.lock();
        if let Some(pending) = slot.as_ref() {
            return pending.clone();
        }
        let inner = self.inner.clone();
        // Runs on its own task so the cycle settles even if every waiter is dropped.
        let cycle = tokio::spawn(async move {
            let outcome = inner.run_refresh().await;
            // Clear before waiters resume so the next 401 starts a fresh cycle.
            inner.refresh_lock.lock().take();
            if let RefreshOutcome::Failed(reason) = &outcome {
                inner.redirect_to_login(reason);
            }
            outcome
        });
        let pending = async move {
            cycle.await.unwrap_or_else(|err| {
                RefreshOutcome::Failed(format!("session refresh aborted: {err}"))
            })
        }
        .boxed()
        .shared();
        *slot = Some(pending.clone());
        pending
    }
}

impl TransportInner {
    async fn run_refresh(&self) -> RefreshOutcome {
        info!(timeout = ?self.refresh_timeout, "refreshing session");
        let attempt = self.exchange.execute(ApiRequest::post(REFRESH_PATH));
        let outcome = match tokio::time::timeout(self.refresh_timeout, attempt).await {
            Err(_) => RefreshOutcome::Failed(format!(
                "session refresh timed out after {:?}",
                self.refresh_timeout
            )),
            Ok(Err(err)) => RefreshOutcome::Failed(err.to_string()),
            Ok(Ok(response)) if response.is_success() => RefreshOutcome::Refreshed,
            Ok(Ok(response)) => {
                let status = response.status;
                let body = response.bytes().await.unwrap_or_default();
                let detail = error_detail(&body).unwrap_or_else(|| "Token refresh failed".into());
                RefreshOutcome::Failed(format!("{detail} ({status})"))
            }
        };
        match &outcome {
            RefreshOutcome::Refreshed => info!("session refreshed"),
            RefreshOutcome::Failed(reason) => warn!(%reason, "session refresh failed"),
        }
        outcome
    }

    fn redirect_to_login(&self, reason: &str) {
        let location = self.location.read().clone();
        if location.starts_with(AUTH_ROUTE_PREFIX) {
            debug!(%location, "already on an auth page, not redirecting");
            return;
        }
        debug!(%location, %reason, "redirecting to login");
        self.navigation_tx
            .send(Navigation::Login {
                to: self.login_path.clone(),
                redirect: location,
            })
            .ok();
    }
}
