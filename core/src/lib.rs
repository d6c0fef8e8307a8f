pub mod api;
pub mod config;
pub mod error;
pub mod exchange;
pub mod frames;
pub mod mock;
pub mod model;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use api::{ApiClient, ChatReply};
pub use config::{ClientSettings, ConfigError};
pub use error::ClientError;
pub use exchange::{ApiRequest, ApiResponse, HttpExchange, ReqwestExchange};
pub use frames::{FrameDecoder, StreamEvent};
pub use mock::{MockExchange, MockReply};
pub use model::{ChatData, Conversation, Credentials, Message, MessageId, MessageRole, User};
pub use session::{CacheScope, ChatSession, ChatSessionState, Phase, SendOutcome, SessionEvent};
pub use transport::{AuthTransport, Navigation, RefreshOutcome};
