//! Client-side sync core for a realtime chat: optimistic sends reconciled
//! with server acks, a reconnecting push connection with an outbound queue,
//! REST pagination and a persisted cache of confirmed messages.

pub mod api;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod focus;
pub mod merge;
pub mod registry;
pub mod session;
pub mod store;
pub mod transport;

pub use api::{
    ChatApi, CredentialProvider, FileUpload, HttpChatApi, StaticCredentials, Uploader,
    DEFAULT_PAGE_SIZE, DEFAULT_REQUEST_TIMEOUT,
};
pub use config::{load_settings, load_settings_from, ClientSettings};
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionOptions, ConnectionState, EventFilter,
    Subscription, DEFAULT_RECONNECT_DELAY,
};
pub use error::{RestError, SendError, TransportError};
pub use merge::merge;
pub use registry::{ConversationRegistry, ConversationTarget};
pub use session::{ChatSession, CredentialRelay, SessionDependencies};
pub use store::{ConversationStore, StoreContext, TimelineState};
pub use transport::{Connector, Transport, TransportEvent, WebSocketConnector};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
