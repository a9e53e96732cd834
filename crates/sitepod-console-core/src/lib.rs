//! Client core for the SitePod console: session state, token persistence, and
//! the request gateway every feature call goes through.

pub mod auth;
pub mod config;
pub mod gateway;
pub mod session;
pub mod storage;
pub mod transport;

use std::sync::Arc;

pub use auth::{AuthInputError, AuthenticationError, User};
pub use config::{ConfigError, ConsoleClientConfig};
pub use gateway::{RequestError, RequestErrorKind, RequestGateway, RequestOptions};
pub use session::{SessionManager, SessionPhase, SessionReader, SessionSnapshot};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError};
pub use transport::{HttpMethod, HttpTransport, ReqwestTransport};

/// A restored session plus a gateway bound to it, sharing one transport.
#[derive(Debug, Clone)]
pub struct ConsoleClient {
    pub session: SessionManager,
    pub gateway: RequestGateway,
}

impl ConsoleClient {
    /// Restores the persisted session (spawning validation when a token is
    /// stored) and wires the gateway to read from it.
    pub fn restore(
        config: ConsoleClientConfig,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let gateway_config = config.clone();
        let session = SessionManager::restore(config, store, Arc::clone(&transport));
        let gateway = RequestGateway::new(&gateway_config, session.reader(), transport);
        Self { session, gateway }
    }

    /// Production wiring: reqwest transport with the configured timeout.
    pub fn with_reqwest(config: ConsoleClientConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let transport = Arc::new(ReqwestTransport::new(config.request_timeout()));
        Self::restore(config, store, transport)
    }
}
