//! Relay server: owns the shared state and runs the HTTP/WebSocket listener

use crate::auth::IdentityVerifier;
use crate::server::registry::ConnectionRegistry;
use crate::server::router::TopicRouter;
use crate::server::session::Session;
use crate::server::websocket::create_router;

use anyhow::{Context, Result};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

/// Default listen port
pub const DEFAULT_PORT: u16 = 3000;

/// Default per-connection outbound queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default static asset directory
pub const DEFAULT_PUBLIC_DIR: &str = "public";

/// Default deadline for the first (handshake) frame
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Directory served for non-API paths
    pub public_dir: PathBuf,
    /// Outbound queue capacity per connection
    pub queue_capacity: usize,
    /// How long a new socket may wait before sending its handshake
    pub handshake_timeout: Duration,
}

impl RelayConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            public_dir: PathBuf::from(DEFAULT_PUBLIC_DIR),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_public_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.public_dir = dir.into();
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT))
    }
}

/// State shared by every connection handler
#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<TopicRouter>,
    pub verifier: IdentityVerifier,
    pub queue_capacity: usize,
    pub handshake_timeout: Duration,
}

impl RelayState {
    pub fn new(verifier: IdentityVerifier, queue_capacity: usize) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(TopicRouter::new(registry.clone()));

        Self {
            registry,
            router,
            verifier,
            queue_capacity: queue_capacity.max(1),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Start a session for a newly accepted transport
    pub fn accept(&self) -> Session {
        Session::accept(self.registry.clone(), self.router.clone(), self.verifier.clone())
    }
}

/// The relay server
pub struct RelayServer {
    config: RelayConfig,
    state: RelayState,
}

impl RelayServer {
    pub fn new(config: RelayConfig, verifier: IdentityVerifier) -> Self {
        let state = RelayState::new(verifier, config.queue_capacity)
            .with_handshake_timeout(config.handshake_timeout);
        Self { config, state }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn state(&self) -> RelayState {
        self.state.clone()
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.state.registry.count()
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.bind_addr))?;

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(
            addr = %addr,
            trusted = self.state.verifier.is_trusted(),
            public_dir = %self.config.public_dir.display(),
            "Relay listening"
        );

        let app = create_router(self.state, &self.config.public_dir);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .context("Server error")?;

        info!("Relay stopped");
        Ok(())
    }
}
