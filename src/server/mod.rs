//! Relay server implementation
//!
//! Handles WebSocket connections, session lifecycle, topic membership and
//! event fan-out.

pub mod protocol;
mod registry;
mod relay;
mod router;
mod session;
pub mod websocket;

pub use protocol::{ClientEvent, LocationFix, PresenceRecord, ProtocolError, Role, ServerEvent};
pub use registry::{
    user_topic, vehicle_topic, Connection, ConnectionId, ConnectionRegistry, OutboundMessage,
    Presence,
};
pub use relay::{
    RelayConfig, RelayServer, RelayState, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_PORT,
    DEFAULT_PUBLIC_DIR, DEFAULT_QUEUE_CAPACITY,
};
pub use router::{Scope, TopicRouter};
pub use session::{Session, SessionState};
pub use websocket::create_router;
