//! Convoy - real-time presence and vehicle location relay
//!
//! Riders and drivers connect over WebSocket, authenticate, announce presence,
//! and drivers stream locations that are fanned out to every connection and
//! to the riders tracking that vehicle.

pub mod auth;
pub mod server;

pub use auth::{AuthError, CredentialBackend, Identity, IdentityVerifier, VerifierMode};
pub use server::{ConnectionRegistry, RelayConfig, RelayServer, Scope, TopicRouter};
