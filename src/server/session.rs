//! Per-connection protocol state machine
//!
//! `Connecting -> Authenticating -> Authenticated -> Terminated`
//!
//! A session is owned by the task serving its transport, so handlers for one
//! connection never run concurrently. Events are only routed once
//! verification has completed successfully, and nothing is processed after
//! termination.

use crate::auth::{AuthError, Identity, IdentityVerifier};
use crate::server::protocol::{ClientEvent, LocationFix, PresenceRecord, Role, ServerEvent};
use crate::server::registry::{
    vehicle_topic, Connection, ConnectionId, ConnectionRegistry, OutboundMessage,
};
use crate::server::router::{Scope, TopicRouter};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Authenticated,
    Terminated,
}

pub struct Session {
    id: ConnectionId,
    state: SessionState,
    identity: Option<Identity>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<TopicRouter>,
    verifier: IdentityVerifier,
}

impl Session {
    /// Start a session for a freshly accepted transport
    pub fn accept(
        registry: Arc<ConnectionRegistry>,
        router: Arc<TopicRouter>,
        verifier: IdentityVerifier,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Connecting,
            identity: None,
            registry,
            router,
            verifier,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Verify the handshake token and, on success, admit the connection
    ///
    /// `auth:ok` is queued on `tx` before admission so it is the first event the
    /// client sees. On failure the session terminates without touching the
    /// registry. Dropping the future while verification is pending leaves the
    /// session unadmitted, and its teardown announces nothing.
    pub async fn authenticate(
        &mut self,
        token: Option<&str>,
        tx: mpsc::Sender<OutboundMessage>,
    ) -> Result<Arc<Connection>, AuthError> {
        if self.state != SessionState::Connecting {
            debug!(conn_id = %self.id, state = ?self.state, "Unexpected handshake");
            return Err(AuthError);
        }

        self.state = SessionState::Authenticating;

        let identity = match self.verifier.verify(token).await {
            Ok(identity) => identity,
            Err(e) => {
                self.state = SessionState::Terminated;
                info!(conn_id = %self.id, "Handshake refused");
                return Err(e);
            }
        };

        let ack = ServerEvent::AuthOk {
            uid: identity.subject_id().to_string(),
            connection_id: self.id,
        };
        match OutboundMessage::encode(&ack) {
            Ok(msg) => {
                if let Err(e) = tx.try_send(msg) {
                    debug!(conn_id = %self.id, error = %e, "Failed to queue auth:ok");
                }
            }
            Err(e) => warn!(conn_id = %self.id, error = %e, "Failed to encode auth:ok"),
        }

        let conn = self.registry.admit(self.id, identity.clone(), tx);
        info!(conn_id = %self.id, uid = %identity, "Client authenticated");

        self.identity = Some(identity);
        self.state = SessionState::Authenticated;

        Ok(conn)
    }

    /// Handle one inbound event
    pub fn handle(&mut self, event: ClientEvent) {
        if self.state != SessionState::Authenticated {
            debug!(conn_id = %self.id, state = ?self.state, event = event.name(), "Dropping event");
            return;
        }

        match event {
            ClientEvent::Auth { .. } => {
                // Already authenticated, ignore
            }
            ClientEvent::Presence { role, vehicle_id } => self.on_presence(role, vehicle_id),
            ClientEvent::DriverLocation {
                vehicle_id,
                lat,
                lng,
            } => self.on_driver_location(vehicle_id, lat, lng),
            ClientEvent::TrackVehicle { vehicle_id } => self.on_track_vehicle(vehicle_id),
        }
    }

    fn uid(&self) -> String {
        self.identity
            .as_ref()
            .map(|identity| identity.subject_id().to_string())
            .unwrap_or_default()
    }

    fn on_presence(&mut self, role: Option<Role>, vehicle_id: Option<String>) {
        if !self.registry.set_presence(self.id, role, vehicle_id.clone()) {
            return;
        }

        let update = ServerEvent::PresenceUpdate(PresenceRecord {
            uid: self.uid(),
            role,
            vehicle_id,
            disconnected: false,
        });
        self.router.publish(&Scope::All, &update);
    }

    fn on_driver_location(&mut self, vehicle_id: Option<String>, lat: Option<f64>, lng: Option<f64>) {
        let fix = LocationFix {
            vehicle_id,
            lat,
            lng,
            ts: now_millis(),
        };

        if let Some(vehicle_id) = fix.vehicle_id.as_deref() {
            let scope = Scope::Topic(vehicle_topic(vehicle_id));
            self.router.publish(&scope, &ServerEvent::VehicleLocation(fix.clone()));
        }
        self.router.publish(&Scope::All, &ServerEvent::VehicleLocationAll(fix));
    }

    fn on_track_vehicle(&mut self, vehicle_id: Option<String>) {
        let Some(vehicle_id) = vehicle_id else {
            return;
        };

        self.registry.join_topic(self.id, &vehicle_topic(&vehicle_id));
        self.router.send_to(self.id, &ServerEvent::TrackAck { vehicle_id });
    }

    /// Tear the session down; idempotent
    ///
    /// An authenticated connection is removed from the registry before the
    /// final presence broadcast, so it never receives its own departure.
    pub fn terminate(&mut self, reason: &str) {
        let previous = std::mem::replace(&mut self.state, SessionState::Terminated);
        if previous != SessionState::Authenticated {
            return;
        }

        let role = self.registry.remove(self.id).and_then(|conn| conn.role());
        info!(conn_id = %self.id, uid = %self.uid(), reason, "Client disconnected");

        let update = ServerEvent::PresenceUpdate(PresenceRecord {
            uid: self.uid(),
            role,
            vehicle_id: None,
            disconnected: true,
        });
        self.router.publish(&Scope::All, &update);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.terminate("session dropped");
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
