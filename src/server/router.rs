//! Topic routing and message fan-out

use crate::server::protocol::ServerEvent;
use crate::server::registry::{Connection, ConnectionId, ConnectionRegistry, OutboundMessage};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Addressing mode of a publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every admitted connection
    All,
    /// Current members of one topic
    Topic(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => f.write_str("*"),
            Scope::Topic(name) => f.write_str(name),
        }
    }
}

/// Routes events to connections
///
/// Delivery only enqueues on each recipient's outbound queue, so a slow or
/// dead recipient never blocks the others. Each event is serialized once and
/// queued in publish order, which keeps delivery FIFO per source.
#[derive(Clone)]
pub struct TopicRouter {
    registry: Arc<ConnectionRegistry>,
}

impl TopicRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Publish an event; returns the number of connections it was queued for
    pub fn publish(&self, scope: &Scope, event: &ServerEvent) -> usize {
        let recipients = match scope {
            Scope::All => self.registry.all(),
            Scope::Topic(name) => self.registry.members(name),
        };

        if recipients.is_empty() {
            debug!(scope = %scope, event = event.name(), "No recipients");
            return 0;
        }

        let msg = match OutboundMessage::encode(event) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(event = event.name(), error = %e, "Failed to encode event");
                return 0;
            }
        };

        debug!(
            scope = %scope,
            event = msg.event,
            recipient_count = recipients.len(),
            "Routing event"
        );

        recipients
            .iter()
            .filter(|recipient| deliver(recipient, msg.clone()))
            .count()
    }

    /// Send an event to a single connection
    pub fn send_to(&self, id: ConnectionId, event: &ServerEvent) -> bool {
        let Some(conn) = self.registry.get(id) else {
            debug!(connection_id = %id, event = event.name(), "No such connection");
            return false;
        };

        match OutboundMessage::encode(event) {
            Ok(msg) => deliver(&conn, msg),
            Err(e) => {
                warn!(event = event.name(), error = %e, "Failed to encode event");
                false
            }
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get the number of active connections
    pub fn connection_count(&self) -> usize {
        self.registry.count()
    }
}

fn deliver(conn: &Connection, msg: OutboundMessage) -> bool {
    let event = msg.event;
    match conn.send(msg) {
        Ok(()) => true,
        Err(e) => {
            // Expected during rapid disconnect or with a stalled client
            debug!(
                connection_id = %conn.id,
                event,
                error = %e,
                "Failed to queue event (buffer full or disconnected)"
            );
            false
        }
    }
}
