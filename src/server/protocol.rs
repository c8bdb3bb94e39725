//! Wire protocol
//!
//! Every frame is a JSON envelope `{"event": <name>, "data": <payload>}`.
//! Inbound payloads are decoded leniently: a missing or mistyped field becomes
//! `None` and the handler decides what to skip.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Reason sent to clients whose handshake was refused
pub const AUTH_FAILED_MESSAGE: &str = "Authentication error";

pub mod events {
    pub const AUTH: &str = "auth";
    pub const PRESENCE: &str = "presence";
    pub const DRIVER_LOCATION: &str = "driver:location";
    pub const TRACK_VEHICLE: &str = "track:vehicle";

    pub const AUTH_OK: &str = "auth:ok";
    pub const AUTH_ERROR: &str = "auth:error";
    pub const PRESENCE_UPDATE: &str = "presence:update";
    pub const VEHICLE_LOCATION: &str = "vehicle:location";
    pub const VEHICLE_LOCATION_ALL: &str = "vehicle:location:all";
    pub const TRACK_ACK: &str = "track:ack";
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),

    #[error("unknown event: {0}")]
    UnknownEvent(String),
}

/// Role declared in a presence event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Rider,
    Driver,
}

impl Role {
    /// Parse a role name; unknown names are treated as unset
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rider" => Some(Role::Rider),
            "driver" => Some(Role::Driver),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Events from client to server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Handshake carrying the credential token
    Auth { token: Option<String> },
    /// Declare role and (for drivers) the vehicle being driven
    Presence {
        role: Option<Role>,
        vehicle_id: Option<String>,
    },
    /// Driver position update
    DriverLocation {
        vehicle_id: Option<String>,
        lat: Option<f64>,
        lng: Option<f64>,
    },
    /// Subscribe to a vehicle's location stream
    TrackVehicle { vehicle_id: Option<String> },
}

impl ClientEvent {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Self::from_envelope(serde_json::from_str(text)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::from_envelope(serde_json::from_slice(bytes)?)
    }

    fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let data = &envelope.data;

        let event = match envelope.event.as_str() {
            events::AUTH => ClientEvent::Auth {
                token: data.get("token").and_then(Value::as_str).map(str::to_string),
            },
            events::PRESENCE => ClientEvent::Presence {
                role: data.get("role").and_then(Value::as_str).and_then(Role::parse),
                vehicle_id: vehicle_id(data.get("vehicleId")),
            },
            events::DRIVER_LOCATION => ClientEvent::DriverLocation {
                vehicle_id: vehicle_id(data.get("vehicleId")),
                lat: data.get("lat").and_then(Value::as_f64),
                lng: data.get("lng").and_then(Value::as_f64),
            },
            events::TRACK_VEHICLE => ClientEvent::TrackVehicle {
                // Bare id, or an object with a vehicleId field
                vehicle_id: match data {
                    Value::Object(fields) => vehicle_id(fields.get("vehicleId")),
                    other => vehicle_id(Some(other)),
                },
            },
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        };

        Ok(event)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Auth { .. } => events::AUTH,
            ClientEvent::Presence { .. } => events::PRESENCE,
            ClientEvent::DriverLocation { .. } => events::DRIVER_LOCATION,
            ClientEvent::TrackVehicle { .. } => events::TRACK_VEHICLE,
        }
    }
}

/// A vehicle id is present if it is a non-empty string or a non-zero number
fn vehicle_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        _ => None,
    }
}

/// Presence broadcast payload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub disconnected: bool,
}

/// Location payload shared by the vehicle-scoped and broadcast streams
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationFix {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    /// Unix epoch milliseconds
    pub ts: u64,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Events from server to client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "auth:ok")]
    AuthOk {
        uid: String,
        #[serde(rename = "connectionId")]
        connection_id: Uuid,
    },
    #[serde(rename = "auth:error")]
    AuthError { message: String },
    #[serde(rename = "presence:update")]
    PresenceUpdate(PresenceRecord),
    #[serde(rename = "vehicle:location")]
    VehicleLocation(LocationFix),
    #[serde(rename = "vehicle:location:all")]
    VehicleLocationAll(LocationFix),
    #[serde(rename = "track:ack")]
    TrackAck {
        #[serde(rename = "vehicleId")]
        vehicle_id: String,
    },
}

impl ServerEvent {
    pub fn auth_failed() -> Self {
        ServerEvent::AuthError {
            message: AUTH_FAILED_MESSAGE.to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::AuthOk { .. } => events::AUTH_OK,
            ServerEvent::AuthError { .. } => events::AUTH_ERROR,
            ServerEvent::PresenceUpdate(_) => events::PRESENCE_UPDATE,
            ServerEvent::VehicleLocation(_) => events::VEHICLE_LOCATION,
            ServerEvent::VehicleLocationAll(_) => events::VEHICLE_LOCATION_ALL,
            ServerEvent::TrackAck { .. } => events::TRACK_ACK,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
