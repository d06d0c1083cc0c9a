//! Wire messages exchanged with the endpoints. Everything is JSON text
//! frames; inbound frames that fail to parse are dropped by the session.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::identity::Identity;

pub const ACTION_AUTH: &str = "AUTH";
pub const ACTION_PONG: &str = "PONG";
pub const ACTION_PING: &str = "PING";

const PING_VERSION: &str = "1.0.0";
const DEVICE_TYPE: &str = "desktop";

/// Inbound frame envelope: `{id, action, data?}`.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Keepalive ping, sent every interval while a session is active.
#[derive(Debug, Serialize)]
pub struct Ping {
    pub id: String,
    pub version: &'static str,
    pub action: &'static str,
    pub data: Value,
}

impl Ping {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            version: PING_VERSION,
            action: ACTION_PING,
            data: json!({}),
        }
    }
}

impl Default for Ping {
    fn default() -> Self {
        Self::new()
    }
}

/// Reply to the server-initiated AUTH challenge; sending it completes the
/// handshake.
#[derive(Debug, Serialize)]
pub struct AuthReply {
    pub id: String,
    pub origin_action: &'static str,
    pub result: AuthResult,
}

#[derive(Debug, Serialize)]
pub struct AuthResult {
    pub browser_id: String,
    pub user_id: String,
    pub user_agent: String,
    pub timestamp: u64,
    pub device_type: &'static str,
    pub version: String,
}

impl AuthReply {
    pub fn new(challenge_id: &str, browser_id: Uuid, identity: &Identity, version: &str) -> Self {
        Self {
            id: challenge_id.to_string(),
            origin_action: ACTION_AUTH,
            result: AuthResult {
                browser_id: browser_id.to_string(),
                user_id: identity.user_id.clone(),
                user_agent: identity.user_agent.clone(),
                timestamp: unix_timestamp(),
                device_type: DEVICE_TYPE,
                version: version.to_string(),
            },
        }
    }
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
