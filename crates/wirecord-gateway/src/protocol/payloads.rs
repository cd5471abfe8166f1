//! Gateway payload definitions
//!
//! Command payloads the client sends and the handshake payloads it reads.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use wirecord_core::{Intents, Snowflake};

/// Payload for op 10 (Hello)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval: u64,
}

impl HelloPayload {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }
}

/// Payload for op 2 (Identify)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifyPayload {
    pub token: String,
    pub intents: Intents,
    pub properties: IdentifyProperties,
    /// `[shard_id, shard_count]`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,
}

impl IdentifyPayload {
    #[must_use]
    pub fn new(token: impl Into<String>, intents: Intents) -> Self {
        Self {
            token: token.into(),
            intents,
            properties: IdentifyProperties::default(),
            shard: None,
        }
    }

    /// Set the shard pair
    #[must_use]
    pub fn with_shard(mut self, shard: [u32; 2]) -> Self {
        self.shard = Some(shard);
        self
    }
}

/// Client connection properties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Payload for op 6 (Resume)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePayload {
    pub token: String,
    pub session_id: String,
    /// Last received sequence number
    pub seq: u64,
}

/// READY dispatch, trimmed to the fields the session keeps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyPayload {
    pub session_id: String,
    pub resume_gateway_url: String,
    pub user: Value,
    #[serde(default)]
    pub guilds: Vec<Value>,
}

impl ReadyPayload {
    pub fn user_id(&self) -> Option<Snowflake> {
        Snowflake::from_json(self.user.get("id"))
    }
}

/// Payload for op 3 (Presence Update)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdatePayload {
    /// Unix time in milliseconds since the client went idle
    pub since: Option<u64>,
    pub activities: Vec<Activity>,
    /// online, idle, dnd, invisible or offline
    pub status: String,
    pub afk: bool,
}

impl PresenceUpdatePayload {
    /// Valid status values
    pub const VALID_STATUSES: &'static [&'static str] = &["online", "idle", "dnd", "invisible", "offline"];

    #[must_use]
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            since: None,
            activities: Vec::new(),
            status: status.into(),
            afk: false,
        }
    }

    #[must_use]
    pub fn with_activity(mut self, activity: Activity) -> Self {
        self.activities.push(activity);
        self
    }

    #[must_use]
    pub fn is_valid_status(&self) -> bool {
        Self::VALID_STATUSES.contains(&self.status.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub name: String,
    /// 0 playing, 2 listening, 3 watching, 5 competing
    #[serde(rename = "type")]
    pub kind: u8,
}

impl Activity {
    pub fn playing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: 0,
        }
    }

    pub fn listening(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: 2,
        }
    }
}

/// Payload for op 4 (Voice State Update)
///
/// A null `channel_id` leaves voice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateUpdatePayload {
    pub guild_id: Snowflake,
    pub channel_id: Option<Snowflake>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

impl VoiceStateUpdatePayload {
    pub fn join(guild_id: Snowflake, channel_id: Snowflake) -> Self {
        Self {
            guild_id,
            channel_id: Some(channel_id),
            self_mute: false,
            self_deaf: false,
        }
    }

    pub fn leave(guild_id: Snowflake) -> Self {
        Self {
            guild_id,
            channel_id: None,
            self_mute: false,
            self_deaf: false,
        }
    }

    #[must_use]
    pub fn with_mute(mut self, self_mute: bool, self_deaf: bool) -> Self {
        self.self_mute = self_mute;
        self.self_deaf = self_deaf;
        self
    }
}

/// VOICE_SERVER_UPDATE dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceServerUpdate {
    pub guild_id: Snowflake,
    pub token: String,
    /// Null while the voice server is being reallocated
    pub endpoint: Option<String>,
}

/// Payload for op 8 (Request Guild Members)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestGuildMembersPayload {
    pub guild_id: Snowflake,
    /// Username prefix; empty with `limit = 0` requests everyone
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presences: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<Snowflake>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl RequestGuildMembersPayload {
    /// Request every member of a guild
    pub fn all(guild_id: Snowflake) -> Self {
        Self {
            guild_id,
            query: Some(String::new()),
            limit: 0,
            presences: None,
            user_ids: None,
            nonce: None,
        }
    }

    /// Request specific members by id
    pub fn by_ids(guild_id: Snowflake, user_ids: Vec<Snowflake>) -> Self {
        Self {
            guild_id,
            query: None,
            limit: 0,
            presences: None,
            user_ids: Some(user_ids),
            nonce: None,
        }
    }

    #[must_use]
    pub fn with_presences(mut self, presences: bool) -> Self {
        self.presences = Some(presences);
        self
    }

    #[must_use]
    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }
}
