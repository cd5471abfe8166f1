//! Gateway payload builders
//!
//! Ids are strings, as on the wire.

use serde_json::{json, Value};

/// User id the scripted gateway assigns to the client
pub const BOT_USER_ID: &str = "900";

/// Guild used by most scenarios
pub const GUILD_ID: &str = "1";

/// Voice channel used by the join scenarios
pub const VOICE_CHANNEL_ID: &str = "20";

pub fn hello(heartbeat_interval_ms: u64) -> Value {
    json!({"op": 10, "d": {"heartbeat_interval": heartbeat_interval_ms}})
}

pub fn heartbeat_request() -> Value {
    json!({"op": 1, "d": null})
}

pub fn heartbeat_ack() -> Value {
    json!({"op": 11, "d": null})
}

pub fn reconnect_request() -> Value {
    json!({"op": 7, "d": null})
}

pub fn invalid_session(resumable: bool) -> Value {
    json!({"op": 9, "d": resumable})
}

pub fn dispatch(event: &str, seq: u64, data: Value) -> Value {
    json!({"op": 0, "t": event, "s": seq, "d": data})
}

pub fn ready(seq: u64, session_id: &str, resume_url: &str) -> Value {
    dispatch(
        "READY",
        seq,
        json!({
            "v": 10,
            "session_id": session_id,
            "resume_gateway_url": resume_url,
            "user": {"id": BOT_USER_ID, "username": "wirecord", "bot": true},
            "guilds": [{"id": GUILD_ID, "unavailable": true}]
        }),
    )
}

pub fn resumed(seq: u64) -> Value {
    dispatch("RESUMED", seq, Value::Null)
}

pub fn guild_create(seq: u64) -> Value {
    dispatch(
        "GUILD_CREATE",
        seq,
        json!({
            "id": GUILD_ID,
            "name": "Test Guild",
            "channels": [
                {"id": "10", "guild_id": GUILD_ID, "name": "general", "type": 0},
                {"id": VOICE_CHANNEL_ID, "guild_id": GUILD_ID, "name": "voice", "type": 2}
            ],
            "roles": [{"id": GUILD_ID, "name": "@everyone"}],
            "members": [{"user": {"id": BOT_USER_ID}, "roles": []}]
        }),
    )
}

pub fn message_create(seq: u64, id: &str, content: &str) -> Value {
    dispatch(
        "MESSAGE_CREATE",
        seq,
        json!({
            "id": id,
            "guild_id": GUILD_ID,
            "channel_id": "10",
            "content": content,
            "author": {"id": "300"}
        }),
    )
}

pub fn interaction_create(seq: u64, id: &str, token: &str, command: &str) -> Value {
    dispatch(
        "INTERACTION_CREATE",
        seq,
        json!({
            "id": id,
            "token": token,
            "type": 2,
            "guild_id": GUILD_ID,
            "channel_id": "10",
            "data": {"name": command}
        }),
    )
}

pub fn own_voice_state(seq: u64, channel_id: Option<&str>, session_id: &str) -> Value {
    dispatch(
        "VOICE_STATE_UPDATE",
        seq,
        json!({
            "guild_id": GUILD_ID,
            "user_id": BOT_USER_ID,
            "channel_id": channel_id,
            "session_id": session_id
        }),
    )
}

pub fn voice_server(seq: u64, token: &str, endpoint: Option<&str>) -> Value {
    dispatch(
        "VOICE_SERVER_UPDATE",
        seq,
        json!({"guild_id": GUILD_ID, "token": token, "endpoint": endpoint}),
    )
}
