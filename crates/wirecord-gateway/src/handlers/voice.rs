//! Voice state and voice server dispatches
//!
//! Both feed a pending join when one exists; otherwise they steer the guild's
//! live voice session.

use std::sync::Arc;

use serde_json::Value;
use wirecord_core::Snowflake;

use super::parse;
use crate::error::GatewayError;
use crate::protocol::VoiceServerUpdate;
use crate::session::GatewayInner;
use crate::voice_join::{VoiceServerSignal, VoiceStateSignal};

pub(super) fn on_voice_state_update(inner: &Arc<GatewayInner>, data: &Value) -> Result<(), GatewayError> {
    let Some(guild_id) = Snowflake::from_json(data.get("guild_id")) else {
        return Ok(());
    };
    let cached = inner.cache.set_voice_state(data);

    let own = inner.user_id();
    if own.is_none() || Snowflake::from_json(data.get("user_id")) != own {
        return Ok(cached?);
    }

    match Snowflake::from_json(data.get("channel_id")) {
        Some(channel_id) => {
            let session_id = data
                .get("session_id")
                .and_then(Value::as_str)
                .ok_or_else(|| GatewayError::payload("VOICE_STATE_UPDATE", "missing session_id"))?
                .to_string();
            let signal = VoiceStateSignal { session_id, channel_id };
            if !inner.joins.state_ready(guild_id, signal) {
                if let Some(voice) = inner.voice.get(&guild_id) {
                    voice.set_channel(channel_id);
                }
            }
        }
        None if !inner.joins.is_pending(guild_id) => {
            if let Some((_, voice)) = inner.voice.remove(&guild_id) {
                tracing::info!(guild_id = %guild_id, "Disconnected from voice");
                voice.exit();
            }
        }
        None => {}
    }
    Ok(cached?)
}

pub(super) async fn on_voice_server_update(inner: &Arc<GatewayInner>, data: Value) -> Result<(), GatewayError> {
    let update: VoiceServerUpdate = parse("VOICE_SERVER_UPDATE", data)?;
    let guild_id = update.guild_id;
    let Some(endpoint) = update.endpoint else {
        tracing::debug!(guild_id = %guild_id, "Voice server being reallocated");
        return Ok(());
    };

    let signal = VoiceServerSignal {
        token: update.token,
        endpoint,
    };
    if inner.joins.server_ready(guild_id, signal.clone()) {
        return Ok(());
    }

    let voice = inner.voice.get(&guild_id).map(|voice| voice.value().clone());
    match voice {
        Some(voice) => {
            tracing::info!(guild_id = %guild_id, endpoint = %signal.endpoint, "Voice server moved");
            Ok(voice.move_server(signal.token, signal.endpoint).await?)
        }
        None => {
            tracing::debug!(guild_id = %guild_id, "Voice server update without a session");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{session_with, MockRest};
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const GUILD: Snowflake = Snowflake::new(1);

    fn session() -> crate::GatewaySession {
        let session = session_with(MockRest::new());
        session.cache().upsert_guild(json!({"id": "1"})).unwrap();
        *session.inner.user.write() = Some(json!({"id": "900"}));
        session
    }

    #[tokio::test]
    async fn test_signals_release_pending_join() {
        let session = session();
        let join = session.inner.joins.begin(GUILD);

        let state = json!({"guild_id": "1", "user_id": "900", "channel_id": "20", "session_id": "vs"});
        on_voice_state_update(&session.inner, &state).unwrap();
        assert!(!join.is_connect_ready());

        let server = json!({"guild_id": "1", "token": "tok", "endpoint": "voice.example:443"});
        on_voice_server_update(&session.inner, server).await.unwrap();
        assert!(join.is_connect_ready());

        let (state, server) = join.wait(&CancellationToken::new(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(state.channel_id, Snowflake::new(20));
        assert_eq!(state.session_id, "vs");
        assert_eq!(server.endpoint, "voice.example:443");
    }

    #[tokio::test]
    async fn test_null_endpoint_waits() {
        let session = session();
        let join = session.inner.joins.begin(GUILD);

        let server = json!({"guild_id": "1", "token": "tok", "endpoint": null});
        on_voice_server_update(&session.inner, server).await.unwrap();
        let state = json!({"guild_id": "1", "user_id": "900", "channel_id": "20", "session_id": "vs"});
        on_voice_state_update(&session.inner, &state).unwrap();

        assert!(!join.is_connect_ready());
    }

    #[test]
    fn test_other_users_only_touch_cache() {
        let session = session();
        let join = session.inner.joins.begin(GUILD);

        let state = json!({"guild_id": "1", "user_id": "5", "channel_id": "20", "session_id": "other"});
        on_voice_state_update(&session.inner, &state).unwrap();

        assert!(!join.is_connect_ready());
        let cached = session
            .cache()
            .with_guild(GUILD, |g| g.voice_states.contains_key(&Snowflake::new(5)))
            .unwrap();
        assert!(cached);
    }

    #[tokio::test]
    async fn test_server_update_without_join_or_session_is_ignored() {
        let session = session();

        let server = json!({"guild_id": "1", "token": "tok", "endpoint": "voice.example:443"});
        on_voice_server_update(&session.inner, server).await.unwrap();

        assert!(!session.inner.joins.is_pending(GUILD));
        assert!(session.inner.voice.get(&GUILD).is_none());
    }

    #[test]
    fn test_missing_session_id_is_rejected() {
        let session = session();
        let _join = session.inner.joins.begin(GUILD);

        let state = json!({"guild_id": "1", "user_id": "900", "channel_id": "20"});
        let err = on_voice_state_update(&session.inner, &state).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidPayload { .. }));
    }
}
