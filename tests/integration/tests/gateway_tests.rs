//! Gateway client integration tests
//!
//! Each test scripts a loopback gateway server; no external services needed.
//!
//! Run with: cargo test -p integration-tests --test gateway_tests

use std::sync::Arc;

use anyhow::Result;
use integration_tests::*;
use parking_lot::Mutex;
use serde_json::{json, Value};
use wirecord_core::Snowflake;
use wirecord_gateway::{GatewayError, GatewaySession, SessionPhase};

const GUILD: Snowflake = Snowflake::new(1);

/// Dial `session`, run the handshake, and return the open connection and Identify
async fn connect(session: &GatewaySession, gateway: &MockGateway) -> Result<(ServerConn, Value)> {
    let dial = tokio::spawn({
        let session = session.clone();
        async move { session.dial().await }
    });
    let mut conn = gateway.accept().await?;
    let identify = conn.handshake(1, "session-1", gateway.url()).await?;
    dial.await??;
    Ok((conn, identify))
}

/// Collect every session handed to the reconnect continuation
fn track_replacements(session: &GatewaySession) -> Arc<Mutex<Vec<GatewaySession>>> {
    let replaced = Arc::new(Mutex::new(Vec::new()));
    session.on_reconnect({
        let replaced = Arc::clone(&replaced);
        move |next| replaced.lock().push(next)
    });
    replaced
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_identify_and_ready() -> Result<()> {
    let gateway = MockGateway::bind().await?;
    let (session, _owner) = client(&gateway, RecordingRest::new())?;

    let (_conn, identify) = connect(&session, &gateway).await?;

    assert_eq!(identify["d"]["token"], "test-token");
    assert_eq!(identify["d"]["intents"], 641);
    assert_eq!(identify["d"]["shard"], json!([0, 1]));
    assert!(identify["d"]["properties"]["os"].is_string());

    assert_eq!(session.phase(), SessionPhase::Active);
    assert_eq!(session.identity().map(|i| i.session_id), Some("session-1".to_string()));
    assert_eq!(session.sequence(), Some(1));
    assert_eq!(session.user_id(), Some(Snowflake::new(900)));
    // READY placeholders are not cached
    assert!(session.cache().is_empty());

    session.exit();
    assert!(session.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_terminal_close_during_handshake() -> Result<()> {
    let gateway = MockGateway::bind().await?;
    let (session, _owner) = client(&gateway, RecordingRest::new())?;

    let dial = tokio::spawn({
        let session = session.clone();
        async move { session.dial().await }
    });
    let mut conn = gateway.accept().await?;
    conn.send(hello(45_000)).await?;
    conn.expect_op(2).await?;
    conn.close(4004, "Authentication failed").await?;

    let err = dial.await?.unwrap_err();
    assert!(matches!(err, GatewayError::Terminal(4004)), "{err}");
    assert_eq!(session.terminal_code(), Some(4004));
    assert!(session.is_closed());
    assert_eq!(session.phase(), SessionPhase::Disconnected);
    Ok(())
}

#[tokio::test]
async fn test_terminal_close_after_ready() -> Result<()> {
    let gateway = MockGateway::bind().await?;
    let (session, _owner) = client(&gateway, RecordingRest::new())?;
    let replaced = track_replacements(&session);

    let (mut conn, _) = connect(&session, &gateway).await?;
    conn.close(4014, "Disallowed intent(s)").await?;

    assert!(eventually(|| session.is_closed()).await);
    assert_eq!(session.terminal_code(), Some(4014));
    assert!(replaced.lock().is_empty());
    Ok(())
}

// ============================================================================
// Heartbeat
// ============================================================================

#[tokio::test]
async fn test_heartbeat_request_is_answered_with_sequence() -> Result<()> {
    let gateway = MockGateway::bind().await?;
    let (session, _owner) = client(&gateway, RecordingRest::new())?;
    let (mut conn, _) = connect(&session, &gateway).await?;

    conn.send(guild_create(2)).await?;
    conn.send(heartbeat_request()).await?;

    let beat = conn.recv_any().await?;
    assert_eq!(beat["op"], 1);
    assert_eq!(beat["d"], 2);

    session.exit();
    Ok(())
}

#[tokio::test]
async fn test_heartbeat_ack_records_latency() -> Result<()> {
    let gateway = MockGateway::bind().await?;
    let (session, _owner) = client(&gateway, RecordingRest::new())?;

    let dial = tokio::spawn({
        let session = session.clone();
        async move { session.dial().await }
    });
    let mut conn = gateway.accept().await?;
    conn.send(hello(100)).await?;
    conn.expect_op(2).await?;
    conn.send(ready(1, "session-1", gateway.url())).await?;
    dial.await??;

    let beat = conn.recv_any().await?;
    assert_eq!(beat["op"], 1);
    conn.send(heartbeat_ack()).await?;

    assert!(eventually(|| session.latency().is_some()).await);
    session.exit();
    Ok(())
}

#[tokio::test]
async fn test_missed_ack_resumes() -> Result<()> {
    let gateway = MockGateway::bind().await?;
    let (session, _owner) = client(&gateway, RecordingRest::new())?;

    let dial = tokio::spawn({
        let session = session.clone();
        async move { session.dial().await }
    });
    let mut conn = gateway.accept().await?;
    conn.send(hello(100)).await?;
    conn.expect_op(2).await?;
    conn.send(ready(1, "session-1", gateway.url())).await?;
    dial.await??;

    // Never acknowledge; the next tick finds the connection zombied
    let beat = conn.recv_any().await?;
    assert_eq!(beat["op"], 1);

    let mut second = gateway.accept().await?;
    second.send(hello(45_000)).await?;
    let resume = second.expect_op(6).await?;
    assert_eq!(resume["d"]["session_id"], "session-1");
    assert_eq!(resume["d"]["seq"], 1);
    second.send(resumed(2)).await?;

    assert!(eventually(|| session.phase() == SessionPhase::Active && session.sequence() == Some(2)).await);
    session.exit();
    Ok(())
}

// ============================================================================
// Resume and reconnect
// ============================================================================

#[tokio::test]
async fn test_resumable_close_resumes_same_session() -> Result<()> {
    let gateway = MockGateway::bind().await?;
    let (session, _owner) = client(&gateway, RecordingRest::new())?;
    let replaced = track_replacements(&session);
    let (mut conn, _) = connect(&session, &gateway).await?;

    conn.send(guild_create(2)).await?;
    assert!(eventually(|| session.cache().get_guild(GUILD).is_some()).await);
    conn.close(4000, "Unknown error").await?;

    let mut second = gateway.accept().await?;
    second.send(hello(45_000)).await?;
    let resume = second.expect_op(6).await?;
    assert_eq!(resume["d"]["token"], "test-token");
    assert_eq!(resume["d"]["session_id"], "session-1");
    assert_eq!(resume["d"]["seq"], 2);
    second.send(resumed(3)).await?;

    assert!(eventually(|| session.phase() == SessionPhase::Active).await);
    assert_eq!(session.sequence(), Some(3));
    assert!(session.cache().get_guild(GUILD).is_some());
    assert!(replaced.lock().is_empty());
    assert!(!session.is_closed());

    session.exit();
    Ok(())
}

#[tokio::test]
async fn test_reconnect_request_resumes() -> Result<()> {
    let gateway = MockGateway::bind().await?;
    let (session, _owner) = client(&gateway, RecordingRest::new())?;
    let (mut conn, _) = connect(&session, &gateway).await?;

    conn.send(reconnect_request()).await?;

    let mut second = gateway.accept().await?;
    second.send(hello(45_000)).await?;
    second.expect_op(6).await?;
    second.send(resumed(2)).await?;

    assert!(eventually(|| session.phase() == SessionPhase::Active && session.sequence() == Some(2)).await);
    session.exit();
    Ok(())
}

#[tokio::test]
async fn test_unconfirmed_resume_falls_back_to_reconnect() -> Result<()> {
    let gateway = MockGateway::bind().await?;
    let (session, _owner) = client(&gateway, RecordingRest::new())?;
    let replaced = track_replacements(&session);
    let (mut conn, _) = connect(&session, &gateway).await?;

    conn.send(guild_create(2)).await?;
    assert!(eventually(|| session.cache().get_guild(GUILD).is_some()).await);
    conn.close(4000, "Unknown error").await?;

    // Resume attempt that is never confirmed
    let mut second = gateway.accept().await?;
    second.send(hello(45_000)).await?;
    second.expect_op(6).await?;

    // After the resume timeout a fresh session identifies
    let mut third = gateway.accept().await?;
    let identify = third.handshake(1, "session-2", gateway.url()).await?;
    assert_eq!(identify["op"], 2);

    assert!(eventually(|| replaced.lock().len() == 1).await);
    let next = replaced.lock()[0].clone();
    assert_eq!(next.identity().map(|i| i.session_id), Some("session-2".to_string()));
    assert_eq!(next.phase(), SessionPhase::Active);
    // Cached guilds move to the replacement
    assert!(next.cache().get_guild(GUILD).is_some());

    assert!(eventually(|| session.is_closed()).await);
    assert!(session.terminal_code().is_none());

    next.exit();
    Ok(())
}

#[tokio::test]
async fn test_non_resumable_invalid_session_reconnects() -> Result<()> {
    let gateway = MockGateway::bind().await?;
    let (session, _owner) = client(&gateway, RecordingRest::new())?;
    let replaced = track_replacements(&session);
    let (mut conn, _) = connect(&session, &gateway).await?;

    conn.send(invalid_session(false)).await?;

    let mut second = gateway.accept().await?;
    let identify = second.handshake(1, "session-2", gateway.url()).await?;
    assert_eq!(identify["op"], 2);

    assert!(eventually(|| replaced.lock().len() == 1).await);
    assert!(eventually(|| session.is_closed()).await);

    let next = replaced.lock()[0].clone();
    next.exit();
    Ok(())
}

#[tokio::test]
async fn test_resume_without_session_fails_fast() -> Result<()> {
    let gateway = MockGateway::bind().await?;
    let (session, _owner) = client(&gateway, RecordingRest::new())?;

    let err = session.resume().await.unwrap_err();
    assert!(matches!(err, GatewayError::NotResumable));
    Ok(())
}

// ============================================================================
// Dispatch, listeners and commands
// ============================================================================

#[tokio::test]
async fn test_dispatches_mutate_cache_and_notify_listeners() -> Result<()> {
    let gateway = MockGateway::bind().await?;
    let (session, _owner) = client(&gateway, RecordingRest::new())?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    session.on_event("MESSAGE_CREATE", {
        let seen = Arc::clone(&seen);
        move |data| seen.lock().push(data["content"].clone())
    });

    let (mut conn, _) = connect(&session, &gateway).await?;
    conn.send(guild_create(2)).await?;
    assert!(eventually(|| session.cache().get_guild(GUILD).is_some()).await);

    conn.send(message_create(3, "50", "hi there")).await?;
    conn.send(dispatch(
        "CHANNEL_DELETE",
        4,
        json!({"id": "10", "guild_id": "1"}),
    ))
    .await?;
    conn.send(dispatch(
        "GUILD_ROLE_CREATE",
        5,
        json!({"guild_id": "1", "role": {"id": "7", "name": "mods"}}),
    ))
    .await?;

    assert!(eventually(|| seen.lock().len() == 1).await);
    assert_eq!(seen.lock()[0], "hi there");
    assert!(
        eventually(|| {
            session
                .cache()
                .with_guild(GUILD, |g| {
                    g.roles.contains_key(&Snowflake::new(7)) && !g.channels.contains_key(&Snowflake::new(10))
                })
                .unwrap_or(false)
        })
        .await
    );
    assert_eq!(session.sequence(), Some(5));

    // Unknown events are dropped without disturbing the session
    conn.send(dispatch("SOMETHING_NEW", 6, json!({}))).await?;
    assert!(eventually(|| session.sequence() == Some(6)).await);
    assert_eq!(session.phase(), SessionPhase::Active);

    session.exit();
    Ok(())
}

#[tokio::test]
async fn test_reaction_on_uncached_message_is_refetched() -> Result<()> {
    let gateway = MockGateway::bind().await?;
    let rest = RecordingRest::new().with_message(json!({
        "id": "60",
        "channel_id": "10",
        "content": "old",
        "reactions": [{"emoji": {"name": "wave"}, "count": 1, "me": false}]
    }));
    let (session, _owner) = client(&gateway, rest.clone())?;
    let (mut conn, _) = connect(&session, &gateway).await?;

    conn.send(guild_create(2)).await?;
    assert!(eventually(|| session.cache().get_guild(GUILD).is_some()).await);
    conn.send(dispatch(
        "MESSAGE_REACTION_ADD",
        3,
        json!({
            "guild_id": "1",
            "channel_id": "10",
            "message_id": "60",
            "user_id": "300",
            "emoji": {"name": "wave"}
        }),
    ))
    .await?;

    assert!(
        eventually(|| {
            session
                .cache()
                .with_guild(GUILD, |g| g.messages.contains_key(&Snowflake::new(60)))
                .unwrap_or(false)
        })
        .await
    );
    assert_eq!(rest.calls(), vec!["get_message 10 60".to_string()]);

    session.exit();
    Ok(())
}

#[tokio::test]
async fn test_registered_command_replies() -> Result<()> {
    let gateway = MockGateway::bind().await?;
    let rest = RecordingRest::new();
    let (session, _owner) = client(&gateway, rest.clone())?;

    session.register_command("ping", |session: GatewaySession, interaction| async move {
        session.reply_interaction(&interaction, "pong").await
    });

    let (mut conn, _) = connect(&session, &gateway).await?;
    conn.send(interaction_create(2, "55", "itok", "ping")).await?;
    conn.send(interaction_create(3, "56", "other", "unknown")).await?;

    assert!(eventually(|| !rest.calls().is_empty()).await);
    assert_eq!(rest.calls(), vec![r#"interaction_callback 55 itok "pong""#.to_string()]);

    session.exit();
    Ok(())
}

#[tokio::test]
async fn test_presence_and_member_requests_are_sent() -> Result<()> {
    let gateway = MockGateway::bind().await?;
    let (session, _owner) = client(&gateway, RecordingRest::new())?;
    let (mut conn, _) = connect(&session, &gateway).await?;

    let presence = wirecord_gateway::protocol::PresenceUpdatePayload::new("idle");
    session.update_presence(&presence)?;
    let sent = conn.expect_op(3).await?;
    assert_eq!(sent["d"]["status"], "idle");

    let request = wirecord_gateway::protocol::RequestGuildMembersPayload::all(GUILD);
    session.request_guild_members(&request)?;
    let sent = conn.expect_op(8).await?;
    assert_eq!(sent["d"]["guild_id"], "1");

    session.exit();
    Ok(())
}

// ============================================================================
// Voice
// ============================================================================

#[tokio::test]
async fn test_voice_join_and_leave() -> Result<()> {
    let gateway = MockGateway::bind().await?;
    let voice_server_mock = MockVoice::bind().await?;
    let (session, _owner) = client(&gateway, RecordingRest::new())?;
    let (mut conn, _) = connect(&session, &gateway).await?;
    conn.send(guild_create(2)).await?;
    assert!(eventually(|| session.cache().get_guild(GUILD).is_some()).await);

    let join = tokio::spawn({
        let session = session.clone();
        async move { session.join_voice(GUILD, Snowflake::new(20)).await }
    });

    let request = conn.expect_op(4).await?;
    assert_eq!(request["d"]["guild_id"], "1");
    assert_eq!(request["d"]["channel_id"], VOICE_CHANNEL_ID);

    // Server update first; the join waits for both signals
    conn.send(voice_server(3, "vtok", Some(voice_server_mock.endpoint()))).await?;
    conn.send(own_voice_state(4, Some(VOICE_CHANNEL_ID), "vsess")).await?;

    let (identify, _voice_conn) = voice_server_mock.accept_and_handshake(4321).await?;
    assert_eq!(identify["op"], 0);
    assert_eq!(identify["d"]["server_id"], "1");
    assert_eq!(identify["d"]["user_id"], BOT_USER_ID);
    assert_eq!(identify["d"]["session_id"], "vsess");
    assert_eq!(identify["d"]["token"], "vtok");

    let voice = join.await??;
    assert!(voice.is_ready());
    assert_eq!(voice.ssrc(), 4321);
    assert_eq!(voice.channel_id(), Snowflake::new(20));
    assert!(session.voice(GUILD).is_some());

    session.leave_voice(GUILD)?;
    let leave = conn.expect_op(4).await?;
    assert!(leave["d"]["channel_id"].is_null());
    assert!(session.voice(GUILD).is_none());
    assert!(eventually(|| voice.is_closed()).await);

    session.exit();
    Ok(())
}

#[tokio::test]
async fn test_voice_join_cancelled_by_exit() -> Result<()> {
    let gateway = MockGateway::bind().await?;
    let (session, _owner) = client(&gateway, RecordingRest::new())?;
    let (mut conn, _) = connect(&session, &gateway).await?;

    let join = tokio::spawn({
        let session = session.clone();
        async move { session.join_voice(GUILD, Snowflake::new(20)).await }
    });
    conn.expect_op(4).await?;
    // Only one of the two signals arrives
    conn.send(own_voice_state(2, Some(VOICE_CHANNEL_ID), "vsess")).await?;

    session.exit();
    let err = join.await?.unwrap_err();
    assert!(matches!(err, GatewayError::Cancelled), "{err}");
    Ok(())
}

#[tokio::test]
async fn test_voice_join_cancelled_by_leave() -> Result<()> {
    let gateway = MockGateway::bind().await?;
    let (session, _owner) = client(&gateway, RecordingRest::new())?;
    let (mut conn, _) = connect(&session, &gateway).await?;

    let join = tokio::spawn({
        let session = session.clone();
        async move { session.join_voice(GUILD, Snowflake::new(20)).await }
    });
    conn.expect_op(4).await?;
    conn.send(own_voice_state(2, Some(VOICE_CHANNEL_ID), "vsess")).await?;

    session.leave_voice(GUILD)?;
    let leave = conn.expect_op(4).await?;
    assert!(leave["d"]["channel_id"].is_null());

    // Well inside the ten second join timeout
    let err = tokio::time::timeout(std::time::Duration::from_secs(2), join)
        .await??
        .unwrap_err();
    assert!(matches!(err, GatewayError::Cancelled), "{err}");
    assert!(!session.is_closed());

    session.exit();
    Ok(())
}

#[tokio::test]
async fn test_voice_sessions_survive_reconnect() -> Result<()> {
    let gateway = MockGateway::bind().await?;
    let voice_server_mock = MockVoice::bind().await?;
    let (session, _owner) = client(&gateway, RecordingRest::new())?;
    let replaced = track_replacements(&session);
    let (mut conn, _) = connect(&session, &gateway).await?;
    conn.send(guild_create(2)).await?;
    assert!(eventually(|| session.cache().get_guild(GUILD).is_some()).await);

    let join = tokio::spawn({
        let session = session.clone();
        async move { session.join_voice(GUILD, Snowflake::new(20)).await }
    });
    conn.expect_op(4).await?;
    conn.send(own_voice_state(3, Some(VOICE_CHANNEL_ID), "vsess")).await?;
    conn.send(voice_server(4, "vtok", Some(voice_server_mock.endpoint()))).await?;
    let (_identify, _voice_conn) = voice_server_mock.accept_and_handshake(99).await?;
    let voice = join.await??;

    conn.close(4009, "Session timed out").await?;
    let mut second = gateway.accept().await?;
    second.handshake(1, "session-2", gateway.url()).await?;

    assert!(eventually(|| replaced.lock().len() == 1).await);
    let next = replaced.lock()[0].clone();
    assert!(eventually(|| session.is_closed()).await);

    let moved = next.voice(GUILD);
    assert!(moved.is_some());
    assert!(!voice.is_closed());
    assert!(next.cache().get_guild(GUILD).is_some());

    next.exit();
    assert!(eventually(|| voice.is_closed()).await);
    Ok(())
}
