//! Control opcodes and session events

use std::sync::Arc;

use serde_json::Value;
use wirecord_core::cache::merge;
use wirecord_core::Snowflake;

use super::parse;
use crate::error::GatewayError;
use crate::protocol::{HelloPayload, ReadyPayload};
use crate::session::{escalate, recover, GatewayInner, SessionIdentity, HELLO_GATE, READY_GATE, RESUMED_GATE};

/// Op 10: start the heartbeat and release the handshake
pub(super) fn on_hello(inner: &Arc<GatewayInner>, data: Value) -> Result<(), GatewayError> {
    let hello: HelloPayload = parse("Hello", data)?;
    tracing::debug!(interval_ms = hello.heartbeat_interval, "Gateway hello");

    let weak = Arc::downgrade(inner);
    inner.heartbeat.start(hello.interval(), &inner.lifetime, move || match weak.upgrade() {
        Some(inner) => inner.beat(),
        None => Err(GatewayError::Cancelled),
    });
    inner.gates.close(HELLO_GATE);
    Ok(())
}

pub(super) fn on_heartbeat_ack(inner: &GatewayInner) {
    inner.tracker.ack();
    tracing::trace!(latency = ?inner.tracker.latency(), "Heartbeat acknowledged");
}

/// Op 7: the server wants us to resume elsewhere
pub(super) fn on_reconnect(inner: &Arc<GatewayInner>) {
    tracing::info!("Gateway requested reconnect, resuming");
    recover(&Arc::downgrade(inner));
}

/// Op 9: `d` says whether the session can still be resumed
pub(super) fn on_invalid_session(inner: &Arc<GatewayInner>, data: &Value) {
    if data.as_bool().unwrap_or(false) {
        tracing::warn!("Gateway session invalidated, resumable");
        recover(&Arc::downgrade(inner));
    } else {
        tracing::warn!("Gateway session invalidated, identifying again");
        *inner.identity.write() = None;
        escalate(&Arc::downgrade(inner));
    }
}

pub(super) fn on_ready(inner: &GatewayInner, data: Value) -> Result<(), GatewayError> {
    let ready: ReadyPayload = parse("READY", data)?;
    tracing::debug!(
        session_id = %ready.session_id,
        user_id = ?ready.user_id(),
        guilds = ready.guilds.len(),
        "Gateway READY"
    );

    *inner.identity.write() = Some(SessionIdentity {
        session_id: ready.session_id,
        resume_url: ready.resume_gateway_url,
    });
    *inner.user.write() = Some(ready.user);
    inner.gates.close(READY_GATE);
    Ok(())
}

pub(super) fn on_resumed(inner: &GatewayInner) {
    inner.gates.close(RESUMED_GATE);
}

pub(super) fn on_user_update(inner: &GatewayInner, data: &Value) {
    let mut user = inner.user.write();
    if user.is_none() {
        *user = Some(data.clone());
        return;
    }
    if let Some(current) = user.as_mut() {
        if Snowflake::from_json(current.get("id")) == Snowflake::from_json(data.get("id")) {
            merge(current, data);
        }
    }
}
