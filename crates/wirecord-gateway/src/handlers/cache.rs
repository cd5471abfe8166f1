//! Guild cache mutation from dispatch events
//!
//! Events without a `guild_id` (direct messages) are skipped. Update and
//! reaction events for entities missing from the cache are filled in from the
//! REST API before the delta is applied.

use std::sync::Arc;

use serde_json::Value;
use wirecord_core::{cache::user_id_of, CacheError, Snowflake};

use crate::error::GatewayError;
use crate::session::GatewayInner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Reaction {
    Add,
    Remove,
    Clear,
}

fn guild_id(data: &Value) -> Option<Snowflake> {
    Snowflake::from_json(data.get("guild_id"))
}

fn required(data: &Value, field: &'static str) -> Result<Snowflake, GatewayError> {
    Snowflake::from_json(data.get(field)).ok_or(GatewayError::Cache(CacheError::MissingField(field)))
}

/// Apply `mutate` only to guild-scoped payloads
pub(super) fn guild_scoped(data: &Value, mutate: impl FnOnce() -> Result<(), CacheError>) -> Result<(), GatewayError> {
    if guild_id(data).is_none() {
        tracing::trace!("Skipping event without guild");
        return Ok(());
    }
    Ok(mutate()?)
}

/// Stamp the guild id on a REST entity, which omits it
fn with_guild(mut entity: Value, guild_id: Snowflake) -> Value {
    if let Some(fields) = entity.as_object_mut() {
        fields.insert("guild_id".into(), Value::String(guild_id.to_string()));
    }
    entity
}

pub(super) fn on_guild_create(inner: &GatewayInner, data: Value) -> Result<(), GatewayError> {
    let name = data.get("name").and_then(Value::as_str).map(str::to_string);
    let id = inner.cache.upsert_guild(data)?;
    tracing::debug!(guild_id = %id, name = ?name, "Guild cached");
    Ok(())
}

/// A real removal also drops the guild's voice session; an outage keeps both
pub(super) fn on_guild_delete(inner: &GatewayInner, data: &Value) -> Result<(), GatewayError> {
    match inner.cache.remove_guild(data)? {
        Some(guild) => {
            inner.joins.cancel(guild.id);
            if let Some((_, voice)) = inner.voice.remove(&guild.id) {
                voice.exit();
            }
            tracing::info!(guild_id = %guild.id, "Guild removed");
        }
        None => tracing::warn!(guild_id = %data["id"], "Guild unavailable"),
    }
    Ok(())
}

pub(super) fn on_members_chunk(inner: &GatewayInner, data: &Value) -> Result<(), GatewayError> {
    let count = inner.cache.upsert_members(data)?;
    tracing::trace!(guild_id = %data["guild_id"], count, "Member chunk cached");
    Ok(())
}

pub(super) async fn on_member_update(inner: &Arc<GatewayInner>, data: &Value) -> Result<(), GatewayError> {
    match inner.cache.update_member(data) {
        Err(e) if e.is_refetchable() => {
            let guild_id = required(data, "guild_id")?;
            let user_id = Snowflake::from_json(user_id_of(data)).ok_or(CacheError::MissingField("user.id"))?;
            tracing::debug!(guild_id = %guild_id, user_id = %user_id, "Member not cached, fetching");

            let member = inner.rest.get_member(guild_id, user_id).await?;
            inner.cache.upsert_member(&with_guild(member, guild_id))?;
            Ok(inner.cache.update_member(data)?)
        }
        other => Ok(other?),
    }
}

pub(super) async fn on_message_update(inner: &Arc<GatewayInner>, data: &Value) -> Result<(), GatewayError> {
    let Some(guild_id) = guild_id(data) else {
        return Ok(());
    };
    match inner.cache.update_message(data) {
        Err(e) if e.is_refetchable() => {
            refetch_message(inner, guild_id, data, "id").await?;
            Ok(inner.cache.update_message(data)?)
        }
        other => Ok(other?),
    }
}

/// Reaction deltas are not idempotent, so a fetched message is stored as is
/// and the delta is not applied on top of it
pub(super) async fn on_reaction(inner: &Arc<GatewayInner>, data: &Value, kind: Reaction) -> Result<(), GatewayError> {
    let Some(guild_id) = guild_id(data) else {
        return Ok(());
    };
    let me = match (Snowflake::from_json(data.get("user_id")), inner.user_id()) {
        (Some(reactor), Some(own)) => reactor == own,
        _ => false,
    };

    let applied = match kind {
        Reaction::Add => inner.cache.add_reaction(data, me),
        Reaction::Remove => inner.cache.remove_reaction(data, me),
        Reaction::Clear => inner.cache.clear_reactions(data),
    };
    match applied {
        Err(e) if e.is_refetchable() => refetch_message(inner, guild_id, data, "message_id").await,
        other => Ok(other?),
    }
}

async fn refetch_message(
    inner: &GatewayInner,
    guild_id: Snowflake,
    data: &Value,
    id_field: &'static str,
) -> Result<(), GatewayError> {
    let channel_id = required(data, "channel_id")?;
    let message_id = required(data, id_field)?;
    tracing::debug!(channel_id = %channel_id, message_id = %message_id, "Message not cached, fetching");

    let message = inner.rest.get_message(channel_id, message_id).await?;
    Ok(inner.cache.insert_message(&with_guild(message, guild_id))?)
}
