//! Gateway dispatch handlers
//!
//! `gateway_table` wires control opcodes and dispatch events to the session.

mod cache;
mod control;
mod voice;

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use wirecord_session::DispatchTable;

use crate::error::GatewayError;
use crate::events::GatewayEventType as E;
use crate::protocol::OpCode;
use crate::session::GatewayInner;

type Inner = Arc<GatewayInner>;

pub(crate) fn parse<T: DeserializeOwned>(name: impl fmt::Display, data: Value) -> Result<T, GatewayError> {
    serde_json::from_value(data).map_err(|e| GatewayError::payload(name, e))
}

/// Handler table shared by a session and every session that replaces it
pub(crate) fn gateway_table() -> DispatchTable<GatewayInner> {
    DispatchTable::new()
        // Control plane
        .on_op(OpCode::Hello.as_u8(), |s: Inner, d: Value| async move { control::on_hello(&s, d) })
        .on_op(OpCode::HeartbeatAck.as_u8(), |s: Inner, _| async move {
            control::on_heartbeat_ack(&s);
            Ok(())
        })
        .on_op(OpCode::Heartbeat.as_u8(), |s: Inner, _| async move { s.send_heartbeat() })
        .on_op(OpCode::Reconnect.as_u8(), |s: Inner, _| async move {
            control::on_reconnect(&s);
            Ok(())
        })
        .on_op(OpCode::InvalidSession.as_u8(), |s: Inner, d: Value| async move {
            control::on_invalid_session(&s, &d);
            Ok(())
        })
        // Session
        .on_event(E::Ready.as_str(), |s: Inner, d: Value| async move { control::on_ready(&s, d) })
        .on_event(E::Resumed.as_str(), |s: Inner, _| async move {
            control::on_resumed(&s);
            Ok(())
        })
        .on_event(E::UserUpdate.as_str(), |s: Inner, d: Value| async move {
            control::on_user_update(&s, &d);
            Ok(())
        })
        // Guilds
        .on_event(E::GuildCreate.as_str(), |s: Inner, d: Value| async move { cache::on_guild_create(&s, d) })
        .on_event(E::GuildUpdate.as_str(), |s: Inner, d: Value| async move { s.cache.update_guild(&d).map_err(GatewayError::from) })
        .on_event(E::GuildDelete.as_str(), |s: Inner, d: Value| async move { cache::on_guild_delete(&s, &d) })
        // Channels
        .on_event(E::ChannelCreate.as_str(), |s: Inner, d: Value| async move {
            cache::guild_scoped(&d, || s.cache.upsert_channel(&d))
        })
        .on_event(E::ChannelUpdate.as_str(), |s: Inner, d: Value| async move {
            cache::guild_scoped(&d, || s.cache.upsert_channel(&d))
        })
        .on_event(E::ChannelDelete.as_str(), |s: Inner, d: Value| async move {
            cache::guild_scoped(&d, || s.cache.remove_channel(&d))
        })
        // Members
        .on_event(E::GuildMemberAdd.as_str(), |s: Inner, d: Value| async move { s.cache.upsert_member(&d).map_err(GatewayError::from) })
        .on_event(E::GuildMemberUpdate.as_str(), |s: Inner, d: Value| async move { cache::on_member_update(&s, &d).await })
        .on_event(E::GuildMemberRemove.as_str(), |s: Inner, d: Value| async move {
            s.cache.remove_member(&d).map(drop).map_err(GatewayError::from)
        })
        .on_event(E::GuildMembersChunk.as_str(), |s: Inner, d: Value| async move { cache::on_members_chunk(&s, &d) })
        // Roles
        .on_event(E::GuildRoleCreate.as_str(), |s: Inner, d: Value| async move { s.cache.upsert_role(&d).map_err(GatewayError::from) })
        .on_event(E::GuildRoleUpdate.as_str(), |s: Inner, d: Value| async move { s.cache.upsert_role(&d).map_err(GatewayError::from) })
        .on_event(E::GuildRoleDelete.as_str(), |s: Inner, d: Value| async move { s.cache.remove_role(&d).map_err(GatewayError::from) })
        // Messages
        .on_event(E::MessageCreate.as_str(), |s: Inner, d: Value| async move {
            cache::guild_scoped(&d, || s.cache.insert_message(&d))
        })
        .on_event(E::MessageUpdate.as_str(), |s: Inner, d: Value| async move { cache::on_message_update(&s, &d).await })
        .on_event(E::MessageDelete.as_str(), |s: Inner, d: Value| async move {
            cache::guild_scoped(&d, || s.cache.remove_message(&d))
        })
        .on_event(E::MessageDeleteBulk.as_str(), |s: Inner, d: Value| async move {
            cache::guild_scoped(&d, || s.cache.remove_messages(&d))
        })
        // Reactions
        .on_event(E::MessageReactionAdd.as_str(), |s: Inner, d: Value| async move {
            cache::on_reaction(&s, &d, cache::Reaction::Add).await
        })
        .on_event(E::MessageReactionRemove.as_str(), |s: Inner, d: Value| async move {
            cache::on_reaction(&s, &d, cache::Reaction::Remove).await
        })
        .on_event(E::MessageReactionRemoveAll.as_str(), |s: Inner, d: Value| async move {
            cache::on_reaction(&s, &d, cache::Reaction::Clear).await
        })
        // Presence
        .on_event(E::PresenceUpdate.as_str(), |s: Inner, d: Value| async move {
            cache::guild_scoped(&d, || s.cache.set_presence(&d))
        })
        .on_event(E::TypingStart.as_str(), |_, d: Value| async move {
            tracing::trace!(channel_id = %d["channel_id"], user_id = %d["user_id"], "Typing");
            Ok(())
        })
        // Voice
        .on_event(E::VoiceStateUpdate.as_str(), |s: Inner, d: Value| async move { voice::on_voice_state_update(&s, &d) })
        .on_event(E::VoiceServerUpdate.as_str(), |s: Inner, d: Value| async move {
            voice::on_voice_server_update(&s, d).await
        })
        // Commands run after this handler through the command registry
        .on_event(E::InteractionCreate.as_str(), |_, d: Value| async move {
            tracing::debug!(interaction_id = %d["id"], command = %d["data"]["name"], "Interaction received");
            Ok(())
        })
        .with_command_event(E::InteractionCreate.as_str())
}
