//! Guild cache store
//!
//! All mutation goes through one lock so every dispatch handler observes a
//! consistent snapshot, however many handlers run at once.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;

use super::guild::{merge, user_id_of, Guild};
use crate::error::CacheError;
use crate::value_objects::Snowflake;

/// Default number of messages kept per guild
pub const DEFAULT_MAX_MESSAGES: usize = 1000;

/// Keyed collection of guilds mutated by dispatch events
#[derive(Debug)]
pub struct GuildCache {
    guilds: RwLock<HashMap<Snowflake, Guild>>,
    max_messages: usize,
}

impl Default for GuildCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGES)
    }
}

impl GuildCache {
    /// Create an empty cache keeping at most `max_messages` per guild
    pub fn new(max_messages: usize) -> Self {
        Self {
            guilds: RwLock::new(HashMap::new()),
            max_messages,
        }
    }

    // =========================================================================
    // Guilds
    // =========================================================================

    /// Insert or replace a guild from a GUILD_CREATE payload
    pub fn upsert_guild(&self, payload: Value) -> Result<Snowflake, CacheError> {
        let guild = Guild::from_payload(payload).ok_or(CacheError::MissingField("id"))?;
        let id = guild.id;
        self.guilds.write().insert(id, guild);
        Ok(id)
    }

    /// Merge a GUILD_UPDATE payload into the cached guild
    pub fn update_guild(&self, payload: &Value) -> Result<(), CacheError> {
        let id = field_id(payload, "id")?;
        self.write_guild(id, |guild| guild.apply_update(payload))
    }

    /// Handle GUILD_DELETE
    ///
    /// An outage (`unavailable: true`) only flags the guild; a real removal
    /// drops it and returns the evicted entry.
    pub fn remove_guild(&self, payload: &Value) -> Result<Option<Guild>, CacheError> {
        let id = field_id(payload, "id")?;
        let unavailable = payload
            .get("unavailable")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut guilds = self.guilds.write();
        if unavailable {
            if let Some(guild) = guilds.get_mut(&id) {
                guild.apply_update(&serde_json::json!({ "unavailable": true }));
            }
            return Ok(None);
        }
        Ok(guilds.remove(&id))
    }

    // =========================================================================
    // Channels
    // =========================================================================

    /// Insert or replace a channel (CHANNEL_CREATE / CHANNEL_UPDATE)
    pub fn upsert_channel(&self, payload: &Value) -> Result<(), CacheError> {
        let guild_id = field_id(payload, "guild_id")?;
        let id = field_id(payload, "id")?;
        self.write_guild(guild_id, |guild| {
            guild.channels.insert(id, payload.clone());
        })
    }

    /// Drop a channel and any messages cached for it
    pub fn remove_channel(&self, payload: &Value) -> Result<(), CacheError> {
        let guild_id = field_id(payload, "guild_id")?;
        let id = field_id(payload, "id")?;
        self.write_guild(guild_id, |guild| {
            guild.channels.remove(&id);
            guild
                .messages
                .retain(|_, m| Snowflake::from_json(m.get("channel_id")) != Some(id));
        })
    }

    // =========================================================================
    // Members
    // =========================================================================

    /// Insert or replace a member (GUILD_MEMBER_ADD)
    pub fn upsert_member(&self, payload: &Value) -> Result<(), CacheError> {
        let guild_id = field_id(payload, "guild_id")?;
        let user_id = Snowflake::from_json(user_id_of(payload)).ok_or(CacheError::MissingField("user.id"))?;
        self.write_guild(guild_id, |guild| {
            guild.members.insert(user_id, payload.clone());
        })
    }

    /// Insert every member of a GUILD_MEMBERS_CHUNK
    pub fn upsert_members(&self, payload: &Value) -> Result<usize, CacheError> {
        let guild_id = field_id(payload, "guild_id")?;
        let members = payload
            .get("members")
            .and_then(Value::as_array)
            .ok_or(CacheError::MissingField("members"))?;

        let mut inserted = 0;
        self.write_guild(guild_id, |guild| {
            for member in members {
                if let Some(user_id) = Snowflake::from_json(user_id_of(member)) {
                    guild.members.insert(user_id, member.clone());
                    inserted += 1;
                }
            }
        })?;
        Ok(inserted)
    }

    /// Merge a GUILD_MEMBER_UPDATE delta into a cached member
    ///
    /// Fails with `MemberNotFound` when the member is not cached so the caller
    /// can refetch it first.
    pub fn update_member(&self, payload: &Value) -> Result<(), CacheError> {
        let guild_id = field_id(payload, "guild_id")?;
        let user_id = Snowflake::from_json(user_id_of(payload)).ok_or(CacheError::MissingField("user.id"))?;

        let mut guilds = self.guilds.write();
        let guild = guilds
            .get_mut(&guild_id)
            .ok_or(CacheError::GuildNotFound(guild_id))?;
        let member = guild
            .members
            .get_mut(&user_id)
            .ok_or(CacheError::MemberNotFound(user_id))?;
        merge(member, payload);
        Ok(())
    }

    /// Drop a member (GUILD_MEMBER_REMOVE)
    pub fn remove_member(&self, payload: &Value) -> Result<Option<Value>, CacheError> {
        let guild_id = field_id(payload, "guild_id")?;
        let user_id = Snowflake::from_json(user_id_of(payload)).ok_or(CacheError::MissingField("user.id"))?;
        let mut removed = None;
        self.write_guild(guild_id, |guild| {
            removed = guild.members.remove(&user_id);
            guild.presences.remove(&user_id);
        })?;
        Ok(removed)
    }

    // =========================================================================
    // Roles
    // =========================================================================

    /// Insert or replace a role (GUILD_ROLE_CREATE / GUILD_ROLE_UPDATE)
    pub fn upsert_role(&self, payload: &Value) -> Result<(), CacheError> {
        let guild_id = field_id(payload, "guild_id")?;
        let role = payload.get("role").ok_or(CacheError::MissingField("role"))?;
        let id = field_id(role, "id")?;
        self.write_guild(guild_id, |guild| {
            guild.roles.insert(id, role.clone());
        })
    }

    /// Drop a role (GUILD_ROLE_DELETE)
    pub fn remove_role(&self, payload: &Value) -> Result<(), CacheError> {
        let guild_id = field_id(payload, "guild_id")?;
        let id = field_id(payload, "role_id")?;
        self.write_guild(guild_id, |guild| {
            guild.roles.remove(&id);
        })
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Cache a message (MESSAGE_CREATE)
    pub fn insert_message(&self, payload: &Value) -> Result<(), CacheError> {
        let guild_id = field_id(payload, "guild_id")?;
        let id = field_id(payload, "id")?;
        let limit = self.max_messages;
        self.write_guild(guild_id, |guild| {
            guild.push_message(id, payload.clone(), limit);
        })
    }

    /// Merge a MESSAGE_UPDATE delta into a cached message
    ///
    /// Fails with `MessageNotFound` when the message is not cached.
    pub fn update_message(&self, payload: &Value) -> Result<(), CacheError> {
        let guild_id = field_id(payload, "guild_id")?;
        let id = field_id(payload, "id")?;

        let mut guilds = self.guilds.write();
        let guild = guilds
            .get_mut(&guild_id)
            .ok_or(CacheError::GuildNotFound(guild_id))?;
        let message = guild
            .messages
            .get_mut(&id)
            .ok_or(CacheError::MessageNotFound(id))?;
        merge(message, payload);
        Ok(())
    }

    /// Drop a message (MESSAGE_DELETE)
    pub fn remove_message(&self, payload: &Value) -> Result<(), CacheError> {
        let guild_id = field_id(payload, "guild_id")?;
        let id = field_id(payload, "id")?;
        self.write_guild(guild_id, |guild| {
            guild.messages.remove(&id);
        })
    }

    /// Drop several messages (MESSAGE_DELETE_BULK)
    pub fn remove_messages(&self, payload: &Value) -> Result<(), CacheError> {
        let guild_id = field_id(payload, "guild_id")?;
        let ids: Vec<Snowflake> = payload
            .get("ids")
            .and_then(Value::as_array)
            .ok_or(CacheError::MissingField("ids"))?
            .iter()
            .filter_map(|id| Snowflake::from_json(Some(id)))
            .collect();

        self.write_guild(guild_id, |guild| {
            for id in &ids {
                guild.messages.remove(id);
            }
        })
    }

    // =========================================================================
    // Reactions
    // =========================================================================

    /// Count a reaction (MESSAGE_REACTION_ADD)
    ///
    /// `me` marks reactions placed by the current user.
    pub fn add_reaction(&self, payload: &Value, me: bool) -> Result<(), CacheError> {
        let (guild_id, message_id, emoji) = reaction_target(payload)?;
        self.write_guild(guild_id, |guild| guild.add_reaction(message_id, emoji, me))
            .and_then(|found| found.then_some(()).ok_or(CacheError::MessageNotFound(message_id)))
    }

    /// Uncount a reaction (MESSAGE_REACTION_REMOVE)
    pub fn remove_reaction(&self, payload: &Value, me: bool) -> Result<(), CacheError> {
        let (guild_id, message_id, emoji) = reaction_target(payload)?;
        self.write_guild(guild_id, |guild| guild.remove_reaction(message_id, emoji, me))
            .and_then(|found| found.then_some(()).ok_or(CacheError::MessageNotFound(message_id)))
    }

    /// Drop all reactions on a message (MESSAGE_REACTION_REMOVE_ALL)
    pub fn clear_reactions(&self, payload: &Value) -> Result<(), CacheError> {
        let guild_id = field_id(payload, "guild_id")?;
        let message_id = field_id(payload, "message_id")?;
        self.write_guild(guild_id, |guild| guild.clear_reactions(message_id))
            .and_then(|found| found.then_some(()).ok_or(CacheError::MessageNotFound(message_id)))
    }

    // =========================================================================
    // Presences and voice states
    // =========================================================================

    /// Merge a PRESENCE_UPDATE into the guild's presence map
    pub fn set_presence(&self, payload: &Value) -> Result<(), CacheError> {
        let guild_id = field_id(payload, "guild_id")?;
        let user_id = Snowflake::from_json(user_id_of(payload)).ok_or(CacheError::MissingField("user.id"))?;
        self.write_guild(guild_id, |guild| {
            guild
                .presences
                .entry(user_id)
                .and_modify(|existing| merge(existing, payload))
                .or_insert_with(|| payload.clone());
        })
    }

    /// Apply a VOICE_STATE_UPDATE
    ///
    /// A null `channel_id` means the user left voice and the state is dropped.
    pub fn set_voice_state(&self, payload: &Value) -> Result<(), CacheError> {
        let guild_id = field_id(payload, "guild_id")?;
        let user_id = field_id(payload, "user_id")?;
        let left = payload.get("channel_id").map_or(true, Value::is_null);
        self.write_guild(guild_id, |guild| {
            if left {
                guild.voice_states.remove(&user_id);
            } else {
                guild.voice_states.insert(user_id, payload.clone());
            }
        })
    }

    // =========================================================================
    // Read access and handoff
    // =========================================================================

    /// Snapshot of a cached guild
    pub fn get_guild(&self, id: Snowflake) -> Option<Guild> {
        self.guilds.read().get(&id).cloned()
    }

    /// Run `f` against a cached guild without cloning it
    pub fn with_guild<R>(&self, id: Snowflake, f: impl FnOnce(&Guild) -> R) -> Option<R> {
        self.guilds.read().get(&id).map(f)
    }

    /// Ids of every cached guild
    pub fn guild_ids(&self) -> Vec<Snowflake> {
        self.guilds.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.guilds.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guilds.read().is_empty()
    }

    /// Move every guild out, leaving the cache empty
    pub fn take(&self) -> HashMap<Snowflake, Guild> {
        std::mem::take(&mut *self.guilds.write())
    }

    /// Re-attach guilds handed off from a previous session
    ///
    /// Entries already present (delivered by the new session) win.
    pub fn adopt(&self, guilds: HashMap<Snowflake, Guild>) {
        let mut current = self.guilds.write();
        for (id, guild) in guilds {
            current.entry(id).or_insert(guild);
        }
    }

    fn write_guild<R>(
        &self,
        id: Snowflake,
        f: impl FnOnce(&mut Guild) -> R,
    ) -> Result<R, CacheError> {
        let mut guilds = self.guilds.write();
        let guild = guilds.get_mut(&id).ok_or(CacheError::GuildNotFound(id))?;
        Ok(f(guild))
    }
}

fn field_id(payload: &Value, field: &'static str) -> Result<Snowflake, CacheError> {
    Snowflake::from_json(payload.get(field)).ok_or(CacheError::MissingField(field))
}

fn reaction_target(payload: &Value) -> Result<(Snowflake, Snowflake, &Value), CacheError> {
    let guild_id = field_id(payload, "guild_id")?;
    let message_id = field_id(payload, "message_id")?;
    let emoji = payload.get("emoji").ok_or(CacheError::MissingField("emoji"))?;
    Ok((guild_id, message_id, emoji))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache_with_guild() -> GuildCache {
        let cache = GuildCache::new(2);
        cache
            .upsert_guild(json!({
                "id": "1",
                "name": "Guild",
                "channels": [{"id": "10", "guild_id": "1"}],
                "members": [{"user": {"id": "100"}, "nick": "a"}]
            }))
            .unwrap();
        cache
    }

    #[test]
    fn test_guild_lifecycle() {
        let cache = cache_with_guild();
        assert_eq!(cache.len(), 1);

        cache.update_guild(&json!({"id": "1", "name": "Renamed"})).unwrap();
        assert_eq!(
            cache.with_guild(Snowflake::new(1), |g| g.name().map(str::to_string)),
            Some(Some("Renamed".to_string()))
        );

        // Outage keeps the entry
        let evicted = cache
            .remove_guild(&json!({"id": "1", "unavailable": true}))
            .unwrap();
        assert!(evicted.is_none());
        assert!(cache.get_guild(Snowflake::new(1)).unwrap().is_unavailable());

        let evicted = cache.remove_guild(&json!({"id": "1"})).unwrap();
        assert!(evicted.is_some());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_unknown_guild_is_reported() {
        let cache = GuildCache::default();
        let err = cache
            .upsert_channel(&json!({"id": "10", "guild_id": "99"}))
            .unwrap_err();
        assert_eq!(err, CacheError::GuildNotFound(Snowflake::new(99)));
    }

    #[test]
    fn test_member_update_requires_cached_member() {
        let cache = cache_with_guild();

        cache
            .update_member(&json!({"guild_id": "1", "user": {"id": "100"}, "nick": "b"}))
            .unwrap();
        let nick = cache
            .with_guild(Snowflake::new(1), |g| g.members[&Snowflake::new(100)]["nick"].clone())
            .unwrap();
        assert_eq!(nick, "b");

        let err = cache
            .update_member(&json!({"guild_id": "1", "user": {"id": "200"}}))
            .unwrap_err();
        assert_eq!(err, CacheError::MemberNotFound(Snowflake::new(200)));
        assert!(err.is_refetchable());
    }

    #[test]
    fn test_message_update_and_bulk_delete() {
        let cache = cache_with_guild();
        for id in ["20", "21"] {
            cache
                .insert_message(&json!({"id": id, "guild_id": "1", "channel_id": "10", "content": "x"}))
                .unwrap();
        }

        cache
            .update_message(&json!({"id": "21", "guild_id": "1", "content": "edited"}))
            .unwrap();
        let guild = cache.get_guild(Snowflake::new(1)).unwrap();
        assert_eq!(guild.messages[&Snowflake::new(21)]["content"], "edited");
        assert_eq!(guild.messages[&Snowflake::new(21)]["channel_id"], "10");

        let err = cache
            .update_message(&json!({"id": "99", "guild_id": "1"}))
            .unwrap_err();
        assert_eq!(err, CacheError::MessageNotFound(Snowflake::new(99)));

        cache
            .remove_messages(&json!({"ids": ["20", "21"], "guild_id": "1"}))
            .unwrap();
        assert!(cache.get_guild(Snowflake::new(1)).unwrap().messages.is_empty());
    }

    #[test]
    fn test_channel_delete_drops_its_messages() {
        let cache = cache_with_guild();
        cache
            .insert_message(&json!({"id": "20", "guild_id": "1", "channel_id": "10"}))
            .unwrap();
        cache
            .remove_channel(&json!({"id": "10", "guild_id": "1"}))
            .unwrap();

        let guild = cache.get_guild(Snowflake::new(1)).unwrap();
        assert!(guild.channels.is_empty());
        assert!(guild.messages.is_empty());
    }

    #[test]
    fn test_reactions_through_cache() {
        let cache = cache_with_guild();
        cache
            .insert_message(&json!({"id": "20", "guild_id": "1", "channel_id": "10"}))
            .unwrap();
        let event = json!({
            "guild_id": "1", "message_id": "20", "user_id": "100",
            "emoji": {"id": null, "name": "🔥"}
        });

        cache.add_reaction(&event, false).unwrap();
        cache.add_reaction(&event, false).unwrap();
        let count = cache
            .with_guild(Snowflake::new(1), |g| g.messages[&Snowflake::new(20)]["reactions"][0]["count"].clone())
            .unwrap();
        assert_eq!(count, 2);

        cache
            .clear_reactions(&json!({"guild_id": "1", "message_id": "20"}))
            .unwrap();

        let missing = json!({"guild_id": "1", "message_id": "21", "emoji": {"name": "x"}});
        assert_eq!(
            cache.add_reaction(&missing, false).unwrap_err(),
            CacheError::MessageNotFound(Snowflake::new(21))
        );
    }

    #[test]
    fn test_voice_state_null_channel_removes() {
        let cache = cache_with_guild();
        cache
            .set_voice_state(&json!({"guild_id": "1", "user_id": "100", "channel_id": "11"}))
            .unwrap();
        assert_eq!(cache.get_guild(Snowflake::new(1)).unwrap().voice_states.len(), 1);

        cache
            .set_voice_state(&json!({"guild_id": "1", "user_id": "100", "channel_id": null}))
            .unwrap();
        assert!(cache.get_guild(Snowflake::new(1)).unwrap().voice_states.is_empty());
    }

    #[test]
    fn test_presence_merges() {
        let cache = cache_with_guild();
        cache
            .set_presence(&json!({"guild_id": "1", "user": {"id": "100"}, "status": "online", "activities": []}))
            .unwrap();
        cache
            .set_presence(&json!({"guild_id": "1", "user": {"id": "100"}, "status": "idle"}))
            .unwrap();

        let presence = cache
            .with_guild(Snowflake::new(1), |g| g.presences[&Snowflake::new(100)].clone())
            .unwrap();
        assert_eq!(presence["status"], "idle");
        assert!(presence.get("activities").is_some());
    }

    #[test]
    fn test_take_and_adopt() {
        let old = cache_with_guild();
        old.upsert_guild(json!({"id": "3"})).unwrap();
        let handed = old.take();
        assert!(old.is_empty());

        let fresh = GuildCache::default();
        fresh.upsert_guild(json!({"id": "1", "name": "From new session"})).unwrap();
        fresh.upsert_guild(json!({"id": "2"})).unwrap();
        fresh.adopt(handed);

        assert_eq!(fresh.len(), 3);
        let name = fresh.get_guild(Snowflake::new(1)).unwrap();
        assert_eq!(name.name(), Some("From new session"));
    }
}
