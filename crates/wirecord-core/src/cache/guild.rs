//! Cached guild - a server and the entities it owns
//!
//! Entities are stored as the opaque JSON objects the gateway delivered.
//! Only the identifiers needed for keying are interpreted.

use crate::value_objects::Snowflake;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Guild (server) cache entry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Guild {
    pub id: Snowflake,
    /// Top-level guild fields with the entity collections stripped out
    pub data: Value,
    pub channels: HashMap<Snowflake, Value>,
    /// Keyed by user id
    pub members: HashMap<Snowflake, Value>,
    pub roles: HashMap<Snowflake, Value>,
    /// Ordered by id so the oldest message is evicted first
    pub messages: BTreeMap<Snowflake, Value>,
    /// Keyed by user id
    pub presences: HashMap<Snowflake, Value>,
    /// Keyed by user id
    pub voice_states: HashMap<Snowflake, Value>,
}

impl Guild {
    /// Build a guild entry from a GUILD_CREATE payload
    ///
    /// Returns `None` when the payload carries no usable id.
    pub fn from_payload(mut payload: Value) -> Option<Self> {
        let id = Snowflake::from_json(payload.get("id"))?;
        let mut guild = Self {
            id,
            ..Self::default()
        };

        if let Some(object) = payload.as_object_mut() {
            guild.channels = index_by(object.remove("channels"), |v| v.get("id"));
            guild.members = index_by(object.remove("members"), user_id_of);
            guild.roles = index_by(object.remove("roles"), |v| v.get("id"));
            guild.presences = index_by(object.remove("presences"), user_id_of);
            guild.voice_states = index_by(object.remove("voice_states"), |v| v.get("user_id"));
        }
        guild.data = payload;

        Some(guild)
    }

    /// Apply a partial update to the top-level guild fields
    pub fn apply_update(&mut self, delta: &Value) {
        merge(&mut self.data, delta);
    }

    /// Check whether the guild is marked unavailable (outage)
    pub fn is_unavailable(&self) -> bool {
        self.data
            .get("unavailable")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Guild name if the payload carried one
    pub fn name(&self) -> Option<&str> {
        self.data.get("name").and_then(Value::as_str)
    }

    /// Insert a message, evicting the oldest when over `limit`
    pub fn push_message(&mut self, id: Snowflake, message: Value, limit: usize) {
        self.messages.insert(id, message);
        while self.messages.len() > limit {
            if self.messages.pop_first().is_none() {
                break;
            }
        }
    }

    /// Count a reaction on a cached message
    ///
    /// Returns false if the message is not cached.
    pub fn add_reaction(&mut self, message_id: Snowflake, emoji: &Value, me: bool) -> bool {
        let Some(message) = self.messages.get_mut(&message_id) else {
            return false;
        };
        let Some(object) = message.as_object_mut() else {
            return false;
        };

        let reactions = object
            .entry("reactions")
            .or_insert_with(|| Value::Array(Vec::new()));
        let Some(list) = reactions.as_array_mut() else {
            return false;
        };

        let key = emoji_key(emoji);
        let existing = list
            .iter_mut()
            .filter_map(Value::as_object_mut)
            .find(|r| r.get("emoji").map(emoji_key).as_deref() == Some(key.as_str()));

        if let Some(reaction) = existing {
            let count = reaction.get("count").and_then(Value::as_u64).unwrap_or(0);
            reaction.insert("count".to_string(), Value::from(count + 1));
            if me {
                reaction.insert("me".to_string(), Value::Bool(true));
            }
        } else {
            list.push(serde_json::json!({ "count": 1, "me": me, "emoji": emoji }));
        }
        true
    }

    /// Remove one reaction count from a cached message
    ///
    /// Returns false if the message is not cached.
    pub fn remove_reaction(&mut self, message_id: Snowflake, emoji: &Value, me: bool) -> bool {
        let Some(message) = self.messages.get_mut(&message_id) else {
            return false;
        };
        let Some(list) = message.get_mut("reactions").and_then(Value::as_array_mut) else {
            return true;
        };

        let key = emoji_key(emoji);
        let position = list.iter().position(|r| {
            r.get("emoji").map(emoji_key).as_deref() == Some(key.as_str())
        });

        if let Some(pos) = position {
            let count = list[pos].get("count").and_then(Value::as_u64).unwrap_or(0);
            if count <= 1 {
                list.remove(pos);
            } else if let Some(reaction) = list[pos].as_object_mut() {
                reaction.insert("count".to_string(), Value::from(count - 1));
                if me {
                    reaction.insert("me".to_string(), Value::Bool(false));
                }
            }
        }
        true
    }

    /// Drop every reaction on a cached message
    pub fn clear_reactions(&mut self, message_id: Snowflake) -> bool {
        match self.messages.get_mut(&message_id).and_then(Value::as_object_mut) {
            Some(object) => {
                object.insert("reactions".to_string(), Value::Array(Vec::new()));
                true
            }
            None => false,
        }
    }
}

/// Shallow-merge the fields of `delta` into `target`
///
/// Non-object targets are replaced outright.
pub fn merge(target: &mut Value, delta: &Value) {
    match (target.as_object_mut(), delta.as_object()) {
        (Some(existing), Some(fields)) => {
            for (key, value) in fields {
                existing.insert(key.clone(), value.clone());
            }
        }
        _ => *target = delta.clone(),
    }
}

/// The user id of a member/presence payload (`user.id`, falling back to `user_id`)
pub fn user_id_of(value: &Value) -> Option<&Value> {
    value
        .get("user")
        .and_then(|u| u.get("id"))
        .or_else(|| value.get("user_id"))
}

fn index_by<F>(list: Option<Value>, key: F) -> HashMap<Snowflake, Value>
where
    F: Fn(&Value) -> Option<&Value>,
{
    let Some(Value::Array(items)) = list else {
        return HashMap::new();
    };

    items
        .into_iter()
        .filter_map(|item| Snowflake::from_json(key(&item)).map(|id| (id, item)))
        .collect()
}

fn emoji_key(emoji: &Value) -> String {
    // Custom emoji compare by id, unicode emoji by name
    match emoji.get("id") {
        Some(id) if !id.is_null() => id.to_string(),
        _ => emoji
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_guild() -> Value {
        json!({
            "id": "1",
            "name": "Test Guild",
            "channels": [{"id": "10", "name": "general"}, {"id": "11", "name": "voice"}],
            "members": [{"user": {"id": "100"}, "nick": "alice"}],
            "roles": [{"id": "1", "name": "@everyone"}],
            "presences": [{"user": {"id": "100"}, "status": "online"}],
            "voice_states": [{"user_id": "100", "channel_id": "11"}]
        })
    }

    #[test]
    fn test_from_payload_indexes_collections() {
        let guild = Guild::from_payload(sample_guild()).unwrap();

        assert_eq!(guild.id, Snowflake::new(1));
        assert_eq!(guild.name(), Some("Test Guild"));
        assert_eq!(guild.channels.len(), 2);
        assert!(guild.members.contains_key(&Snowflake::new(100)));
        assert!(guild.presences.contains_key(&Snowflake::new(100)));
        assert!(guild.voice_states.contains_key(&Snowflake::new(100)));
        assert!(guild.data.get("channels").is_none());
    }

    #[test]
    fn test_from_payload_requires_id() {
        assert!(Guild::from_payload(json!({"name": "no id"})).is_none());
    }

    #[test]
    fn test_merge_is_shallow() {
        let mut target = json!({"name": "old", "topic": "keep"});
        merge(&mut target, &json!({"name": "new"}));
        assert_eq!(target, json!({"name": "new", "topic": "keep"}));
    }

    #[test]
    fn test_message_eviction() {
        let mut guild = Guild::from_payload(json!({"id": "1"})).unwrap();
        for id in 1..=5u64 {
            guild.push_message(Snowflake::new(id), json!({"id": id.to_string()}), 3);
        }

        assert_eq!(guild.messages.len(), 3);
        assert!(!guild.messages.contains_key(&Snowflake::new(1)));
        assert!(guild.messages.contains_key(&Snowflake::new(5)));
    }

    #[test]
    fn test_reaction_counting() {
        let mut guild = Guild::from_payload(json!({"id": "1"})).unwrap();
        let msg = Snowflake::new(50);
        guild.push_message(msg, json!({"id": "50"}), 10);

        let emoji = json!({"id": null, "name": "👍"});
        assert!(guild.add_reaction(msg, &emoji, false));
        assert!(guild.add_reaction(msg, &emoji, true));

        let reactions = guild.messages[&msg]["reactions"].as_array().unwrap().clone();
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions[0]["count"], 2);
        assert_eq!(reactions[0]["me"], true);

        assert!(guild.remove_reaction(msg, &emoji, true));
        assert_eq!(guild.messages[&msg]["reactions"][0]["count"], 1);
        assert!(guild.remove_reaction(msg, &emoji, false));
        assert!(guild.messages[&msg]["reactions"].as_array().unwrap().is_empty());

        assert!(!guild.add_reaction(Snowflake::new(999), &emoji, false));
    }
}
