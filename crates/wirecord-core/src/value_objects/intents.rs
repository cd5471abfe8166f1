//! Gateway intents bitflags
//!
//! Intents select which dispatch event groups the gateway delivers to a session.

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

bitflags! {
    /// Gateway intent flags sent in Identify
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Intents: u64 {
        /// Guild create/update/delete, roles, channels
        const GUILDS                   = 1 << 0;
        /// Member add/update/remove (privileged)
        const GUILD_MEMBERS            = 1 << 1;
        /// Voice state updates
        const GUILD_VOICE_STATES       = 1 << 7;
        /// Presence updates (privileged)
        const GUILD_PRESENCES          = 1 << 8;
        /// Guild message create/update/delete
        const GUILD_MESSAGES           = 1 << 9;
        /// Guild message reactions
        const GUILD_MESSAGE_REACTIONS  = 1 << 10;
        /// Guild typing start
        const GUILD_MESSAGE_TYPING     = 1 << 11;
        /// Direct messages
        const DIRECT_MESSAGES          = 1 << 12;
        /// Message content (privileged)
        const MESSAGE_CONTENT          = 1 << 15;

        /// Intents needed to keep the guild cache and voice join working
        const DEFAULT = Self::GUILDS.bits()
            | Self::GUILD_MEMBERS.bits()
            | Self::GUILD_VOICE_STATES.bits()
            | Self::GUILD_PRESENCES.bits()
            | Self::GUILD_MESSAGES.bits()
            | Self::GUILD_MESSAGE_REACTIONS.bits();
    }
}

impl Intents {
    /// Check whether any privileged intent is requested
    #[inline]
    pub fn is_privileged(&self) -> bool {
        self.intersects(Self::GUILD_MEMBERS | Self::GUILD_PRESENCES | Self::MESSAGE_CONTENT)
    }
}

impl Default for Intents {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Intents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

// Serialize as a plain integer, the gateway's identify format
impl Serialize for Intents {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.bits())
    }
}

impl<'de> Deserialize<'de> for Intents {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bits = u64::deserialize(deserializer)?;
        Ok(Self::from_bits_truncate(bits))
    }
}
