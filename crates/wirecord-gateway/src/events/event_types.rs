//! Gateway event types
//!
//! Event names carried in the `t` field of dispatch messages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Gateway event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayEventType {
    // Connection events
    /// Sent after a successful Identify
    Ready,
    /// Sent after a successful Resume
    Resumed,

    // Guild events
    /// Guild available, joined, or created
    GuildCreate,
    /// Guild settings changed
    GuildUpdate,
    /// Left guild, kicked, or guild outage
    GuildDelete,

    // Channel events
    ChannelCreate,
    ChannelUpdate,
    ChannelDelete,

    // Member events
    /// User joined guild
    GuildMemberAdd,
    /// Member updated (roles, nickname)
    GuildMemberUpdate,
    /// User left guild
    GuildMemberRemove,
    /// Response to Request Guild Members
    GuildMembersChunk,

    // Role events
    GuildRoleCreate,
    GuildRoleUpdate,
    GuildRoleDelete,

    // Message events
    /// New message
    MessageCreate,
    /// Message edited
    MessageUpdate,
    /// Message deleted
    MessageDelete,
    /// Several messages deleted at once
    MessageDeleteBulk,

    // Reaction events
    MessageReactionAdd,
    MessageReactionRemove,
    MessageReactionRemoveAll,

    // Presence events
    /// User status changed
    PresenceUpdate,
    /// User started typing
    TypingStart,

    // Voice events
    /// A user joined, left or moved voice
    VoiceStateUpdate,
    /// Voice server allocated or moved
    VoiceServerUpdate,

    // Interaction events
    /// Application command invoked
    InteractionCreate,

    // User events
    /// Current user updated
    UserUpdate,
}

impl GatewayEventType {
    /// Every event the session handles
    pub const ALL: [Self; 28] = [
        Self::Ready,
        Self::Resumed,
        Self::GuildCreate,
        Self::GuildUpdate,
        Self::GuildDelete,
        Self::ChannelCreate,
        Self::ChannelUpdate,
        Self::ChannelDelete,
        Self::GuildMemberAdd,
        Self::GuildMemberUpdate,
        Self::GuildMemberRemove,
        Self::GuildMembersChunk,
        Self::GuildRoleCreate,
        Self::GuildRoleUpdate,
        Self::GuildRoleDelete,
        Self::MessageCreate,
        Self::MessageUpdate,
        Self::MessageDelete,
        Self::MessageDeleteBulk,
        Self::MessageReactionAdd,
        Self::MessageReactionRemove,
        Self::MessageReactionRemoveAll,
        Self::PresenceUpdate,
        Self::TypingStart,
        Self::VoiceStateUpdate,
        Self::VoiceServerUpdate,
        Self::InteractionCreate,
        Self::UserUpdate,
    ];

    /// Get the string representation of the event type
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Resumed => "RESUMED",
            Self::GuildCreate => "GUILD_CREATE",
            Self::GuildUpdate => "GUILD_UPDATE",
            Self::GuildDelete => "GUILD_DELETE",
            Self::ChannelCreate => "CHANNEL_CREATE",
            Self::ChannelUpdate => "CHANNEL_UPDATE",
            Self::ChannelDelete => "CHANNEL_DELETE",
            Self::GuildMemberAdd => "GUILD_MEMBER_ADD",
            Self::GuildMemberUpdate => "GUILD_MEMBER_UPDATE",
            Self::GuildMemberRemove => "GUILD_MEMBER_REMOVE",
            Self::GuildMembersChunk => "GUILD_MEMBERS_CHUNK",
            Self::GuildRoleCreate => "GUILD_ROLE_CREATE",
            Self::GuildRoleUpdate => "GUILD_ROLE_UPDATE",
            Self::GuildRoleDelete => "GUILD_ROLE_DELETE",
            Self::MessageCreate => "MESSAGE_CREATE",
            Self::MessageUpdate => "MESSAGE_UPDATE",
            Self::MessageDelete => "MESSAGE_DELETE",
            Self::MessageDeleteBulk => "MESSAGE_DELETE_BULK",
            Self::MessageReactionAdd => "MESSAGE_REACTION_ADD",
            Self::MessageReactionRemove => "MESSAGE_REACTION_REMOVE",
            Self::MessageReactionRemoveAll => "MESSAGE_REACTION_REMOVE_ALL",
            Self::PresenceUpdate => "PRESENCE_UPDATE",
            Self::TypingStart => "TYPING_START",
            Self::VoiceStateUpdate => "VOICE_STATE_UPDATE",
            Self::VoiceServerUpdate => "VOICE_SERVER_UPDATE",
            Self::InteractionCreate => "INTERACTION_CREATE",
            Self::UserUpdate => "USER_UPDATE",
        }
    }

    /// Parse an event type from a string
    #[must_use]
    pub fn from_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.as_str() == s)
    }

    /// Whether the event mutates the guild cache
    #[must_use]
    pub const fn mutates_cache(self) -> bool {
        !matches!(
            self,
            Self::Ready | Self::Resumed | Self::TypingStart | Self::InteractionCreate | Self::VoiceServerUpdate | Self::UserUpdate
        )
    }
}

impl fmt::Display for GatewayEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<GatewayEventType> for String {
    fn from(event: GatewayEventType) -> Self {
        event.as_str().to_string()
    }
}
