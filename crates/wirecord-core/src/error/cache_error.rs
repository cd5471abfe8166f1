//! Cache errors - lookups that missed the local guild cache

use thiserror::Error;

use crate::value_objects::Snowflake;

/// Guild cache errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("Guild not cached: {0}")]
    GuildNotFound(Snowflake),

    #[error("Channel not cached: {0}")]
    ChannelNotFound(Snowflake),

    #[error("Message not cached: {0}")]
    MessageNotFound(Snowflake),

    #[error("Member not cached: {0}")]
    MemberNotFound(Snowflake),

    #[error("Payload missing field: {0}")]
    MissingField(&'static str),
}

impl CacheError {
    /// Whether a REST refetch could fill the gap
    pub fn is_refetchable(&self) -> bool {
        matches!(self, Self::MessageNotFound(_) | Self::MemberNotFound(_))
    }
}
