//! Gateway protocol types
//!
//! Op codes, close codes, the JSON envelope and command payloads.

pub mod close_codes;
pub mod messages;
pub mod opcodes;
pub mod payloads;

pub use close_codes::CloseCode;
pub use messages::GatewayMessage;
pub use opcodes::OpCode;
pub use payloads::{
    Activity, HelloPayload, IdentifyPayload, IdentifyProperties, PresenceUpdatePayload, ReadyPayload,
    RequestGuildMembersPayload, ResumePayload, VoiceServerUpdate, VoiceStateUpdatePayload,
};
