//! Voice signaling protocol types
//!
//! Op codes, close codes and JSON payloads for the voice websocket.

pub mod close_codes;
pub mod messages;
pub mod opcodes;

pub use close_codes::VoiceCloseCode;
pub use messages::{
    HelloPayload, IdentifyPayload, ReadyPayload, ResumePayload, SelectProtocolData,
    SelectProtocolPayload, SessionDescriptionPayload, SpeakingPayload, VoiceMessage,
};
pub use opcodes::VoiceOpCode;
