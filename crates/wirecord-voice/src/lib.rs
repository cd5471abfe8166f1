//! # wirecord-voice
//!
//! Voice transport: the signaling session, the UDP media session with IP
//! discovery and keepalive reports, per-packet AEAD encryption, and the
//! audio player that paces Opus frames onto the wire.

pub mod crypto;
pub mod discovery;
pub mod error;
pub mod player;
pub mod protocol;
pub mod rtp;
pub mod session;
pub mod source;
pub mod udp;

pub use crypto::{Cipher, CryptoError, EncryptionMode};
pub use error::VoiceError;
pub use player::{AudioPlayer, PlaybackStats, SpeakingSignal};
pub use session::{ReconnectFn, VoiceConnectParams, VoiceSession};
pub use source::{AudioSource, CommandAudioSource};
pub use udp::{MediaTransport, UdpMediaSession};
