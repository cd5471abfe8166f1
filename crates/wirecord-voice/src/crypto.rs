//! Media packet encryption
//!
//! Two AEAD modes are supported:
//!
//! - `aead_aes256_gcm_rtpsize`: AES-256-GCM with the RTP header as AAD. The
//!   12-byte nonce is a 32-bit big-endian counter followed by zeros; the
//!   counter is appended to the packet in cleartext.
//! - `xchacha20_poly1305`: XChaCha20-Poly1305 whose 24-byte nonce is the RTP
//!   header followed by zeros.

use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use thiserror::Error;

use crate::rtp::RTP_HEADER_LEN;

/// Secret key size in bytes
pub const KEY_SIZE: usize = 32;

/// Poly1305 and GCM tag size
pub const TAG_SIZE: usize = 16;

const COUNTER_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("secret key must be {KEY_SIZE} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("unsupported encryption mode: {0}")]
    UnsupportedMode(String),
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed (authentication error)")]
    DecryptionFailed,
    #[error("packet too short")]
    PacketTooShort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionMode {
    Aes256GcmRtpSize,
    XChaCha20Poly1305,
}

impl EncryptionMode {
    /// Supported modes, most preferred first
    pub const PREFERENCE: [Self; 2] = [Self::Aes256GcmRtpSize, Self::XChaCha20Poly1305];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aes256GcmRtpSize => "aead_aes256_gcm_rtpsize",
            Self::XChaCha20Poly1305 => "xchacha20_poly1305",
        }
    }

    /// Pick the best mode among those the server offers
    pub fn preferred<S: AsRef<str>>(offered: &[S]) -> Option<Self> {
        Self::PREFERENCE
            .into_iter()
            .find(|mode| offered.iter().any(|o| o.as_ref() == mode.as_str()))
    }
}

impl FromStr for EncryptionMode {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::PREFERENCE
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| CryptoError::UnsupportedMode(s.to_string()))
    }
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum AeadImpl {
    Aes(Box<Aes256Gcm>),
    XChaCha(Box<XChaCha20Poly1305>),
}

/// A keyed cipher for one negotiated mode
///
/// Fixed for the life of the secret key.
pub struct Cipher {
    mode: EncryptionMode,
    aead: AeadImpl,
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher").field("mode", &self.mode).finish()
    }
}

fn counter_nonce(counter: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..COUNTER_SIZE].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn header_nonce(header: &[u8; RTP_HEADER_LEN]) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[..RTP_HEADER_LEN].copy_from_slice(header);
    nonce
}

impl Cipher {
    pub fn new(mode: EncryptionMode, key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength(key.len()));
        }
        let aead = match mode {
            EncryptionMode::Aes256GcmRtpSize => AeadImpl::Aes(Box::new(
                Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?,
            )),
            EncryptionMode::XChaCha20Poly1305 => AeadImpl::XChaCha(Box::new(
                XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?,
            )),
        };
        Ok(Self { mode, aead })
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    /// Encrypt one frame into a complete media packet
    ///
    /// `counter` is only consumed by the counter-nonce mode.
    pub fn seal(&self, header: &[u8; RTP_HEADER_LEN], counter: u32, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + frame.len() + TAG_SIZE + COUNTER_SIZE);
        packet.extend_from_slice(header);

        match &self.aead {
            AeadImpl::Aes(cipher) => {
                let nonce = counter_nonce(counter);
                let sealed = cipher
                    .encrypt(Nonce::from_slice(&nonce), Payload { msg: frame, aad: header })
                    .map_err(|_| CryptoError::EncryptionFailed)?;
                packet.extend_from_slice(&sealed);
                packet.extend_from_slice(&counter.to_be_bytes());
            }
            AeadImpl::XChaCha(cipher) => {
                let nonce = header_nonce(header);
                let sealed = cipher
                    .encrypt(XNonce::from_slice(&nonce), frame)
                    .map_err(|_| CryptoError::EncryptionFailed)?;
                packet.extend_from_slice(&sealed);
            }
        }
        Ok(packet)
    }

    /// Decrypt a media packet back to its frame
    pub fn open(&self, packet: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if packet.len() < RTP_HEADER_LEN + TAG_SIZE {
            return Err(CryptoError::PacketTooShort);
        }
        let mut header = [0u8; RTP_HEADER_LEN];
        header.copy_from_slice(&packet[..RTP_HEADER_LEN]);

        match &self.aead {
            AeadImpl::Aes(cipher) => {
                if packet.len() < RTP_HEADER_LEN + TAG_SIZE + COUNTER_SIZE {
                    return Err(CryptoError::PacketTooShort);
                }
                let (body, counter) = packet[RTP_HEADER_LEN..].split_at(packet.len() - RTP_HEADER_LEN - COUNTER_SIZE);
                let counter = u32::from_be_bytes([counter[0], counter[1], counter[2], counter[3]]);
                let nonce = counter_nonce(counter);
                cipher
                    .decrypt(Nonce::from_slice(&nonce), Payload { msg: body, aad: &header })
                    .map_err(|_| CryptoError::DecryptionFailed)
            }
            AeadImpl::XChaCha(cipher) => {
                let nonce = header_nonce(&header);
                cipher
                    .decrypt(XNonce::from_slice(&nonce), &packet[RTP_HEADER_LEN..])
                    .map_err(|_| CryptoError::DecryptionFailed)
            }
        }
    }
}
