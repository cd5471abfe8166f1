//! RTP media header, per-stream counters and RTCP sender report

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut};

/// Serialized RTP header length
pub const RTP_HEADER_LEN: usize = 12;

/// RTP version 2, no padding, no extension, no CSRCs
pub const RTP_VERSION_FLAGS: u8 = 0x80;

/// Opus payload type
pub const RTP_PAYLOAD_TYPE: u8 = 0x78;

/// Samples per 20 ms Opus frame at 48 kHz
pub const SAMPLES_PER_FRAME: u32 = 960;

/// Opus clock rate
pub const SAMPLE_RATE: u32 = 48_000;

pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Opus encoding of silence
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Silence frames sent after a stream ends
pub const TRAILING_SILENCE_FRAMES: usize = 5;

/// Serialized sender report length
pub const SENDER_REPORT_LEN: usize = 28;

const RTCP_SENDER_REPORT: u8 = 200;

/// Seconds between the NTP epoch (1900) and the unix epoch
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Media header preceding every audio frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn encode(&self) -> [u8; RTP_HEADER_LEN] {
        let mut out = [0u8; RTP_HEADER_LEN];
        let mut buf = &mut out[..];
        buf.put_u8(RTP_VERSION_FLAGS);
        buf.put_u8(RTP_PAYLOAD_TYPE);
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        out
    }

    /// Parse the first twelve bytes of a packet
    pub fn decode(mut packet: &[u8]) -> Option<Self> {
        if packet.len() < RTP_HEADER_LEN || packet[0] & 0xC0 != RTP_VERSION_FLAGS {
            return None;
        }
        packet.advance(2);
        Some(Self {
            sequence: packet.get_u16(),
            timestamp: packet.get_u32(),
            ssrc: packet.get_u32(),
        })
    }
}

/// Per-stream sequence, timestamp and nonce counters
///
/// All three wrap at their bit width.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounters {
    pub sequence: u16,
    pub timestamp: u32,
    pub nonce: u32,
}

impl FrameCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self, ssrc: u32) -> RtpHeader {
        RtpHeader {
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc,
        }
    }

    /// Move past one sent frame
    pub fn advance(&mut self) {
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(SAMPLES_PER_FRAME);
        self.nonce = self.nonce.wrapping_add(1);
    }
}

/// RTCP sender report used as the UDP keepalive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_seconds: u32,
    pub ntp_fraction: u32,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderReport {
    /// Build a report stamped with `now`
    pub fn at(now: SystemTime, ssrc: u32, packet_count: u32, octet_count: u32) -> Self {
        let since_unix = now.duration_since(UNIX_EPOCH).unwrap_or_default();
        let ntp_seconds = low_u32(since_unix.as_secs() + NTP_UNIX_OFFSET);
        let ntp_fraction = low_u32((u64::from(since_unix.subsec_nanos()) << 32) / 1_000_000_000);
        // Wall clock in the 48 kHz media clock
        let millis = u64::try_from(since_unix.as_millis()).unwrap_or(u64::MAX);
        let rtp_timestamp = low_u32(millis.wrapping_mul(u64::from(SAMPLE_RATE / 1000)));

        Self {
            ssrc,
            ntp_seconds,
            ntp_fraction,
            rtp_timestamp,
            packet_count,
            octet_count,
        }
    }

    pub fn encode(&self) -> [u8; SENDER_REPORT_LEN] {
        let mut out = [0u8; SENDER_REPORT_LEN];
        let mut buf = &mut out[..];
        buf.put_u8(RTP_VERSION_FLAGS);
        buf.put_u8(RTCP_SENDER_REPORT);
        // Length in 32-bit words minus one
        buf.put_u16(6);
        buf.put_u32(self.ssrc);
        buf.put_u32(self.ntp_seconds);
        buf.put_u32(self.ntp_fraction);
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.octet_count);
        out
    }
}

/// Low 32 bits; NTP seconds and the RTP clock both wrap at that width
fn low_u32(value: u64) -> u32 {
    u32::try_from(value & u64::from(u32::MAX)).unwrap_or(u32::MAX)
}
