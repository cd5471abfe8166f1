//! UDP IP discovery packets
//!
//! The client sends a request carrying its SSRC; the voice server answers
//! with the address and port it saw the request come from.

use bytes::{Buf, BufMut};
use wirecord_session::{Codec, DecodeError};

pub const DISCOVERY_PACKET_LEN: usize = 74;

const ADDRESS_LEN: usize = 64;

/// Length field value: everything after type and length
const BODY_LEN: u16 = 70;

pub const DISCOVERY_REQUEST: u16 = 1;
pub const DISCOVERY_RESPONSE: u16 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPacket {
    pub kind: u16,
    pub ssrc: u32,
    pub address: String,
    pub port: u16,
}

impl DiscoveryPacket {
    /// Probe with an empty address placeholder
    pub fn request(ssrc: u32) -> Self {
        Self {
            kind: DISCOVERY_REQUEST,
            ssrc,
            address: String::new(),
            port: 0,
        }
    }

    pub fn response(ssrc: u32, address: &str, port: u16) -> Self {
        Self {
            kind: DISCOVERY_RESPONSE,
            ssrc,
            address: address.to_string(),
            port,
        }
    }

    pub fn is_response(&self) -> bool {
        self.kind == DISCOVERY_RESPONSE
    }

    pub fn encode(&self) -> [u8; DISCOVERY_PACKET_LEN] {
        let mut out = [0u8; DISCOVERY_PACKET_LEN];
        let mut buf = &mut out[..];
        buf.put_u16(self.kind);
        buf.put_u16(BODY_LEN);
        buf.put_u32(self.ssrc);

        let mut address = [0u8; ADDRESS_LEN];
        let raw = self.address.as_bytes();
        // Keep at least one NUL terminator
        let n = raw.len().min(ADDRESS_LEN - 1);
        address[..n].copy_from_slice(&raw[..n]);
        buf.put_slice(&address);
        buf.put_u16(self.port);
        out
    }

    pub fn decode(mut packet: &[u8]) -> Result<Self, DecodeError> {
        if packet.len() < DISCOVERY_PACKET_LEN {
            return Err(DecodeError::Incomplete);
        }
        let kind = packet.get_u16();
        let _length = packet.get_u16();
        let ssrc = packet.get_u32();

        let field = &packet[..ADDRESS_LEN];
        let end = field.iter().position(|b| *b == 0).unwrap_or(ADDRESS_LEN);
        let address = std::str::from_utf8(&field[..end])
            .map_err(|e| DecodeError::Corrupt(format!("discovery address: {e}")))?
            .to_string();
        packet.advance(ADDRESS_LEN);
        let port = packet.get_u16();

        Ok(Self {
            kind,
            ssrc,
            address,
            port,
        })
    }
}

/// A datagram received on the media socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpPacket {
    Discovery(DiscoveryPacket),
    /// Anything else: inbound media, RTCP
    Other(Vec<u8>),
}

/// Splits discovery replies from other media traffic
///
/// Every datagram is decoded whole; a short discovery reply is corrupt, never
/// the start of a longer one.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpCodec;

impl Codec for UdpCodec {
    type Item = UdpPacket;

    fn decode(&self, buf: &[u8]) -> Result<(UdpPacket, usize), DecodeError> {
        let is_discovery = buf.len() >= 2 && u16::from_be_bytes([buf[0], buf[1]]) == DISCOVERY_RESPONSE;
        if is_discovery {
            let packet = DiscoveryPacket::decode(buf).map_err(|e| match e {
                DecodeError::Incomplete => {
                    DecodeError::Corrupt(format!("discovery reply of {} bytes, expected {DISCOVERY_PACKET_LEN}", buf.len()))
                }
                other => other,
            })?;
            return Ok((UdpPacket::Discovery(packet), buf.len()));
        }
        Ok((UdpPacket::Other(buf.to_vec()), buf.len()))
    }
}
