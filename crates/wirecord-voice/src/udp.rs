//! UDP media session
//!
//! Dials the voice server's media address, learns the external address via
//! IP discovery, sends a sender report every five seconds as keepalive, and
//! carries encrypted media packets for the audio player. Owns the SSRC and
//! the negotiated cipher.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use wirecord_session::transport::Listener;
use wirecord_session::{Frame, GateSet, Transport, TransportError};

use crate::crypto::{Cipher, EncryptionMode};
use crate::discovery::{DiscoveryPacket, UdpCodec, UdpPacket};
use crate::error::VoiceError;
use crate::rtp::SenderReport;

pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

const DISCOVERY_GATE: &str = "discovery";

/// Outbound media path used by the audio player
pub trait MediaTransport: Send + Sync {
    fn ssrc(&self) -> u32;

    /// The negotiated cipher, once a session description arrived
    fn cipher(&self) -> Option<Arc<Cipher>>;

    /// Queue one encrypted packet; `payload_len` is the plaintext frame size
    fn send_media(&self, packet: Vec<u8>, payload_len: usize) -> Result<(), VoiceError>;
}

/// Handle to one UDP media connection; clones share it
#[derive(Clone)]
pub struct UdpMediaSession {
    inner: Arc<UdpInner>,
}

struct UdpInner {
    ssrc: u32,
    write_limit: usize,
    lifetime: CancellationToken,
    transport: Mutex<Option<Transport>>,
    gates: GateSet,
    external: Mutex<Option<(String, u16)>>,
    cipher: RwLock<Option<Arc<Cipher>>>,
    packets: AtomicU32,
    octets: AtomicU32,
    keepalive: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for UdpMediaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpMediaSession")
            .field("ssrc", &self.inner.ssrc)
            .field("external", &*self.inner.external.lock())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl UdpMediaSession {
    /// A media session for `ssrc` that ends with `owner`
    pub fn new(ssrc: u32, owner: &CancellationToken, write_limit: usize) -> Self {
        Self {
            inner: Arc::new(UdpInner {
                ssrc,
                write_limit,
                lifetime: owner.child_token(),
                transport: Mutex::new(None),
                gates: GateSet::new(),
                external: Mutex::new(None),
                cipher: RwLock::new(None),
                packets: AtomicU32::new(0),
                octets: AtomicU32::new(0),
                keepalive: Mutex::new(None),
            }),
        }
    }

    /// Connect the datagram transport to the voice server's media address
    pub async fn dial(&self, address: &str) -> Result<(), VoiceError> {
        let weak: Weak<UdpInner> = Arc::downgrade(&self.inner);
        let listener: Listener<UdpPacket> = Arc::new(move |packet: UdpPacket| {
            if let Some(inner) = weak.upgrade() {
                inner.on_packet(packet);
            }
        });

        let transport = Transport::builder("voice-udp", UdpCodec)
            .write_limit(self.inner.write_limit)
            .lifetime(&self.inner.lifetime)
            .connect_datagram(address, listener)
            .await?;

        if let Some(previous) = self.inner.transport.lock().replace(transport) {
            previous.exit(false);
        }
        Ok(())
    }

    /// Run IP discovery and return the external address and port
    pub async fn discover(&self) -> Result<(String, u16), VoiceError> {
        let gate = self.inner.gates.reset(DISCOVERY_GATE);
        let probe = DiscoveryPacket::request(self.inner.ssrc).encode();
        self.inner.write(Frame::Binary(probe.to_vec()))?;
        tracing::debug!(ssrc = self.inner.ssrc, "Sent IP discovery probe");

        gate.wait_timeout(&self.inner.lifetime, DISCOVERY_TIMEOUT)
            .await
            .map_err(|e| VoiceError::from_gate(e, VoiceError::DiscoveryTimeout))?;

        self.external_address().ok_or(VoiceError::NotReady("discovery"))
    }

    pub fn is_discovered(&self) -> bool {
        self.inner.gates.is_closed(DISCOVERY_GATE)
    }

    pub fn external_address(&self) -> Option<(String, u16)> {
        self.inner.external.lock().clone()
    }

    /// Install the negotiated cipher
    pub fn set_session(&self, mode: EncryptionMode, key: &[u8]) -> Result<(), VoiceError> {
        let cipher = Cipher::new(mode, key)?;
        *self.inner.cipher.write() = Some(Arc::new(cipher));
        tracing::info!(ssrc = self.inner.ssrc, mode = %mode, "Media encryption negotiated");
        Ok(())
    }

    /// Start the periodic sender-report keepalive
    pub fn start_keepalive(&self) {
        self.spawn_keepalive(KEEPALIVE_INTERVAL);
    }

    pub(crate) fn spawn_keepalive(&self, period: Duration) {
        let token = self.inner.lifetime.child_token();
        if let Some(previous) = self.inner.keepalive.lock().replace(token.clone()) {
            previous.cancel();
        }
        tokio::spawn(keepalive_loop(Arc::clone(&self.inner), period, token));
    }

    /// Packets and payload octets sent since the keepalive started
    pub fn stats(&self) -> (u32, u32) {
        (
            self.inner.packets.load(Ordering::Acquire),
            self.inner.octets.load(Ordering::Acquire),
        )
    }

    pub fn exit(&self) {
        self.inner.lifetime.cancel();
        if let Some(transport) = self.inner.transport.lock().take() {
            transport.exit(false);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lifetime.is_cancelled()
    }
}

impl MediaTransport for UdpMediaSession {
    fn ssrc(&self) -> u32 {
        self.inner.ssrc
    }

    fn cipher(&self) -> Option<Arc<Cipher>> {
        self.inner.cipher.read().clone()
    }

    fn send_media(&self, packet: Vec<u8>, payload_len: usize) -> Result<(), VoiceError> {
        self.inner.write(Frame::Binary(packet))?;
        self.inner.packets.fetch_add(1, Ordering::AcqRel);
        self.inner
            .octets
            .fetch_add(u32::try_from(payload_len).unwrap_or(u32::MAX), Ordering::AcqRel);
        Ok(())
    }
}

impl UdpInner {
    fn write(&self, frame: Frame) -> Result<(), TransportError> {
        let transport = self.transport.lock().clone();
        match transport {
            Some(transport) => transport.write(frame),
            None => Err(TransportError::Shutdown),
        }
    }

    fn on_packet(&self, packet: UdpPacket) {
        match packet {
            UdpPacket::Discovery(reply) if reply.is_response() => {
                if reply.ssrc != self.ssrc {
                    tracing::debug!(expected = self.ssrc, got = reply.ssrc, "Discovery reply for another SSRC");
                    return;
                }
                tracing::info!(address = %reply.address, port = reply.port, "IP discovery complete");
                *self.external.lock() = Some((reply.address, reply.port));
                if !self.gates.close(DISCOVERY_GATE) {
                    tracing::debug!("Duplicate discovery reply");
                }
            }
            UdpPacket::Discovery(_) => {}
            UdpPacket::Other(data) => {
                tracing::trace!(len = data.len(), "Inbound media packet ignored");
            }
        }
    }
}

async fn keepalive_loop(inner: Arc<UdpInner>, period: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let report = SenderReport::at(
            SystemTime::now(),
            inner.ssrc,
            inner.packets.load(Ordering::Acquire),
            inner.octets.load(Ordering::Acquire),
        );
        match inner.write(Frame::Binary(report.encode().to_vec())) {
            Ok(()) => tracing::trace!(ssrc = inner.ssrc, packets = report.packet_count, "Sent keepalive report"),
            Err(e @ TransportError::WriteLimitExceeded { .. }) => {
                tracing::warn!(error = %e, "Keepalive report dropped");
            }
            Err(e) => {
                tracing::debug!(error = %e, "Keepalive stopped");
                break;
            }
        }
    }

    // A new loop starts a new set of counters
    inner.packets.store(0, Ordering::Release);
    inner.octets.store(0, Ordering::Release);
}
