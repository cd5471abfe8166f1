//! Audio player
//!
//! Turns a channel of pre-encoded Opus frames into paced, sequenced,
//! encrypted media packets. One frame goes out per 20 ms tick; a late tick
//! delays the rest of the stream instead of bursting to catch up. Every
//! stream ends with five silence frames, and the speaking flag is raised
//! before the first frame and lowered after the last, with a settle delay
//! around each transition.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use wirecord_session::TransportError;

use crate::crypto::Cipher;
use crate::error::VoiceError;
use crate::rtp::{FrameCounters, FRAME_DURATION, SILENCE_FRAME, TRAILING_SILENCE_FRAMES};
use crate::udp::MediaTransport;

/// Delay around each speaking transition
pub const SPEAKING_SETTLE: Duration = Duration::from_millis(250);

/// Signaling side of the speaking flag
pub trait SpeakingSignal: Send + Sync {
    fn set_speaking(&self, speaking: bool) -> Result<(), VoiceError>;
}

/// Outcome of one playback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    /// Frames handed to the transport, trailing silence included
    pub frames: u64,
    /// Frames dropped because the write queue was full
    pub dropped: u64,
    /// Whether playback was stopped before the source ended
    pub interrupted: bool,
}

/// Paces frames for one voice connection
///
/// The counters persist across streams so sequence numbers stay continuous
/// for the SSRC.
#[derive(Debug, Default)]
pub struct AudioPlayer {
    counters: Mutex<FrameCounters>,
    current: Mutex<Option<CancellationToken>>,
}

impl AudioPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from explicit counter values
    pub fn with_counters(counters: FrameCounters) -> Self {
        Self {
            counters: Mutex::new(counters),
            current: Mutex::new(None),
        }
    }

    pub fn counters(&self) -> FrameCounters {
        *self.counters.lock()
    }

    pub fn is_playing(&self) -> bool {
        self.current.lock().is_some()
    }

    /// Interrupt the current playback
    ///
    /// Trailing silence and the not-speaking signal are still sent.
    pub fn stop(&self) -> bool {
        match self.current.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Play `frames` until the channel closes, `stop` is called, or
    /// `lifetime` ends
    pub async fn play<M, S>(
        &self,
        frames: mpsc::Receiver<Vec<u8>>,
        media: &M,
        speaking: &S,
        lifetime: &CancellationToken,
    ) -> Result<PlaybackStats, VoiceError>
    where
        M: MediaTransport + ?Sized,
        S: SpeakingSignal + ?Sized,
    {
        let cipher = media.cipher().ok_or(VoiceError::NotReady("session description"))?;
        let stop = {
            let mut current = self.current.lock();
            if current.is_some() {
                return Err(VoiceError::AlreadyPlaying);
            }
            let token = lifetime.child_token();
            *current = Some(token.clone());
            token
        };

        let result = self.run(frames, &cipher, media, speaking, lifetime, &stop).await;
        self.current.lock().take();
        result
    }

    async fn run<M, S>(
        &self,
        frames: mpsc::Receiver<Vec<u8>>,
        cipher: &Cipher,
        media: &M,
        speaking: &S,
        lifetime: &CancellationToken,
        stop: &CancellationToken,
    ) -> Result<PlaybackStats, VoiceError>
    where
        M: MediaTransport + ?Sized,
        S: SpeakingSignal + ?Sized,
    {
        speaking.set_speaking(true)?;
        match self.stream(frames, cipher, media, lifetime, stop).await {
            Ok(stats) => {
                settle(lifetime).await?;
                speaking.set_speaking(false)?;
                tracing::debug!(frames = stats.frames, dropped = stats.dropped, interrupted = stats.interrupted, "Playback finished");
                Ok(stats)
            }
            Err(e) => {
                if let Err(lower) = speaking.set_speaking(false) {
                    tracing::debug!(error = %lower, "Could not lower speaking flag");
                }
                tracing::warn!(error = %e, "Playback aborted");
                Err(e)
            }
        }
    }

    /// Settle, the paced frames, then trailing silence
    async fn stream<M>(
        &self,
        mut frames: mpsc::Receiver<Vec<u8>>,
        cipher: &Cipher,
        media: &M,
        lifetime: &CancellationToken,
        stop: &CancellationToken,
    ) -> Result<PlaybackStats, VoiceError>
    where
        M: MediaTransport + ?Sized,
    {
        let mut stats = PlaybackStats::default();
        settle(lifetime).await?;

        let mut ticker = tokio::time::interval(FRAME_DURATION);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(ssrc = media.ssrc(), "Playback started");

        loop {
            let frame = tokio::select! {
                biased;
                () = stop.cancelled() => {
                    stats.interrupted = true;
                    break;
                }
                frame = frames.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            tokio::select! {
                biased;
                () = stop.cancelled() => {
                    stats.interrupted = true;
                    break;
                }
                _ = ticker.tick() => {}
            }
            self.send_frame(&frame, cipher, media, &mut stats)?;
        }
        drop(frames);

        if lifetime.is_cancelled() {
            return Err(VoiceError::Cancelled);
        }

        for _ in 0..TRAILING_SILENCE_FRAMES {
            tokio::select! {
                biased;
                () = lifetime.cancelled() => return Err(VoiceError::Cancelled),
                _ = ticker.tick() => {}
            }
            self.send_frame(&SILENCE_FRAME, cipher, media, &mut stats)?;
        }
        Ok(stats)
    }

    /// Header, seal, send, then advance the counters
    fn send_frame<M>(
        &self,
        frame: &[u8],
        cipher: &Cipher,
        media: &M,
        stats: &mut PlaybackStats,
    ) -> Result<(), VoiceError>
    where
        M: MediaTransport + ?Sized,
    {
        let mut counters = self.counters.lock();
        let header = counters.header(media.ssrc()).encode();
        let packet = cipher.seal(&header, counters.nonce, frame)?;
        let sent = media.send_media(packet, frame.len());
        counters.advance();
        drop(counters);

        match sent {
            Ok(()) => {
                stats.frames += 1;
                Ok(())
            }
            Err(VoiceError::Transport(e @ TransportError::WriteLimitExceeded { .. })) => {
                tracing::warn!(error = %e, "Media frame dropped");
                stats.dropped += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

async fn settle(lifetime: &CancellationToken) -> Result<(), VoiceError> {
    tokio::select! {
        biased;
        () = lifetime.cancelled() => Err(VoiceError::Cancelled),
        () = tokio::time::sleep(SPEAKING_SETTLE) => Ok(()),
    }
}
