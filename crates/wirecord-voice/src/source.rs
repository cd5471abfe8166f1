//! Audio source collaborators
//!
//! A source turns a file path into a channel of pre-encoded Opus frames. The
//! channel closes at end of stream or when the token is cancelled.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::VoiceError;

/// Frames buffered between the source and the player
pub const FRAME_BUFFER: usize = 64;

#[async_trait]
pub trait AudioSource: Send + Sync {
    async fn open(&self, path: &str, cancel: CancellationToken) -> Result<mpsc::Receiver<Vec<u8>>, VoiceError>;
}

/// Runs an external encoder and reads its stdout
///
/// The executable is invoked with the configured arguments followed by the
/// path, and must write Opus frames each prefixed by a little-endian `u16`
/// length.
#[derive(Debug, Clone)]
pub struct CommandAudioSource {
    program: String,
    args: Vec<String>,
}

impl CommandAudioSource {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl AudioSource for CommandAudioSource {
    async fn open(&self, path: &str, cancel: CancellationToken) -> Result<mpsc::Receiver<Vec<u8>>, VoiceError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VoiceError::Source(format!("failed to spawn {}: {e}", self.program)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VoiceError::Source("encoder stdout unavailable".to_string()))?;

        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let program = self.program.clone();
        tokio::spawn(async move {
            let frames = pump_frames(stdout, tx, &cancel).await;
            // Dropping the child kills it if it is still running
            drop(child);
            tracing::debug!(program = %program, frames, cancelled = cancel.is_cancelled(), "Audio source finished");
        });

        Ok(rx)
    }
}

/// Forward length-prefixed frames until EOF, cancellation or a closed receiver
async fn pump_frames<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>, cancel: &CancellationToken) -> u64
where
    R: AsyncRead + Unpin,
{
    let mut count = 0;
    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Audio source read failed");
                    break;
                }
            },
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            sent = tx.send(frame) => {
                if sent.is_err() {
                    break;
                }
            }
        }
        count += 1;
    }
    count
}

async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u16_le().await {
        Ok(len) => usize::from(len),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}
