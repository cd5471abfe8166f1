//! Bounded outbound queue
//!
//! Writes never block: a full queue fails the write immediately.

use tokio::sync::mpsc;

use super::error::TransportError;

/// Default outbound queue depth
pub const DEFAULT_WRITE_LIMIT: usize = 4096;

/// An outbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sending side of the write queue
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Frame>,
    limit: usize,
}

impl Outbox {
    /// Create a queue holding at most `limit` frames
    pub fn new(limit: usize) -> (Self, mpsc::Receiver<Frame>) {
        let limit = limit.max(1);
        let (tx, rx) = mpsc::channel(limit);
        (Self { tx, limit }, rx)
    }

    /// Enqueue a frame without waiting
    pub fn push(&self, frame: Frame) -> Result<(), TransportError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TransportError::WriteLimitExceeded { limit: self.limit }
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::Shutdown,
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Frames currently queued
    pub fn queued(&self) -> usize {
        self.limit - self.tx.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_queue_fails_fast() {
        let (outbox, _rx) = Outbox::new(DEFAULT_WRITE_LIMIT);
        for i in 0..DEFAULT_WRITE_LIMIT {
            outbox.push(Frame::Text(i.to_string())).unwrap();
        }
        assert_eq!(outbox.queued(), DEFAULT_WRITE_LIMIT);

        let err = outbox.push(Frame::Text("overflow".into())).unwrap_err();
        assert_eq!(err, TransportError::WriteLimitExceeded { limit: 4096 });
    }

    #[tokio::test]
    async fn test_draining_frees_capacity() {
        let (outbox, mut rx) = Outbox::new(1);
        outbox.push(Frame::Binary(vec![1])).unwrap();
        assert!(outbox.push(Frame::Binary(vec![2])).is_err());

        assert_eq!(rx.recv().await, Some(Frame::Binary(vec![1])));
        outbox.push(Frame::Binary(vec![2])).unwrap();
    }

    #[tokio::test]
    async fn test_closed_queue_reports_shutdown() {
        let (outbox, rx) = Outbox::new(4);
        drop(rx);
        assert_eq!(outbox.push(Frame::Text("x".into())), Err(TransportError::Shutdown));
    }
}
