//! Transport session
//!
//! Owns one physical connection (websocket or UDP socket) and runs four
//! cooperating tasks over it:
//!
//! - read: pulls raw frames off the connection
//! - listen: reassembles and decodes payloads, hands them to the owner
//! - write: drains the bounded outbound queue
//! - error: logs failures and routes close codes and errors to the owner's
//!   recovery callbacks
//!
//! `exit` cancels the transport's lifetime token, which every task observes.

mod error;
mod link;
mod outbox;

pub use error::{ErrorKind, TransportError};
pub use outbox::{Frame, Outbox, DEFAULT_WRITE_LIMIT};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wirecord_common::Classify;

use crate::codec::{Codec, DecodeError};
use link::{Inbound, Reader, Writer};

/// Depth of the read -> listen handoff
const READ_BUFFER: usize = 256;

/// Callback for a registered close code: `(code, reason)`
pub type CloseHandler = Arc<dyn Fn(u16, &str) + Send + Sync>;

/// Callback for a registered error kind
pub type ErrorHandler = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Receives every decoded payload
pub type Listener<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Configures and dials a [`Transport`]
pub struct TransportBuilder<C: Codec> {
    name: &'static str,
    codec: C,
    write_limit: usize,
    lifetime: CancellationToken,
    close_handlers: HashMap<u16, CloseHandler>,
    error_handlers: HashMap<ErrorKind, ErrorHandler>,
}

impl<C: Codec> TransportBuilder<C> {
    pub fn new(name: &'static str, codec: C) -> Self {
        Self {
            name,
            codec,
            write_limit: DEFAULT_WRITE_LIMIT,
            lifetime: CancellationToken::new(),
            close_handlers: HashMap::new(),
            error_handlers: HashMap::new(),
        }
    }

    /// Outbound queue depth
    pub fn write_limit(mut self, limit: usize) -> Self {
        self.write_limit = limit;
        self
    }

    /// Tie the transport's lifetime to an owner token
    ///
    /// The transport runs on a child token: cancelling the owner stops the
    /// transport, exiting the transport leaves the owner alone.
    pub fn lifetime(mut self, owner: &CancellationToken) -> Self {
        self.lifetime = owner.child_token();
        self
    }

    /// Register a callback for a close code
    pub fn on_close<F>(mut self, code: u16, handler: F) -> Self
    where
        F: Fn(u16, &str) + Send + Sync + 'static,
    {
        self.close_handlers.insert(code, Arc::new(handler));
        self
    }

    /// Register one callback for several close codes
    pub fn on_close_codes<F>(mut self, codes: &[u16], handler: F) -> Self
    where
        F: Fn(u16, &str) + Send + Sync + 'static,
    {
        let handler: CloseHandler = Arc::new(handler);
        for code in codes {
            self.close_handlers.insert(*code, Arc::clone(&handler));
        }
        self
    }

    /// Register a callback for an error kind
    pub fn on_error<F>(mut self, kind: ErrorKind, handler: F) -> Self
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        self.error_handlers.insert(kind, Arc::new(handler));
        self
    }

    /// Register one callback for several error kinds
    pub fn on_errors<F>(mut self, kinds: &[ErrorKind], handler: F) -> Self
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        let handler: ErrorHandler = Arc::new(handler);
        for kind in kinds {
            self.error_handlers.insert(*kind, Arc::clone(&handler));
        }
        self
    }

    /// Dial a websocket and start the loops
    pub async fn connect_websocket(
        self,
        url: &str,
        listener: Listener<C::Item>,
    ) -> Result<Transport, TransportError> {
        let (reader, writer) = link::dial_websocket(url).await?;
        tracing::info!(transport = self.name, url = %url, "Websocket connected");
        Ok(self.start(reader, writer, listener))
    }

    /// Bind a UDP socket to `address` and start the loops
    pub async fn connect_datagram(
        self,
        address: &str,
        listener: Listener<C::Item>,
    ) -> Result<Transport, TransportError> {
        let (reader, writer) = link::dial_datagram(address).await?;
        tracing::info!(transport = self.name, address = %address, "Datagram socket connected");
        Ok(self.start(reader, writer, listener))
    }

    fn start(self, reader: Reader, writer: Writer, listener: Listener<C::Item>) -> Transport {
        let (outbox, outbound) = Outbox::new(self.write_limit);
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::channel(READ_BUFFER);

        let inner = Arc::new(Inner {
            name: self.name,
            datagram: reader.is_datagram(),
            lifetime: self.lifetime,
            outbox,
            errors: errors_tx,
            exited: AtomicBool::new(false),
            graceful: AtomicBool::new(false),
            close_handlers: self.close_handlers,
            error_handlers: self.error_handlers,
            writer_task: Mutex::new(None),
        });

        tokio::spawn(read_loop(Arc::clone(&inner), reader, data_tx));
        tokio::spawn(listen_loop(Arc::clone(&inner), data_rx, self.codec, listener));
        tokio::spawn(error_loop(Arc::clone(&inner), errors_rx));
        let writer_task = tokio::spawn(write_loop(Arc::clone(&inner), writer, outbound));
        *inner.writer_task.lock() = Some(writer_task);

        Transport { inner }
    }
}

struct Inner {
    name: &'static str,
    datagram: bool,
    lifetime: CancellationToken,
    outbox: Outbox,
    errors: mpsc::UnboundedSender<TransportError>,
    exited: AtomicBool,
    graceful: AtomicBool,
    close_handlers: HashMap<u16, CloseHandler>,
    error_handlers: HashMap<ErrorKind, ErrorHandler>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn report(&self, error: TransportError) {
        // The error loop is gone once the transport exits
        let _ = self.errors.send(error);
    }

    fn route(&self, error: &TransportError) {
        if self.exited.load(Ordering::Acquire) {
            tracing::debug!(transport = self.name, error = %error, "Error after exit ignored");
            return;
        }

        if let TransportError::Closed { code, reason } = error {
            match self.close_handlers.get(code) {
                Some(handler) => {
                    tracing::info!(transport = self.name, code, reason = %reason, "Connection closed");
                    handler(*code, reason);
                }
                None => {
                    tracing::warn!(transport = self.name, code, reason = %reason, "Connection closed with unhandled code");
                }
            }
            return;
        }

        match self.error_handlers.get(&error.kind()) {
            Some(handler) => {
                tracing::warn!(transport = self.name, error = %error, class = %error.class(), "Transport error");
                handler(error);
            }
            None => {
                tracing::warn!(transport = self.name, error = %error, class = %error.class(), "Unhandled transport error");
            }
        }
    }

    /// Whether an error means the underlying connection is unusable
    fn is_fatal(&self, error: &TransportError) -> bool {
        match error {
            TransportError::WriteLimitExceeded { .. }
            | TransportError::Decode(_)
            | TransportError::Shutdown => false,
            TransportError::Io(_) => !self.datagram,
            _ => true,
        }
    }

    fn exit(&self, graceful: bool) -> bool {
        if self.exited.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.graceful.store(graceful, Ordering::Release);
        self.lifetime.cancel();
        tracing::info!(transport = self.name, graceful, "Transport exiting");
        true
    }
}

/// Handle to a running transport
///
/// Cheap to clone; every clone controls the same connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.inner.name)
            .field("exited", &self.is_closed())
            .field("queued", &self.inner.outbox.queued())
            .finish()
    }
}

impl Transport {
    pub fn builder<C: Codec>(name: &'static str, codec: C) -> TransportBuilder<C> {
        TransportBuilder::new(name, codec)
    }

    /// Enqueue an outbound frame
    ///
    /// Fails immediately when the queue is full; the failure is also routed
    /// through the error loop.
    pub fn write(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Shutdown);
        }
        self.inner.outbox.push(frame).inspect_err(|e| {
            if matches!(e, TransportError::WriteLimitExceeded { .. }) {
                self.inner.report(e.clone());
            }
        })
    }

    /// Serialize `payload` as JSON and enqueue it as a text frame
    pub fn write_json<T: Serialize>(&self, payload: &T) -> Result<(), TransportError> {
        let text = serde_json::to_string(payload).map_err(|e| TransportError::Protocol(e.to_string()))?;
        tracing::trace!(transport = self.inner.name, payload = %text, "Queue frame");
        self.write(Frame::Text(text))
    }

    /// Tear the transport down
    ///
    /// Idempotent; returns `true` for the call that performed the exit. A
    /// graceful exit flushes queued frames and sends a normal close.
    pub fn exit(&self, graceful: bool) -> bool {
        self.inner.exit(graceful)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.exited.load(Ordering::Acquire) || self.inner.lifetime.is_cancelled()
    }

    /// Resolves once the transport's lifetime ends
    pub async fn closed(&self) {
        self.inner.lifetime.cancelled().await;
    }

    /// Wait for the write loop to finish flushing after an exit
    pub async fn join(&self) {
        let task = self.inner.writer_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }
}

async fn read_loop(inner: Arc<Inner>, mut reader: Reader, data: mpsc::Sender<Bytes>) {
    loop {
        let next = tokio::select! {
            biased;
            () = inner.lifetime.cancelled() => break,
            next = reader.next() => next,
        };

        match next {
            Ok(Inbound::Data(bytes)) => {
                tracing::trace!(transport = inner.name, len = bytes.len(), "Read frame");
                if data.send(bytes).await.is_err() {
                    break;
                }
            }
            Ok(Inbound::Ignore) => {}
            Ok(Inbound::Closed { code, reason }) => {
                inner.report(TransportError::Closed { code, reason });
                break;
            }
            Err(e) => {
                // A connected UDP socket surfaces ICMP errors on recv; keep reading
                let fatal = inner.is_fatal(&e);
                inner.report(e);
                if fatal {
                    break;
                }
            }
        }
    }
    tracing::debug!(transport = inner.name, "Read loop stopped");
}

async fn listen_loop<C: Codec>(
    inner: Arc<Inner>,
    mut data: mpsc::Receiver<Bytes>,
    codec: C,
    listener: Listener<C::Item>,
) {
    let mut buffer = BytesMut::new();

    loop {
        let chunk = tokio::select! {
            biased;
            () = inner.lifetime.cancelled() => break,
            chunk = data.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };
        buffer.extend_from_slice(&chunk);

        while !buffer.is_empty() {
            match codec.decode(&buffer) {
                Ok((item, consumed)) => {
                    buffer.advance(consumed.min(buffer.len()));
                    listener(item);
                }
                // Keep the partial payload for the next read
                Err(DecodeError::Incomplete) => break,
                Err(DecodeError::Corrupt(reason)) => {
                    buffer.clear();
                    inner.report(TransportError::Decode(reason));
                    break;
                }
            }
        }
    }
    tracing::debug!(transport = inner.name, "Listen loop stopped");
}

async fn write_loop(inner: Arc<Inner>, mut writer: Writer, mut outbound: mpsc::Receiver<Frame>) {
    loop {
        let frame = tokio::select! {
            biased;
            () = inner.lifetime.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if let Err(e) = writer.send(frame).await {
            let fatal = inner.is_fatal(&e);
            inner.report(e);
            if fatal {
                return;
            }
        }
    }

    let graceful = inner.graceful.load(Ordering::Acquire);
    if graceful {
        while let Ok(frame) = outbound.try_recv() {
            if writer.send(frame).await.is_err() {
                break;
            }
        }
    }
    outbound.close();
    writer.close(graceful).await;
    tracing::debug!(transport = inner.name, graceful, "Write loop stopped");
}

async fn error_loop(inner: Arc<Inner>, mut errors: mpsc::UnboundedReceiver<TransportError>) {
    loop {
        let error = tokio::select! {
            biased;
            () = inner.lifetime.cancelled() => break,
            error = errors.recv() => match error {
                Some(error) => error,
                None => break,
            },
        };

        inner.route(&error);

        // The connection is gone; release it unless a handler already did
        if inner.is_fatal(&error) {
            inner.exit(false);
        }
    }
    tracing::debug!(transport = inner.name, "Error loop stopped");
}
