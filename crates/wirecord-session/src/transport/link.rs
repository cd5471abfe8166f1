//! The physical connection, split into read and write halves

use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::error::TransportError;
use super::outbox::Frame;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Largest datagram the read half accepts
const DATAGRAM_BUFFER: usize = 2048;

/// What the read half pulled off the wire
#[derive(Debug)]
pub(crate) enum Inbound {
    Data(Bytes),
    Closed { code: u16, reason: String },
    /// Control traffic (ping/pong) handled by the protocol library
    Ignore,
}

pub(crate) enum Reader {
    Ws(SplitStream<WsStream>),
    Udp {
        socket: Arc<UdpSocket>,
        buf: Box<[u8]>,
    },
}

pub(crate) enum Writer {
    Ws(SplitSink<WsStream, Message>),
    Udp(Arc<UdpSocket>),
}

/// Dial a websocket and split it
pub(crate) async fn dial_websocket(url: &str) -> Result<(Reader, Writer), TransportError> {
    let (stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| TransportError::connect(url, e))?;
    let (sink, stream) = stream.split();
    Ok((Reader::Ws(stream), Writer::Ws(sink)))
}

/// Bind a local UDP socket and connect it to `address`
pub(crate) async fn dial_datagram(address: &str) -> Result<(Reader, Writer), TransportError> {
    let remote = tokio::net::lookup_host(address)
        .await
        .map_err(|e| TransportError::connect(address, e))?
        .next()
        .ok_or_else(|| TransportError::connect(address, "no address resolved"))?;

    let local = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(local)
        .await
        .map_err(|e| TransportError::connect(address, e))?;
    socket
        .connect(remote)
        .await
        .map_err(|e| TransportError::connect(address, e))?;

    let socket = Arc::new(socket);
    Ok((
        Reader::Udp {
            socket: Arc::clone(&socket),
            buf: vec![0u8; DATAGRAM_BUFFER].into_boxed_slice(),
        },
        Writer::Udp(socket),
    ))
}

impl Reader {
    pub(crate) fn is_datagram(&self) -> bool {
        matches!(self, Self::Udp { .. })
    }

    pub(crate) async fn next(&mut self) -> Result<Inbound, TransportError> {
        match self {
            Self::Ws(stream) => match stream.next().await {
                None => Err(TransportError::Eof),
                Some(Err(e)) => Err(e.into()),
                Some(Ok(message)) => Ok(match message {
                    Message::Text(text) => Inbound::Data(Bytes::from(text)),
                    Message::Binary(data) => Inbound::Data(Bytes::from(data)),
                    Message::Close(Some(frame)) => Inbound::Closed {
                        code: u16::from(frame.code),
                        reason: frame.reason.into_owned(),
                    },
                    // A close without a status is treated like a dropped stream
                    Message::Close(None) => return Err(TransportError::Eof),
                    _ => Inbound::Ignore,
                }),
            },
            Self::Udp { socket, buf } => {
                let n = socket.recv(buf).await?;
                Ok(Inbound::Data(Bytes::copy_from_slice(&buf[..n])))
            }
        }
    }
}

impl Writer {
    pub(crate) async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        match self {
            Self::Ws(sink) => {
                let message = match frame {
                    Frame::Text(text) => Message::Text(text),
                    Frame::Binary(data) => Message::Binary(data),
                };
                sink.send(message).await?;
            }
            Self::Udp(socket) => {
                let data = match frame {
                    Frame::Text(text) => text.into_bytes(),
                    Frame::Binary(data) => data,
                };
                socket.send(&data).await?;
            }
        }
        Ok(())
    }

    /// Graceful close sends a normal-closure frame; otherwise the socket is dropped
    pub(crate) async fn close(&mut self, graceful: bool) {
        if let Self::Ws(sink) = self {
            if graceful {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    tracing::debug!(error = %e, "Close frame not delivered");
                }
                let _ = sink.close().await;
            }
        }
    }
}
