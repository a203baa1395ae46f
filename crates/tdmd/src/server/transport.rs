//! Message transports.
//!
//! Both listeners speak the same payload encoding; only the delimiting
//! differs. The raw TCP transport uses the length-prefixed frame codec,
//! the WebSocket transport carries one payload per binary message (the
//! WS frame already delimits). Each transport is split into a source and
//! a sink so the endpoint's reader loop and writer task can own their
//! half independently.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use tdm_protocol::codec::{read_frame, write_frame, CodecError};

use super::ConnectionError;

/// Receiving half of a client transport.
#[async_trait]
pub trait MessageSource: Send {
    /// Receives the next payload. `Ok(None)` means the peer closed the
    /// connection cleanly.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, ConnectionError>;
}

/// Sending half of a client transport. One call transmits one complete
/// message; the caller serializes calls, so writes never interleave.
#[async_trait]
pub trait MessageSink: Send {
    async fn send(&mut self, payload: Vec<u8>) -> Result<(), ConnectionError>;
}

// ============================================================================
// Raw TCP (length-prefixed frames)
// ============================================================================

/// Frame reader over any byte stream.
pub struct FramedSource<R> {
    reader: R,
    max_message_size: u32,
}

impl<R> FramedSource<R> {
    pub fn new(reader: R, max_message_size: u32) -> Self {
        Self {
            reader,
            max_message_size,
        }
    }
}

#[async_trait]
impl<R> MessageSource for FramedSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        match read_frame(&mut self.reader, self.max_message_size).await {
            Ok(payload) => Ok(Some(payload)),
            Err(CodecError::Closed) => Ok(None),
            Err(e) => Err(ConnectionError::Codec(e)),
        }
    }
}

/// Frame writer over any byte stream.
pub struct FramedSink<W> {
    writer: W,
}

impl<W> FramedSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W> MessageSink for FramedSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, payload: Vec<u8>) -> Result<(), ConnectionError> {
        write_frame(&mut self.writer, &payload)
            .await
            .map_err(ConnectionError::Codec)
    }
}

// ============================================================================
// WebSocket (binary messages)
// ============================================================================

/// Reader over an accepted WebSocket stream. Only binary messages are
/// accepted; a text message is a protocol error.
pub struct WsMessageSource {
    stream: SplitStream<WebSocketStream<TcpStream>>,
    max_message_size: u32,
}

impl WsMessageSource {
    pub fn new(stream: SplitStream<WebSocketStream<TcpStream>>, max_message_size: u32) -> Self {
        Self {
            stream,
            max_message_size,
        }
    }
}

#[async_trait]
impl MessageSource for WsMessageSource {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(ConnectionError::WebSocket(e.to_string())),
                Some(Ok(Message::Binary(payload))) => {
                    if payload.len() > self.max_message_size as usize {
                        return Err(ConnectionError::Codec(CodecError::FrameTooLarge {
                            size: payload.len() as u32,
                            max: self.max_message_size,
                        }));
                    }
                    return Ok(Some(payload));
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Control frames are handled by the websocket layer.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Text(_))) => {
                    return Err(ConnectionError::Protocol(
                        "text message on a binary-only websocket".into(),
                    ))
                }
            }
        }
    }
}

/// Writer over an accepted WebSocket stream.
pub struct WsMessageSink {
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
}

impl WsMessageSink {
    pub fn new(sink: SplitSink<WebSocketStream<TcpStream>, Message>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl MessageSink for WsMessageSink {
    async fn send(&mut self, payload: Vec<u8>) -> Result<(), ConnectionError> {
        self.sink
            .send(Message::Binary(payload))
            .await
            .map_err(|e| ConnectionError::WebSocket(e.to_string()))
    }
}
