//! Listeners for client applications.
//!
//! The broker accepts clients on two listeners speaking the same
//! protocol: raw framed TCP, and TCP with a WebSocket upgrade (binary
//! messages). Each accepted connection gets a `ClientEndpoint` with its
//! own reader loop and writer task.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │   BrokerServer   │
//! │ TcpListener (raw)│
//! │ TcpListener (ws) │
//! └───────┬──────────┘
//!         │ accept()
//!         ▼
//! ┌──────────────────┐      ┌──────────────────┐
//! │  ClientEndpoint  │─────▶│  RegistryHandle  │
//! │   (per client)   │      └──────────────────┘
//! └──────────────────┘
//! ```

mod endpoint;
mod transport;

pub use endpoint::{spawn_endpoint, ClientEndpoint, OUTBOUND_QUEUE_DEPTH};
pub use transport::{
    FramedSink, FramedSource, MessageSink, MessageSource, WsMessageSink, WsMessageSource,
};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tdm_protocol::{CodecError, MAX_MESSAGE_SIZE};

use crate::registry::RegistryHandle;
use crate::token::TokenManager;

/// Errors that can occur during connection handling.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed")]
    Closed,

    #[error("missing or invalid access token")]
    Unauthorized,

    #[error("client too slow, outbound queue overflowed")]
    SlowClient,

    #[error("registry is gone")]
    RegistryClosed,
}

/// Errors that can occur in server operations.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error("listener address unavailable: {0}")]
    Addr(String),
}

/// Broker server: both listeners plus the accept loops.
pub struct BrokerServer {
    tcp: TcpListener,
    ws: TcpListener,
    registry: RegistryHandle,
    tokens: Arc<TokenManager>,
    cancel_token: CancellationToken,
    connection_counter: AtomicU64,
}

impl BrokerServer {
    /// Binds both listeners. Pass port 0 to get ephemeral ports (the
    /// bound addresses are available via [`Self::tcp_addr`] and
    /// [`Self::ws_addr`]).
    pub async fn bind(
        tcp_addr: SocketAddr,
        ws_addr: SocketAddr,
        registry: RegistryHandle,
        tokens: Arc<TokenManager>,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let tcp = TcpListener::bind(tcp_addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: tcp_addr,
                error: e.to_string(),
            })?;
        let ws = TcpListener::bind(ws_addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: ws_addr,
                error: e.to_string(),
            })?;
        Ok(Self {
            tcp,
            ws,
            registry,
            tokens,
            cancel_token,
            connection_counter: AtomicU64::new(0),
        })
    }

    /// Bound address of the raw TCP listener.
    pub fn tcp_addr(&self) -> Result<SocketAddr, ServerError> {
        self.tcp
            .local_addr()
            .map_err(|e| ServerError::Addr(e.to_string()))
    }

    /// Bound address of the WebSocket listener.
    pub fn ws_addr(&self) -> Result<SocketAddr, ServerError> {
        self.ws
            .local_addr()
            .map_err(|e| ServerError::Addr(e.to_string()))
    }

    /// Accepts clients until the cancellation token fires.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(
            tcp = %self.tcp_addr()?,
            ws = %self.ws_addr()?,
            "broker listening"
        );

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("server shutdown requested");
                    break;
                }

                result = self.tcp.accept() => match result {
                    Ok((stream, peer)) => self.handle_tcp_connection(stream, peer),
                    Err(e) => error!(error = %e, "failed to accept tcp connection"),
                },

                result = self.ws.accept() => match result {
                    Ok((stream, peer)) => self.handle_ws_connection(stream, peer),
                    Err(e) => error!(error = %e, "failed to accept websocket connection"),
                },
            }
        }

        info!("server stopped");
        Ok(())
    }

    fn next_endpoint_id(&self) -> u64 {
        self.connection_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn handle_tcp_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_endpoint_id();
        let local = peer.ip().is_loopback();
        let (reader, writer) = stream.into_split();
        spawn_endpoint(
            id,
            local,
            FramedSource::new(reader, MAX_MESSAGE_SIZE),
            FramedSink::new(writer),
            self.registry.clone(),
            Arc::clone(&self.tokens),
        );
    }

    fn handle_ws_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_endpoint_id();
        let local = peer.ip().is_loopback();
        let registry = self.registry.clone();
        let tokens = Arc::clone(&self.tokens);

        // The upgrade itself can stall on a misbehaving peer; run it off
        // the accept loop.
        tokio::spawn(async move {
            match accept_async(stream).await {
                Ok(websocket) => {
                    let (sink, source) = websocket.split();
                    spawn_endpoint(
                        id,
                        local,
                        WsMessageSource::new(source, MAX_MESSAGE_SIZE),
                        WsMessageSink::new(sink),
                        registry,
                        tokens,
                    );
                }
                Err(e) => {
                    warn!(endpoint = id, peer = %peer, error = %e, "websocket upgrade failed");
                }
            }
        });
    }
}
