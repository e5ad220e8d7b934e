//! Room connection management.
//!
//! A [`RoomConnection`] owns one WebSocket transport for one session attempt:
//! it performs the Engine.IO/Socket.IO handshake, joins the room, keeps the
//! heartbeat alive and feeds decoded events into a
//! [`RoomStateStore`](crate::room::RoomStateStore).

mod manager;

pub use manager::{DisconnectHandle, RoomConnection, WsStream};

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::error::ErrorCode;
use crate::protocol::events::ENGINE_PATH;

/// Why a connected session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local user asked to leave.
    Requested,
    /// The server closed the socket or the Socket.IO namespace.
    ServerClosed,
    /// The transport failed (I/O error, protocol violation).
    TransportError(String),
    /// No pong arrived within the server's ping timeout.
    HeartbeatTimeout,
    /// The server removed this client from the room.
    Kicked { reason: Option<String> },
}

impl DisconnectReason {
    /// Whether the session orchestrator should try to reconnect.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Requested | Self::Kicked { .. })
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "disconnect requested"),
            Self::ServerClosed => write!(f, "server closed the connection"),
            Self::TransportError(detail) => write!(f, "transport error: {detail}"),
            Self::HeartbeatTimeout => write!(f, "heartbeat timed out"),
            Self::Kicked { reason: Some(reason) } => write!(f, "kicked: {reason}"),
            Self::Kicked { reason: None } => write!(f, "kicked"),
        }
    }
}

/// Errors establishing a room connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// TCP or WebSocket connection could not be opened.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The server answered but did not let us into the room.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Connecting or joining took longer than allowed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ErrorCode for ConnectError {
    fn code(&self) -> &'static str {
        match self {
            Self::ConnectionRefused(_) => "connection_refused",
            Self::HandshakeRejected(_) => "handshake_rejected",
            Self::Timeout(_) => "connect_timeout",
        }
    }
}

pub type ConnectResult<T> = Result<T, ConnectError>;

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Room short name sent with `room:join`.
    pub room: String,
    /// Budget for the TCP + WebSocket upgrade.
    pub connect_timeout: Duration,
    /// Budget for open packet, namespace connect and join acknowledgement.
    pub handshake_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16, room: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            room: room.into(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// WebSocket URL of the server's Engine.IO endpoint.
    #[must_use]
    pub fn url(&self) -> String {
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("ws://{}:{}{}", host, self.port, ENGINE_PATH)
    }
}
