//! WebSocket transport, room join handshake and the inbound frame pump.

use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::{sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{ConnectError, ConnectResult, ConnectionConfig, DisconnectReason};
use crate::events::{ConnectionEvent, EventEmitter};
use crate::protocol::{decode, decode_join_ack, events, Decoded, JoinAckError, Packet};
use crate::room::{RoomEvent, RoomStateStore};

/// Transport used for real connections.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Heartbeat used when the server never sent an open packet.
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);
const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a requested disconnect waits for `room:leave` to flush.
const LEAVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Ack id used for the `room:join` request.
const JOIN_ACK_ID: u64 = 1;

/// Cloneable handle that ends a running connection.
#[derive(Debug, Clone)]
pub struct DisconnectHandle {
    cancel: CancellationToken,
}

impl DisconnectHandle {
    /// Requests a graceful disconnect. The pump sends `room:leave`, closes
    /// the socket and reports [`DisconnectReason::Requested`].
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }
}

/// A joined room connection, ready to pump events.
pub struct RoomConnection<S = WsStream> {
    ws: S,
    room_name: String,
    ping_interval: Duration,
    ping_timeout: Duration,
    /// Events received between the namespace connect and the join ack.
    pending: Vec<RoomEvent>,
    emitter: Arc<dyn EventEmitter>,
    cancel: CancellationToken,
}

impl RoomConnection<WsStream> {
    /// Opens the WebSocket, completes the handshake and joins the room.
    ///
    /// `cancel` ends the connection once it is running; pass a child of the
    /// session token so shutdown reaches it.
    pub async fn connect(
        config: &ConnectionConfig,
        emitter: Arc<dyn EventEmitter>,
        cancel: CancellationToken,
    ) -> ConnectResult<Self> {
        let url = config.url();
        log::info!("[Connection] Connecting to {}", url);

        let (ws, _response) = timeout(config.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ConnectError::Timeout(config.connect_timeout))?
            .map_err(map_connect_error)?;

        log::debug!("[Connection] WebSocket open, joining room '{}'", config.room);
        Self::handshake(ws, &config.room, config.handshake_timeout, emitter, cancel).await
    }
}

impl<S> RoomConnection<S>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send,
{
    /// Runs the join handshake over an already-open transport.
    ///
    /// Waits for the Engine.IO open packet and the Socket.IO namespace
    /// connect, sends `room:join` and waits for its acknowledgement. Room
    /// events that arrive before the acknowledgement are kept and applied
    /// first when [`run`](Self::run) starts.
    pub async fn handshake(
        ws: S,
        room: &str,
        limit: Duration,
        emitter: Arc<dyn EventEmitter>,
        cancel: CancellationToken,
    ) -> ConnectResult<Self> {
        let mut connection = Self {
            ws,
            room_name: String::new(),
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            pending: Vec::new(),
            emitter,
            cancel,
        };

        timeout(limit, connection.negotiate(room))
            .await
            .map_err(|_| ConnectError::Timeout(limit))??;

        log::info!("[Connection] Joined room '{}'", connection.room_name);
        Ok(connection)
    }

    async fn negotiate(&mut self, room: &str) -> ConnectResult<()> {
        let mut join_sent = false;

        loop {
            let text = match self.ws.next().await {
                Some(Ok(Message::Text(text))) => text.as_str().to_string(),
                Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ConnectError::HandshakeRejected(
                        "server closed the connection during the handshake".into(),
                    ))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ConnectError::HandshakeRejected(e.to_string())),
            };

            match decode(text.as_bytes()) {
                Ok(Decoded::Control(Packet::Open(info))) => {
                    self.ping_interval = Duration::from_millis(info.ping_interval.max(1));
                    self.ping_timeout = Duration::from_millis(info.ping_timeout.max(1));
                    log::debug!(
                        "[Connection] Engine open (sid={}, ping every {:?}, timeout {:?})",
                        info.sid,
                        self.ping_interval,
                        self.ping_timeout
                    );
                }
                Ok(Decoded::Control(Packet::Connect)) if !join_sent => {
                    let join = Packet::Event {
                        id: Some(JOIN_ACK_ID),
                        name: events::JOIN.to_string(),
                        args: vec![Value::String(room.to_string())],
                    };
                    self.send(join)
                        .await
                        .map_err(|e| ConnectError::HandshakeRejected(e.to_string()))?;
                    join_sent = true;
                }
                Ok(Decoded::Control(Packet::Ack { id, args })) if id == JOIN_ACK_ID => {
                    return match decode_join_ack(args) {
                        Ok(RoomEvent::Connected { room_name }) => {
                            self.room_name = room_name.clone();
                            self.pending.insert(0, RoomEvent::Connected { room_name });
                            Ok(())
                        }
                        Ok(other) => Err(ConnectError::HandshakeRejected(format!(
                            "unexpected join result: {}",
                            other.kind()
                        ))),
                        Err(JoinAckError::Refused(message)) => {
                            Err(ConnectError::HandshakeRejected(message))
                        }
                        Err(JoinAckError::Malformed(e)) => {
                            Err(ConnectError::HandshakeRejected(e.to_string()))
                        }
                    };
                }
                Ok(Decoded::Control(Packet::Error(payload))) => {
                    let message = match payload {
                        Value::String(text) => text,
                        other => other.to_string(),
                    };
                    return Err(ConnectError::HandshakeRejected(message));
                }
                Ok(Decoded::Control(Packet::Close | Packet::Disconnect)) => {
                    return Err(ConnectError::HandshakeRejected(
                        "server closed the namespace during the handshake".into(),
                    ));
                }
                Ok(Decoded::Control(Packet::Ping)) => {
                    self.send(Packet::Pong)
                        .await
                        .map_err(|e| ConnectError::HandshakeRejected(e.to_string()))?;
                }
                Ok(Decoded::Control(other)) => {
                    log::debug!("[Connection] Ignoring {:?} during handshake", other);
                }
                Ok(Decoded::Event(event)) => self.pending.push(event),
                Ok(Decoded::ServerError(message)) => {
                    return Err(ConnectError::HandshakeRejected(message));
                }
                Ok(Decoded::Ignored { kind }) => {
                    log::debug!("[Connection] Ignoring unknown event '{}'", kind);
                }
                Err(e) => log::warn!("[Connection] Dropping frame during handshake: {}", e),
            }
        }
    }

    /// Display name of the joined room.
    #[must_use]
    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    /// Returns a handle that can end this connection from another task.
    #[must_use]
    pub fn disconnect_handle(&self) -> DisconnectHandle {
        DisconnectHandle {
            cancel: self.cancel.clone(),
        }
    }

    /// Pumps frames into `store` until the connection ends.
    ///
    /// Malformed frames and events the store rejects are logged and skipped.
    /// On exit the store publishes exactly one terminal `Disconnected` diff
    /// and closes all subscriber streams.
    pub async fn run(mut self, store: &RoomStateStore) -> DisconnectReason {
        let reason = self.pump(store).await;
        log::info!("[Connection] Disconnected from '{}': {}", self.room_name, reason);
        store.terminate(reason.clone()).await;
        reason
    }

    async fn pump(&mut self, store: &RoomStateStore) -> DisconnectReason {
        for event in std::mem::take(&mut self.pending) {
            if let Some(reason) = self.apply(store, event).await {
                return reason;
            }
        }

        let cancel = self.cancel.clone();
        let ping_timeout = self.ping_timeout;
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.ping_interval,
            self.ping_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let frame = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    self.leave().await;
                    return DisconnectReason::Requested;
                }
                _ = wait_for(pong_deadline) => {
                    log::warn!("[Connection] No pong within {:?}", ping_timeout);
                    return DisconnectReason::HeartbeatTimeout;
                }
                _ = heartbeat.tick() => {
                    if pong_deadline.is_none() {
                        if let Err(e) = self.send(Packet::Ping).await {
                            return DisconnectReason::TransportError(e.to_string());
                        }
                        pong_deadline = Some(Instant::now() + ping_timeout);
                    }
                    continue;
                }
                frame = self.ws.next() => frame,
            };

            let bytes = match frame {
                None | Some(Ok(Message::Close(_))) => return DisconnectReason::ServerClosed,
                Some(Err(e)) => return DisconnectReason::TransportError(e.to_string()),
                Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
                Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
                Some(Ok(_)) => continue,
            };

            if let Some(reason) = self.handle_frame(&bytes, store, &mut pong_deadline).await {
                return reason;
            }
        }
    }

    async fn handle_frame(
        &mut self,
        raw: &[u8],
        store: &RoomStateStore,
        pong_deadline: &mut Option<Instant>,
    ) -> Option<DisconnectReason> {
        match decode(raw) {
            Ok(Decoded::Event(event)) => return self.apply(store, event).await,
            Ok(Decoded::Control(packet)) => match packet {
                Packet::Pong => *pong_deadline = None,
                Packet::Ping => {
                    if let Err(e) = self.send(Packet::Pong).await {
                        return Some(DisconnectReason::TransportError(e.to_string()));
                    }
                }
                Packet::Close | Packet::Disconnect => return Some(DisconnectReason::ServerClosed),
                Packet::Error(payload) => {
                    log::warn!("[Connection] Server reported error packet: {}", payload);
                }
                Packet::Unsupported { kind, .. } => {
                    log::debug!("[Connection] Ignoring unsupported {} packet", kind);
                }
                other => log::debug!("[Connection] Ignoring {:?}", other),
            },
            Ok(Decoded::ServerError(message)) => {
                log::warn!("[Connection] Server error: {}", message);
                self.emitter
                    .emit_connection(ConnectionEvent::ServerError { message });
            }
            Ok(Decoded::Ignored { kind }) => {
                log::debug!("[Connection] Ignoring unknown event '{}'", kind);
            }
            Err(e) => log::warn!("[Connection] Dropping malformed frame: {}", e),
        }
        None
    }

    /// Applies one event; returns a reason when the event ends the session.
    async fn apply(&self, store: &RoomStateStore, event: RoomEvent) -> Option<DisconnectReason> {
        let kicked = match &event {
            RoomEvent::Kicked { reason } => Some(reason.clone()),
            _ => None,
        };
        let kind = event.kind();

        match store.apply_and_publish(event).await {
            Ok(diff) => log::debug!("[Connection] Applied {} (seq {})", kind, diff.seq),
            Err(e) => log::warn!("[Connection] Discarding {} event: {}", kind, e),
        }

        kicked.map(|reason| DisconnectReason::Kicked { reason })
    }

    async fn leave(&mut self) {
        let leaving = async {
            self.send(Packet::event(events::LEAVE, Vec::new())).await?;
            self.ws.close().await
        };
        match timeout(LEAVE_TIMEOUT, leaving).await {
            Ok(Ok(())) => log::debug!("[Connection] Left room '{}'", self.room_name),
            Ok(Err(e)) => log::debug!("[Connection] Leave failed: {}", e),
            Err(_) => log::debug!("[Connection] Leave timed out"),
        }
    }

    async fn send(&mut self, packet: Packet) -> Result<(), WsError> {
        self.ws.send(Message::text(packet.encode())).await
    }
}

/// Resolves at `deadline`, or never when there is none.
async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn map_connect_error(err: WsError) -> ConnectError {
    match err {
        WsError::Http(response) => {
            ConnectError::HandshakeRejected(format!("HTTP {}", response.status()))
        }
        other => ConnectError::ConnectionRefused(other.to_string()),
    }
}
