//! WebSocket implementation of the room's `Connection` trait.
//!
//! The socket is split so a broadcast can write while the session task is
//! parked in `receive`. Liveness probes are WebSocket pings; the matching pong
//! is observed by `receive` and handed to the waiting probe through a `Notify`.
//!
//! Client heartbeats and malformed requests are answered here, on the socket
//! they came from. Heartbeats are still passed up so the room sees the
//! client as active.

use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use lib_common::core::{Connection, ConnectionError, Inbound};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::chat_logic::model::{decode_text, Decoded, ServerMessage};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct WsConnection {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    stream: Mutex<SplitStream<WebSocket>>,
    pong: Notify,
    closed: CancellationToken,
}

impl WsConnection {
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            pong: Notify::new(),
            closed: CancellationToken::new(),
        }
    }

    async fn send_message(&self, message: Message) -> Result<(), ConnectionError> {
        if self.closed.is_cancelled() {
            return Err(ConnectionError::Closed);
        }
        self.sink
            .lock()
            .await
            .send(message)
            .await
            .map_err(|e| ConnectionError::SendFailed(e.to_string()))
    }

    async fn reply(&self, reply: ServerMessage) -> Result<(), ConnectionError> {
        let text = serde_json::to_string(&reply).map_err(|e| ConnectionError::SendFailed(e.to_string()))?;
        self.send_message(Message::Text(text.into())).await
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&self, frame: Bytes) -> Result<(), ConnectionError> {
        let text = String::from_utf8(frame.to_vec())
            .map_err(|e| ConnectionError::SendFailed(format!("frame is not UTF-8: {}", e)))?;
        self.send_message(Message::Text(text.into())).await
    }

    async fn receive(&self) -> Result<Inbound, ConnectionError> {
        let mut stream = self.stream.lock().await;
        loop {
            let next = tokio::select! {
                _ = self.closed.cancelled() => return Err(ConnectionError::Closed),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(Message::Text(text))) => match decode_text(text.as_str()) {
                    Decoded::Room(Inbound::Heartbeat) => {
                        self.reply(ServerMessage::HeartbeatResponse { timestamp: Utc::now() })
                            .await?;
                        return Ok(Inbound::Heartbeat);
                    }
                    Decoded::Room(inbound) => return Ok(inbound),
                    Decoded::Rejected(reason) => {
                        log::debug!("Rejected client frame: {}", reason);
                        self.reply(ServerMessage::error(reason)).await?;
                    }
                    Decoded::Ignored => {}
                },
                Some(Ok(Message::Binary(data))) => return Ok(Inbound::Payload(data)),
                Some(Ok(Message::Pong(_))) => self.pong.notify_waiters(),
                // axum answers pings itself.
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    self.closed.cancel();
                    return Err(ConnectionError::Closed);
                }
                Some(Err(e)) => {
                    self.closed.cancel();
                    return Err(ConnectionError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn probe(&self) -> Result<(), ConnectionError> {
        let pong = self.pong.notified();
        tokio::pin!(pong);
        // Register before pinging so a fast pong is not missed.
        pong.as_mut().enable();

        self.send_message(Message::Ping(Bytes::from_static(b"probe")))
            .await
            .map_err(|e| ConnectionError::ProbeFailed(e.to_string()))?;

        tokio::select! {
            _ = pong => Ok(()),
            _ = self.closed.cancelled() => Err(ConnectionError::Closed),
        }
    }

    async fn close(&self) {
        // Already cancelled when the peer closed first; the sink still needs closing.
        let initiated = !self.closed.is_cancelled();
        self.closed.cancel();
        let goodbye = async {
            let mut sink = self.sink.lock().await;
            if initiated {
                let _ = sink.send(Message::Close(None)).await;
            }
            let _ = sink.close().await;
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, goodbye).await.is_err() {
            log::debug!("Close handshake timed out; dropping the socket.");
        }
    }
}
