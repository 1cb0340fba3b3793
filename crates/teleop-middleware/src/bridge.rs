//! Bus-to-WebSocket diagnostics bridge.
//!
//! [`DiagnosticsBridge`]:
//!
//! 1. **Forwards** any `Serialize` topic from the [`MessageBus`] to connected
//!    WebSocket clients as JSON text frames (`{"topic", "received_at",
//!    "data"}`).  Frames are latest-wins: a client that falls behind skips
//!    frames instead of stalling the bus.
//!
//! 2. **Accepts** control requests from clients.  A text frame holding a
//!    JSON [`ControlRequest`] is routed to the owning control endpoint and the
//!    [`ControlResponse`] is sent back on the same socket.
//!
//! The bridge only handles serialisation and transport; it never interprets
//! the data it routes.

use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use teleop_types::{ControlRequest, ControlResponse, TeleopError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::bus::{MessageBus, Topic};
use crate::topics;

/// Frames buffered per client before it starts skipping.
const CLIENT_BUFFER: usize = 64;

/// Deadline for control requests relayed from a client.
pub const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);

/// One frame sent to WebSocket clients.
#[derive(Serialize)]
pub struct WireFrame<'a, T: Serialize> {
    pub topic: &'a str,
    pub received_at: DateTime<Utc>,
    pub data: &'a T,
}

/// Bridge between the [`MessageBus`] and WebSocket clients.
#[derive(Clone)]
pub struct DiagnosticsBridge {
    bus: MessageBus,
    frames: broadcast::Sender<String>,
}

impl DiagnosticsBridge {
    pub fn new(bus: MessageBus) -> Self {
        let (frames, _) = broadcast::channel(CLIENT_BUFFER);
        Self { bus, frames }
    }

    // -----------------------------------------------------------------------
    // Forwarding
    // -----------------------------------------------------------------------

    /// Start forwarding `topic` to every connected client.
    ///
    /// The forwarding task ends when the bus goes away or `stop` flips to
    /// `true`.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::Channel`] if the topic is bound to another type.
    pub fn forward<T>(
        &self,
        topic: &Topic<T>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, TeleopError>
    where
        T: Serialize + Send + Sync + 'static,
    {
        let mut sub = self.bus.subscribe(topic)?;
        let frames = self.frames.clone();
        let name = topic.name().to_string();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    value = sub.recv() => {
                        let Some(value) = value else { break };
                        let frame = WireFrame {
                            topic: &name,
                            received_at: Utc::now(),
                            data: value.as_ref(),
                        };
                        match serde_json::to_string(&frame) {
                            // No connected clients is fine.
                            Ok(json) => { let _ = frames.send(json); }
                            Err(e) => warn!(topic = %name, error = %e, "diagnostics frame not serialisable"),
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(topic = %name, "diagnostics forwarding stopped");
        }))
    }

    /// Number of WebSocket clients currently connected.
    pub fn client_count(&self) -> usize {
        self.frames.receiver_count()
    }

    // -----------------------------------------------------------------------
    // WebSocket server
    // -----------------------------------------------------------------------

    /// Bind `addr`, announce it in the bus directory as `diagnostics/ws` and
    /// serve clients until `stop` flips to `true`.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::FatalConfig`] if the listener cannot be bound.
    pub async fn run_ws_server(
        self,
        addr: SocketAddr,
        stop: watch::Receiver<bool>,
    ) -> Result<(), TeleopError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TeleopError::FatalConfig(format!("ws bind error on {addr}: {e}")))?;
        self.serve_ws(listener, stop).await
    }

    /// Serve clients on an already bound listener.
    pub async fn serve_ws(
        self,
        listener: TcpListener,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), TeleopError> {
        if let Ok(local) = listener.local_addr() {
            self.bus.announce("diagnostics/ws", format!("ws://{local}"));
            info!(addr = %local, "diagnostics bridge listening");
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let bridge = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = bridge.handle_ws_client(stream, peer).await {
                                error!(peer = %peer, error = %e, "ws client error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "ws accept error"),
                },
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        self.bus.withdraw("diagnostics/ws");
        Ok(())
    }

    async fn handle_ws_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), TeleopError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| TeleopError::Serialization(format!("ws handshake from {peer}: {e}")))?;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let mut frames = self.frames.subscribe();
        let (reply_tx, mut reply_rx) = mpsc::channel::<String>(8);

        loop {
            tokio::select! {
                result = frames.recv() => match result {
                    Ok(json) => {
                        if ws_tx.send(Message::text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(peer = %peer, skipped = n, "ws client lagging; frames skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(reply) = reply_rx.recv() => {
                    if ws_tx.send(Message::text(reply)).await.is_err() {
                        break;
                    }
                }
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(Message::Text(text))) => {
                        self.relay_control(text.as_str(), reply_tx.clone());
                    }
                    _ => {}
                },
            }
        }

        Ok(())
    }

    /// Parse a client text frame as a [`ControlRequest`] and relay it.
    ///
    /// Frames that are not control requests are ignored. The reply (or a
    /// `Rejected` response describing the failure) is pushed to `reply`.
    fn relay_control(&self, text: &str, reply: mpsc::Sender<String>) {
        let Ok(request) = serde_json::from_str::<ControlRequest>(text) else {
            return;
        };
        let Some(endpoint) = topics::control_route(&request) else {
            let response = ControlResponse::Rejected {
                reason: "shutdown is not accepted from diagnostics clients".to_string(),
            };
            if let Ok(json) = serde_json::to_string(&response) {
                let _ = reply.try_send(json);
            }
            return;
        };

        let bus = self.bus.clone();
        tokio::spawn(async move {
            let response = match bus.request(&endpoint, request, CONTROL_TIMEOUT).await {
                Ok(response) => response,
                Err(e) => ControlResponse::Rejected {
                    reason: e.to_string(),
                },
            };
            if let Ok(json) = serde_json::to_string(&response) {
                let _ = reply.send(json).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    async fn connect(
        bus: &MessageBus,
    ) -> (
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
        watch::Sender<bool>,
        DiagnosticsBridge,
    ) {
        let bridge = DiagnosticsBridge::new(bus.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(bridge.clone().serve_ws(listener, stop_rx));
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        (ws, stop_tx, bridge)
    }

    #[tokio::test]
    async fn forwarded_topic_reaches_client_as_json() {
        let bus = MessageBus::new();
        let topic: Topic<Vec<f64>> = Topic::new("diagnostics/arm");
        let (mut ws, stop_tx, bridge) = connect(&bus).await;
        bridge.forward(&topic, stop_tx.subscribe()).unwrap();

        // Keep publishing until the client has been registered and receives one.
        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                bus.publish(&topic, vec![0.5, 1.0]);
                tokio::select! {
                    msg = ws.next() => {
                        if let Some(Ok(Message::Text(text))) = msg {
                            break text.to_string();
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                }
            }
        })
        .await
        .expect("frame must arrive");

        let json: Value = serde_json::from_str(&received).unwrap();
        assert_eq!(json["topic"], "diagnostics/arm");
        assert_eq!(json["data"][1], 1.0);
        let _ = stop_tx.send(true);
    }

    #[tokio::test]
    async fn server_announces_its_address() {
        let bus = MessageBus::new();
        let (_ws, stop_tx, _bridge) = connect(&bus).await;
        let addr = bus.resolve("diagnostics/ws").expect("announced");
        assert!(addr.starts_with("ws://127.0.0.1:"));
        let _ = stop_tx.send(true);
    }

    #[tokio::test]
    async fn control_request_is_relayed_and_answered() {
        let bus = MessageBus::new();
        let mut server = bus.serve(&topics::recorder_control(), 4).unwrap();
        tokio::spawn(async move {
            while let Some(req) = server.next().await {
                let response = match req.payload() {
                    ControlRequest::StartRecording { episode_id } => ControlResponse::Recording {
                        episode_id: episode_id.clone(),
                    },
                    _ => ControlResponse::Ok,
                };
                req.respond(response);
            }
        });

        let (mut ws, stop_tx, _bridge) = connect(&bus).await;
        ws.send(Message::text(r#"{"op":"start_recording","episode_id":"ep-1"}"#))
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(Ok(Message::Text(text))) = ws.next().await {
                    break text.to_string();
                }
            }
        })
        .await
        .expect("reply must arrive");
        let response: ControlResponse = serde_json::from_str(&reply).unwrap();
        assert_eq!(
            response,
            ControlResponse::Recording {
                episode_id: "ep-1".to_string()
            }
        );
        let _ = stop_tx.send(true);
    }
}
