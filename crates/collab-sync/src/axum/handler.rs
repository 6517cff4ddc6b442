use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::SyncState;
use crate::gateway::EndpointHandle;
use crate::protocol::encode_message;
use crate::session::Session;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Serves one authenticated WebSocket: pumps gateway output to the socket and
/// socket input into the engine
pub struct WebSocketHandler {
    socket: WebSocket,
    state: SyncState,
    session: Session,
    outlet: EndpointHandle,
}

impl WebSocketHandler {
    pub fn new(socket: WebSocket, state: SyncState, session: Session, outlet: EndpointHandle) -> Self {
        Self {
            socket,
            state,
            session,
            outlet,
        }
    }

    /// Handle the WebSocket connection until either side closes it or the
    /// gateway terminates it
    pub async fn handle(self) {
        let (mut ws_sender, mut ws_receiver) = self.socket.split();
        let EndpointHandle {
            mut receiver,
            closed,
        } = self.outlet;
        let session = Arc::new(self.session);
        let connection_id = session.connection_id().to_string();

        info!(
            "WebSocket connection established for {} (user {})",
            connection_id,
            session.user_id()
        );

        let mut sender_task = {
            let connection_id = connection_id.clone();
            tokio::spawn(async move {
                while let Some(message) = receiver.recv().await {
                    match encode_message(&message) {
                        Ok(encoded) => {
                            if let Err(e) = ws_sender.send(Message::Text(encoded.into())).await {
                                debug!("Failed to send to {}: {}", connection_id, e);
                                break;
                            }
                        }
                        Err(e) => {
                            error!("Failed to encode message for {}: {}", connection_id, e);
                        }
                    }
                }
                let _ = ws_sender.send(Message::Close(None)).await;
                debug!("Sender task ended for {}", connection_id);
            })
        };

        let mut receiver_task = {
            let engine = self.state.engine().clone();
            let session = session.clone();
            let connection_id = connection_id.clone();

            tokio::spawn(async move {
                while let Some(msg) = ws_receiver.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            engine.handle_message(&session, text.as_str()).await;
                        }
                        Ok(Message::Binary(data)) => {
                            let text = String::from_utf8_lossy(&data);
                            engine.handle_message(&session, &text).await;
                        }
                        Ok(Message::Close(_)) => {
                            info!("Connection {} closed by client", connection_id);
                            break;
                        }
                        // Transport-level ping/pong is answered by axum
                        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                        Err(e) => {
                            warn!("WebSocket error for {}: {}", connection_id, e);
                            break;
                        }
                    }
                }
                debug!("Receiver task ended for {}", connection_id);
            })
        };

        let (completion_reason, terminated) = tokio::select! {
            _ = &mut sender_task => ("sender task completed", false),
            _ = &mut receiver_task => ("receiver task completed", false),
            _ = closed.notified() => ("terminated by server", true),
        };
        if terminated {
            // The outlet is gone, so the sender ends once the queue is drained
            if timeout(FLUSH_TIMEOUT, &mut sender_task).await.is_err() {
                debug!("Sender for {} did not drain in time", connection_id);
            }
        }
        sender_task.abort();
        receiver_task.abort();

        info!(
            "WebSocket connection ending for {} ({})",
            connection_id, completion_reason
        );

        self.state.gateway().close(session.endpoint());
        self.state.engine().disconnect(&session).await;
    }
}
