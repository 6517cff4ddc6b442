use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use crate::error::DeliveryError;
use crate::protocol::ServerMessage;

/// Pushes messages to a connection's endpoint and closes transports.
///
/// Implementations should not apply their own deadline; callers wrap each
/// push in the configured push timeout.
#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn push(&self, endpoint: &str, message: &ServerMessage) -> Result<(), DeliveryError>;

    /// Forcibly close the transport behind an endpoint
    async fn terminate(&self, endpoint: &str);
}

struct Outlet {
    sender: mpsc::Sender<ServerMessage>,
    closed: Arc<Notify>,
}

/// Receiving half handed to the task that owns the actual transport
pub struct EndpointHandle {
    pub receiver: mpsc::Receiver<ServerMessage>,
    /// Notified when the gateway wants the transport closed
    pub closed: Arc<Notify>,
}

/// Per-node table of bounded channels, one per locally attached transport
pub struct LocalPushGateway {
    outlets: DashMap<String, Outlet>,
    capacity: usize,
}

impl LocalPushGateway {
    /// `capacity` bounds how many messages may queue for a slow receiver
    /// before pushes to it start waiting
    pub fn new(capacity: usize) -> Self {
        Self {
            outlets: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Register a new endpoint
    pub fn open(&self, endpoint: impl Into<String>) -> EndpointHandle {
        let endpoint = endpoint.into();
        let (sender, receiver) = mpsc::channel(self.capacity);
        let closed = Arc::new(Notify::new());

        self.outlets.insert(
            endpoint.clone(),
            Outlet {
                sender,
                closed: closed.clone(),
            },
        );
        debug!("Opened endpoint {}", endpoint);

        EndpointHandle { receiver, closed }
    }

    /// Unregister an endpoint whose transport has already gone away
    pub fn close(&self, endpoint: &str) {
        if self.outlets.remove(endpoint).is_some() {
            debug!("Closed endpoint {}", endpoint);
        }
    }

    pub fn is_open(&self, endpoint: &str) -> bool {
        self.outlets.contains_key(endpoint)
    }

    pub fn endpoint_count(&self) -> usize {
        self.outlets.len()
    }
}

impl Default for LocalPushGateway {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl PushGateway for LocalPushGateway {
    async fn push(&self, endpoint: &str, message: &ServerMessage) -> Result<(), DeliveryError> {
        // Clone the sender so no map guard is held across the send
        let sender = match self.outlets.get(endpoint) {
            Some(outlet) => outlet.sender.clone(),
            None => return Err(DeliveryError::Gone),
        };

        sender.send(message.clone()).await.map_err(|_| {
            self.outlets.remove(endpoint);
            DeliveryError::Gone
        })
    }

    async fn terminate(&self, endpoint: &str) {
        if let Some((_, outlet)) = self.outlets.remove(endpoint) {
            info!("Terminating transport for endpoint {}", endpoint);
            outlet.closed.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_push_reaches_receiver() {
        let gateway = LocalPushGateway::new(8);
        let mut handle = gateway.open("ep1");

        gateway.push("ep1", &ServerMessage::Ping).await.unwrap();
        assert_eq!(handle.receiver.recv().await, Some(ServerMessage::Ping));
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_gone() {
        let gateway = LocalPushGateway::new(8);
        assert_eq!(
            gateway.push("nowhere", &ServerMessage::Ping).await,
            Err(DeliveryError::Gone)
        );
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_gone() {
        let gateway = LocalPushGateway::new(8);
        drop(gateway.open("ep1"));

        assert_eq!(
            gateway.push("ep1", &ServerMessage::Ping).await,
            Err(DeliveryError::Gone)
        );
        assert!(!gateway.is_open("ep1"));
    }

    #[tokio::test]
    async fn test_full_outlet_blocks() {
        let gateway = LocalPushGateway::new(1);
        let _handle = gateway.open("ep1");

        gateway.push("ep1", &ServerMessage::Ping).await.unwrap();
        let second = timeout(Duration::from_millis(20), gateway.push("ep1", &ServerMessage::Pong)).await;
        assert!(second.is_err(), "push into a full outlet should wait");
    }

    #[tokio::test]
    async fn test_terminate_notifies_transport() {
        let gateway = LocalPushGateway::new(8);
        let handle = gateway.open("ep1");

        gateway.terminate("ep1").await;
        timeout(Duration::from_millis(100), handle.closed.notified())
            .await
            .expect("transport should be told to close");
        assert_eq!(gateway.endpoint_count(), 0);
    }
}
