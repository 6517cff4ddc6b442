//! Fan-out of one message to every connection in a document room.
//!
//! Room membership is the union of two sources: the registry's by-document
//! index, and the connections of every user with access to the document,
//! filtered to that document. The second source covers index lag. Each
//! recipient is delivered to independently; one failure never stops the rest.

use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::access::AccessResolver;
use crate::error::DeliveryError;
use crate::gateway::PushGateway;
use crate::protocol::ServerMessage;
use crate::registry::{Connection, ConnectionRegistry};

/// Summary of one fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub recipients: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Recipients dropped from the registry as gone or stale
    pub removed: usize,
}

enum Outcome {
    Delivered,
    Removed,
    Failed,
}

pub struct Broadcaster {
    registry: Arc<dyn ConnectionRegistry>,
    access: Arc<dyn AccessResolver>,
    gateway: Arc<dyn PushGateway>,
    push_timeout: Duration,
}

impl Broadcaster {
    pub fn new(
        registry: Arc<dyn ConnectionRegistry>,
        access: Arc<dyn AccessResolver>,
        gateway: Arc<dyn PushGateway>,
        push_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            access,
            gateway,
            push_timeout,
        }
    }

    /// Connections currently attached to a document, de-duplicated by id
    pub async fn room_members(&self, document_id: &str) -> Vec<Connection> {
        let mut members: BTreeMap<String, Connection> = BTreeMap::new();

        match self.registry.by_document(document_id).await {
            Ok(primary) => {
                for conn in primary {
                    members.insert(conn.connection_id.clone(), conn);
                }
            }
            Err(e) => warn!("Room index lookup failed for {}: {}", document_id, e),
        }

        let users = match self.access.document_members(document_id).await {
            Ok(users) => users,
            Err(e) => {
                warn!("Member lookup failed for {}: {}", document_id, e);
                Vec::new()
            }
        };

        let per_user = join_all(users.iter().map(|user| self.registry.by_user(user))).await;
        for result in per_user {
            match result {
                Ok(conns) => {
                    for conn in conns.into_iter().filter(|c| c.is_in(document_id)) {
                        members.entry(conn.connection_id.clone()).or_insert(conn);
                    }
                }
                Err(e) => debug!("User connection lookup failed: {}", e),
            }
        }

        members.into_values().collect()
    }

    /// Deliver `message` to every member of the room except `exclude`
    pub async fn broadcast(
        &self,
        document_id: &str,
        message: &ServerMessage,
        exclude: Option<&str>,
    ) -> BroadcastReport {
        let recipients: Vec<Connection> = self
            .room_members(document_id)
            .await
            .into_iter()
            .filter(|c| Some(c.connection_id.as_str()) != exclude)
            .collect();

        let outcomes = join_all(recipients.iter().map(|c| self.deliver_isolated(c, message))).await;

        let mut report = BroadcastReport {
            recipients: recipients.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                Outcome::Delivered => report.delivered += 1,
                Outcome::Removed => {
                    report.failed += 1;
                    report.removed += 1;
                }
                Outcome::Failed => report.failed += 1,
            }
        }

        debug!(
            "Broadcast to document {}: {}/{} delivered",
            document_id, report.delivered, report.recipients
        );
        report
    }

    /// One push bounded by the push timeout
    pub async fn deliver(
        &self,
        connection: &Connection,
        message: &ServerMessage,
    ) -> Result<(), DeliveryError> {
        match tokio::time::timeout(
            self.push_timeout,
            self.gateway.push(&connection.endpoint, message),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout),
        }
    }

    /// Deliver and clean up after a failure; never returns an error
    async fn deliver_isolated(&self, connection: &Connection, message: &ServerMessage) -> Outcome {
        match self.deliver(connection, message).await {
            Ok(()) => Outcome::Delivered,
            Err(DeliveryError::Gone) => {
                info!(
                    "Connection {} is gone, removing from registry",
                    connection.connection_id
                );
                self.forget(connection).await;
                Outcome::Removed
            }
            Err(DeliveryError::Timeout) => {
                // Abandoned clients time out routinely; not a fault
                debug!(
                    "Push to connection {} timed out, treating as stale",
                    connection.connection_id
                );
                self.gateway.terminate(&connection.endpoint).await;
                self.forget(connection).await;
                Outcome::Removed
            }
            Err(DeliveryError::Unavailable(reason)) => {
                warn!(
                    "Push to connection {} failed: {}",
                    connection.connection_id, reason
                );
                Outcome::Failed
            }
        }
    }

    async fn forget(&self, connection: &Connection) {
        if let Err(e) = self.registry.delete(&connection.connection_id).await {
            warn!(
                "Failed to remove connection {}: {}",
                connection.connection_id, e
            );
        }
    }
}
