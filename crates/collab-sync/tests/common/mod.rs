#![allow(dead_code)]

use collab_sync::{
    Backends, ConnectionRegistry, EndpointHandle, LocalPushGateway, MemoryConnectionRegistry, MemoryOperationStore,
    Role, ServerMessage, Session, StaticAccessResolver, StaticIdentityVerifier,
    StaticUserDirectory, SyncConfig, SyncEngine,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

pub const DOC: &str = "11111111-1111-1111-1111-111111111111";

/// Engine wired to in-memory collaborators with three demo users:
/// alice (owner), bob (editor), carol (viewer). dave has a token but no grant.
pub struct Harness {
    pub engine: SyncEngine,
    pub gateway: Arc<LocalPushGateway>,
    pub registry: Arc<MemoryConnectionRegistry>,
    pub store: Arc<MemoryOperationStore>,
    pub access: Arc<StaticAccessResolver>,
}

pub fn harness() -> Harness {
    harness_with(SyncConfig::default())
}

pub fn harness_with(config: SyncConfig) -> Harness {
    harness_wrapping(config, |registry| registry)
}

/// Like [`harness_with`], but the engine sees the registry through `wrap`
pub fn harness_wrapping<F>(config: SyncConfig, wrap: F) -> Harness
where
    F: FnOnce(Arc<MemoryConnectionRegistry>) -> Arc<dyn ConnectionRegistry>,
{
    let identity = Arc::new(StaticIdentityVerifier::new());
    for user in ["alice", "bob", "carol", "dave"] {
        let email = format!("{}@example.com", user);
        identity.insert(format!("{}-token", user), user, Some(email.as_str()));
    }

    let access = Arc::new(StaticAccessResolver::new());
    access.grant(DOC, "alice", Role::Owner);
    access.grant(DOC, "bob", Role::Editor);
    access.grant(DOC, "carol", Role::Viewer);

    let users = Arc::new(StaticUserDirectory::new());
    users.insert("alice", Some("Alice"), None);
    users.insert("bob", Some("Bob"), Some("bob@work.example"));

    let registry = Arc::new(MemoryConnectionRegistry::default());
    let store = Arc::new(MemoryOperationStore::new());
    let gateway = Arc::new(LocalPushGateway::new(64));

    let engine = SyncEngine::new(
        config,
        Backends {
            registry: wrap(registry.clone()),
            store: store.clone(),
            identity,
            access: access.clone(),
            users,
            gateway: gateway.clone(),
        },
    );

    Harness {
        engine,
        gateway,
        registry,
        store,
        access,
    }
}

/// One connected client: its session plus the receiving end of its endpoint
pub struct Client {
    pub session: Session,
    pub outlet: EndpointHandle,
}

impl Harness {
    pub async fn connect(&self, user: &str) -> Client {
        let endpoint = format!("ep-{}-{}", user, uuid::Uuid::new_v4());
        let outlet = self.gateway.open(endpoint.clone());
        let session = self
            .engine
            .connect(&format!("{}-token", user), &endpoint)
            .await
            .expect("token should verify");
        Client { session, outlet }
    }

    pub async fn send(&self, client: &Client, message: serde_json::Value) {
        self.engine
            .handle_message(&client.session, &message.to_string())
            .await;
    }

    /// Join `DOC` and consume the sync reply
    pub async fn join(&self, client: &mut Client) -> ServerMessage {
        self.send(client, json!({"action": "join", "documentId": DOC}))
            .await;
        client.recv().await
    }

    pub async fn disconnect(&self, client: &Client) {
        self.engine.disconnect(&client.session).await;
    }
}

impl Client {
    pub async fn recv(&mut self) -> ServerMessage {
        timeout(Duration::from_secs(1), self.outlet.receiver.recv())
            .await
            .expect("expected a message")
            .expect("outlet closed")
    }

    /// Nothing arrives within a short grace period
    pub async fn assert_silent(&mut self) {
        let next = timeout(Duration::from_millis(100), self.outlet.receiver.recv()).await;
        assert!(next.is_err(), "unexpected message: {:?}", next);
    }

    pub async fn expect_error(&mut self, code: &str) {
        match self.recv().await {
            ServerMessage::Error { code: got, .. } => assert_eq!(got, code),
            other => panic!("expected error {}, got {:?}", code, other),
        }
    }
}
