use collab_sync::{
    router_with_sync, Backends, LocalPushGateway, MemoryConnectionRegistry, MemoryOperationStore,
    PersistenceManager, Role, StaticAccessResolver, StaticIdentityVerifier, StaticUserDirectory,
    SyncConfig, SyncEngine, SyncState,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, Level};

const DEMO_DOCUMENT: &str = "7f3c2a9e-4b1d-4e8a-9c6f-2d5b8e1a0c47";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting collaborative sync server...");

    let config = match std::env::var("COLLAB_SYNC_CONFIG") {
        Ok(path) => SyncConfig::from_json_file(path)?,
        Err(_) => SyncConfig::default(),
    };

    // Demo identities and grants
    let identity = Arc::new(StaticIdentityVerifier::new());
    identity.insert("alice-token", "alice", Some("alice@example.com"));
    identity.insert("bob-token", "bob", Some("bob@example.com"));
    identity.insert("carol-token", "carol", None);

    let access = Arc::new(StaticAccessResolver::new());
    access.grant(DEMO_DOCUMENT, "alice", Role::Owner);
    access.grant(DEMO_DOCUMENT, "bob", Role::Editor);
    access.grant(DEMO_DOCUMENT, "carol", Role::Viewer);

    let users = Arc::new(StaticUserDirectory::new());
    users.insert("alice", Some("Alice"), Some("alice@example.com"));
    users.insert("bob", Some("Bob"), None);

    let store = Arc::new(MemoryOperationStore::new());
    let mut persistence = PersistenceManager::new(store.clone(), "./data");
    persistence.start().await?;
    let loaded = persistence.load_all_documents().await?;
    info!("Loaded {} document(s) from disk", loaded);

    let gateway = Arc::new(LocalPushGateway::default());
    let engine = SyncEngine::new(
        config,
        Backends {
            registry: Arc::new(MemoryConnectionRegistry::default()),
            store,
            identity,
            access,
            users,
            gateway: gateway.clone(),
        },
    );
    let heartbeat = engine.spawn_heartbeat();

    let app = router_with_sync(SyncState::new(engine, gateway));

    let listener = TcpListener::bind("127.0.0.1:3001").await?;
    info!("Server running on http://127.0.0.1:3001");
    info!("WebSocket endpoint available at ws://127.0.0.1:3001/sync?token=alice-token");
    info!("Demo document: {}", DEMO_DOCUMENT);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    heartbeat.abort();
    persistence.stop().await;
    Ok(())
}
