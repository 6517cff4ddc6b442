//! The session protocol: connect -> join -> update/presence/snapshot/ping loop
//! -> disconnect.
//!
//! Messages are handled independently and may run concurrently, including for
//! the same document. Ordering of persisted operations comes from the
//! operation store alone; nothing here holds a lock across an await.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::access::{AccessResolver, Identity, IdentityVerifier, Role, UserDirectory};
use crate::broadcast::Broadcaster;
use crate::config::SyncConfig;
use crate::error::DeliveryError;
use crate::gateway::PushGateway;
use crate::heartbeat::{HeartbeatMonitor, SweepReport};
use crate::protocol::{
    parse_client_message, validate_size, ClientMessage, PresenceAction, ServerMessage,
};
use crate::ratelimit::RateLimiter;
use crate::registry::{Connection, ConnectionRegistry};
use crate::store::{OperationStore, SnapshotCadence};
use crate::{SyncError, SyncResult};

mod handlers;

/// Where a session is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Authenticated, but the registry write has not landed yet
    Connecting,
    Connected,
    InRoom(String),
    Closed,
}

/// One authenticated transport session, owned by the task serving it
#[derive(Debug)]
pub struct Session {
    connection: Connection,
    identity: Identity,
    joined: Mutex<Option<String>>,
    registered: AtomicBool,
    closed: AtomicBool,
}

impl Session {
    fn new(connection: Connection, identity: Identity, registered: bool) -> Self {
        Self {
            connection,
            identity,
            joined: Mutex::new(None),
            registered: AtomicBool::new(registered),
            closed: AtomicBool::new(false),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection.connection_id
    }

    pub fn endpoint(&self) -> &str {
        &self.connection.endpoint
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Document this session last joined successfully
    pub fn joined_document(&self) -> Option<String> {
        self.joined
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_joined(&self, document_id: Option<String>) {
        *self.joined.lock().unwrap_or_else(PoisonError::into_inner) = document_id;
    }

    pub fn state(&self) -> SessionState {
        if self.closed.load(Ordering::Acquire) {
            return SessionState::Closed;
        }
        if !self.registered.load(Ordering::Acquire) {
            return SessionState::Connecting;
        }
        match self.joined_document() {
            Some(doc) => SessionState::InRoom(doc),
            None => SessionState::Connected,
        }
    }
}

/// External collaborators and storage the engine is wired to
pub struct Backends {
    pub registry: Arc<dyn ConnectionRegistry>,
    pub store: Arc<dyn OperationStore>,
    pub identity: Arc<dyn IdentityVerifier>,
    pub access: Arc<dyn AccessResolver>,
    pub users: Arc<dyn UserDirectory>,
    pub gateway: Arc<dyn PushGateway>,
}

/// Binds registry, store, access gate, limiter, heartbeat and fan-out into
/// the per-connection protocol. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    config: Arc<SyncConfig>,
    registry: Arc<dyn ConnectionRegistry>,
    store: Arc<dyn OperationStore>,
    identity: Arc<dyn IdentityVerifier>,
    access: Arc<dyn AccessResolver>,
    users: Arc<dyn UserDirectory>,
    gateway: Arc<dyn PushGateway>,
    broadcaster: Arc<Broadcaster>,
    limiter: Arc<RateLimiter>,
    heartbeat: Arc<HeartbeatMonitor>,
    cadence: Arc<SnapshotCadence>,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, backends: Backends) -> Self {
        let broadcaster = Broadcaster::new(
            backends.registry.clone(),
            backends.access.clone(),
            backends.gateway.clone(),
            config.push_timeout(),
        );
        let limiter = RateLimiter::new(config.rate_limits.clone());
        let heartbeat = HeartbeatMonitor::new(
            config.heartbeat_interval(),
            config.pong_timeout(),
            config.max_missed_pongs,
            config.push_timeout(),
        );
        let cadence = SnapshotCadence::new(config.snapshot_op_threshold, config.snapshot_interval());

        Self {
            config: Arc::new(config),
            registry: backends.registry,
            store: backends.store,
            identity: backends.identity,
            access: backends.access,
            users: backends.users,
            gateway: backends.gateway,
            broadcaster: Arc::new(broadcaster),
            limiter: Arc::new(limiter),
            heartbeat: Arc::new(heartbeat),
            cadence: Arc::new(cadence),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn ConnectionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn OperationStore> {
        &self.store
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Authenticate and register a new connection.
    ///
    /// The registry write is best-effort and bounded by the register timeout;
    /// a failed write is retried on the next inbound message.
    pub async fn connect(&self, token: &str, endpoint: &str) -> SyncResult<Session> {
        let identity = self.identity.verify(token).await.map_err(|e| {
            warn!("Rejected connection on endpoint {}: {}", endpoint, e);
            e
        })?;

        let connection = Connection::new(
            Uuid::new_v4().to_string(),
            identity.user_id.clone(),
            endpoint,
            self.config.connection_ttl(),
        );
        self.heartbeat.record_activity(&connection.connection_id);

        let registered = match tokio::time::timeout(
            self.config.register_timeout(),
            self.registry.save(connection.clone()),
        )
        .await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(
                    "Registering connection {} failed, will retry: {}",
                    connection.connection_id, e
                );
                false
            }
            Err(_) => {
                warn!(
                    "Registering connection {} timed out, will retry",
                    connection.connection_id
                );
                false
            }
        };

        {
            let engine = self.clone();
            let user_id = identity.user_id.clone();
            let connection_id = connection.connection_id.clone();
            tokio::spawn(async move {
                engine.enforce_connection_limit(&user_id, &connection_id).await;
            });
        }

        info!(
            "Connection {} established for user {}",
            connection.connection_id, identity.user_id
        );
        Ok(Session::new(connection, identity, registered))
    }

    /// Handle one inbound text frame. Failures are reported to this
    /// connection only.
    pub async fn handle_message(&self, session: &Session, raw: &str) {
        let Err(err) = self.dispatch(session, raw).await else {
            return;
        };

        match &err {
            SyncError::Delivery(e) => {
                debug!("Reply to {} not delivered: {}", session.connection_id(), e);
                return;
            }
            SyncError::Validation { .. } | SyncError::RateLimited { .. } | SyncError::NotJoined { .. } => {
                debug!("Rejected message from {}: {}", session.connection_id(), err)
            }
            SyncError::Auth(_) | SyncError::Access(_) | SyncError::Capacity(_) => {
                warn!("Rejected message from {}: {}", session.connection_id(), err)
            }
            _ => error!(
                "Failed to handle message from {}: {}",
                session.connection_id(),
                err
            ),
        }

        if let Err(e) = self.reply(session, ServerMessage::error(&err)).await {
            debug!("Error reply to {} not delivered: {}", session.connection_id(), e);
        }
    }

    async fn dispatch(&self, session: &Session, raw: &str) -> SyncResult<()> {
        if session.state() == SessionState::Closed {
            return Err(SyncError::Auth("session is closed".to_string()));
        }

        self.heartbeat.record_activity(session.connection_id());
        validate_size(raw, self.config.max_message_bytes)?;
        self.ensure_registered(session).await?;

        let message = parse_client_message(raw)?;
        self.limiter.check(session.connection_id(), message.action())?;

        match message {
            ClientMessage::Join {
                document_id,
                last_known_version,
            } => self.handle_join(session, document_id, last_known_version).await,
            ClientMessage::Update {
                document_id,
                update,
            } => self.handle_update(session, document_id, update).await,
            ClientMessage::Presence {
                document_id,
                cursor,
                selection,
            } => {
                self.handle_presence(session, document_id, cursor, selection)
                    .await
            }
            ClientMessage::CreateSnapshot {
                document_id,
                update,
            } => self.handle_create_snapshot(session, document_id, update).await,
            ClientMessage::Leave { document_id } => self.handle_leave(session, document_id).await,
            ClientMessage::Ping => Ok(self.reply(session, ServerMessage::Pong).await?),
            // Activity was already recorded above
            ClientMessage::Pong => Ok(()),
        }
    }

    /// Tear down a session. The registry entry is removed before returning;
    /// the leave announcement runs in the background.
    pub async fn disconnect(&self, session: &Session) {
        if session.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let removed = match self.registry.delete(session.connection_id()).await {
            Ok(removed) => removed,
            Err(e) => {
                error!(
                    "Failed to remove connection {}: {}",
                    session.connection_id(),
                    e
                );
                None
            }
        };
        self.limiter.forget(session.connection_id());
        self.heartbeat.forget(session.connection_id());

        let document_id = removed
            .and_then(|conn| conn.document_id)
            .or_else(|| session.joined_document());
        if let Some(document_id) = document_id {
            self.spawn_leave_announcement(session, document_id);
        }

        info!(
            "Connection {} for user {} disconnected",
            session.connection_id(),
            session.user_id()
        );
    }

    /// Tell a user's connections on a document about a role change.
    /// Connections that lost edit rights are closed so they resync read-only.
    /// Returns how many connections were notified.
    pub async fn notify_role_changed(&self, document_id: &str, user_id: &str, new_role: Role) -> usize {
        let connections: Vec<Connection> = match self.registry.by_user(user_id).await {
            Ok(conns) => conns.into_iter().filter(|c| c.is_in(document_id)).collect(),
            Err(e) => {
                warn!("Role change lookup failed for user {}: {}", user_id, e);
                return 0;
            }
        };

        let message = ServerMessage::RoleChanged { new_role };
        for conn in &connections {
            if let Err(e) = self.broadcaster.deliver(conn, &message).await {
                debug!("Role change not delivered to {}: {}", conn.connection_id, e);
            }
            if !new_role.can_edit() {
                info!(
                    "Disconnecting {} after downgrade to {:?}",
                    conn.connection_id, new_role
                );
                self.drop_connection(conn).await;
            }
        }
        connections.len()
    }

    /// One heartbeat pass now, if one is due
    pub async fn run_heartbeat_sweep(&self) -> Option<SweepReport> {
        let report = self
            .heartbeat
            .sweep(self.registry.as_ref(), self.gateway.as_ref())
            .await;
        if report.is_some() {
            self.cadence.prune_idle(Instant::now());
        }
        report
    }

    /// Drive heartbeat sweeps every interval until the task is aborted
    pub fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.heartbeat.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Started heartbeat sweeper");

            loop {
                let tick = ticker.tick().await.into_std();
                engine
                    .heartbeat
                    .sweep_at(engine.registry.as_ref(), engine.gateway.as_ref(), tick)
                    .await;
                let pruned = engine.cadence.prune_idle(tick);
                if pruned > 0 {
                    debug!("Dropped snapshot cadence for {} idle documents", pruned);
                }
            }
        })
    }

    async fn reply(&self, session: &Session, message: ServerMessage) -> Result<(), DeliveryError> {
        self.broadcaster.deliver(&session.connection, &message).await
    }

    /// Make sure the registry knows this connection, re-saving it if the
    /// handshake write was lost
    async fn ensure_registered(&self, session: &Session) -> SyncResult<()> {
        match self
            .registry
            .touch(session.connection_id(), self.config.connection_ttl())
            .await
        {
            Ok(true) => {
                session.registered.store(true, Ordering::Release);
                return Ok(());
            }
            Ok(false) => debug!(
                "Connection {} missing from registry, re-registering",
                session.connection_id()
            ),
            Err(e) => warn!(
                "Touch failed for {}, re-registering: {}",
                session.connection_id(),
                e
            ),
        }

        let mut connection = session.connection.clone();
        connection.document_id = session.joined_document();
        connection.refresh(Utc::now(), self.config.connection_ttl());
        self.registry
            .save(connection)
            .await
            .map_err(|e| SyncError::Auth(format!("connection is not registered: {}", e)))?;
        session.registered.store(true, Ordering::Release);
        Ok(())
    }

    /// Check the registry agrees the connection is in `document_id`. A stale
    /// record is repaired once from the session's own join state.
    async fn ensure_joined(&self, session: &Session, document_id: &str) -> SyncResult<()> {
        let recorded = self
            .registry
            .get(session.connection_id())
            .await?
            .and_then(|conn| conn.document_id);
        if recorded.as_deref() == Some(document_id) {
            return Ok(());
        }

        if session.joined_document().as_deref() == Some(document_id)
            && self
                .registry
                .set_document(
                    session.connection_id(),
                    Some(document_id),
                    self.config.connection_ttl(),
                )
                .await?
        {
            info!(
                "Repaired document binding of {} to {}",
                session.connection_id(),
                document_id
            );
            return Ok(());
        }

        Err(SyncError::NotJoined {
            document_id: document_id.to_string(),
        })
    }

    fn spawn_leave_announcement(&self, session: &Session, document_id: String) {
        let engine = self.clone();
        let user_id = session.user_id().to_string();
        let email = session.identity().email.clone();
        tokio::spawn(async move {
            engine.announce_leave(&user_id, email, &document_id).await;
        });
    }

    /// Broadcast `presence: leave` unless the user still has another
    /// connection in the room
    async fn announce_leave(&self, user_id: &str, email: Option<String>, document_id: &str) {
        let still_present = match self.registry.by_user(user_id).await {
            Ok(conns) => conns.iter().any(|c| c.is_in(document_id)),
            Err(e) => {
                warn!("Leave check failed for user {}: {}", user_id, e);
                return;
            }
        };
        if still_present {
            debug!(
                "User {} still connected to {}, not announcing leave",
                user_id, document_id
            );
            return;
        }

        let message = self
            .presence_message(user_id, email, PresenceAction::Leave, None, None)
            .await;
        self.broadcaster.broadcast(document_id, &message, None).await;
    }

    /// If the user is at the connection ceiling, reap their long-idle connections
    async fn enforce_connection_limit(&self, user_id: &str, current_id: &str) {
        let connections = match self.registry.by_user(user_id).await {
            Ok(conns) => conns,
            Err(e) => {
                warn!("Connection limit check failed for {}: {}", user_id, e);
                return;
            }
        };
        let existing = connections
            .iter()
            .filter(|c| c.connection_id != current_id)
            .count();
        if existing < self.config.max_connections_per_user {
            return;
        }

        let now = Utc::now();
        let idle_limit = self.config.idle_reap_after();
        for conn in connections
            .iter()
            .filter(|c| c.connection_id != current_id && c.idle_for(now) > idle_limit)
        {
            info!(
                "User {} at connection limit, reaping idle connection {}",
                user_id, conn.connection_id
            );
            self.drop_connection(conn).await;
        }
    }

    /// Reap the user's connections that never joined a document
    async fn reap_orphans(&self, user_id: &str, current_id: &str) {
        let connections = match self.registry.by_user(user_id).await {
            Ok(conns) => conns,
            Err(e) => {
                debug!("Orphan lookup failed for {}: {}", user_id, e);
                return;
            }
        };

        let now = Utc::now();
        let orphan_age = self.config.orphan_reap_after();
        for conn in connections.iter().filter(|c| {
            c.connection_id != current_id && c.document_id.is_none() && c.age(now) > orphan_age
        }) {
            debug!("Reaping orphaned connection {}", conn.connection_id);
            self.drop_connection(conn).await;
        }
    }

    /// Close a connection's transport and forget it everywhere. Errors are
    /// logged, never returned.
    async fn drop_connection(&self, conn: &Connection) {
        self.gateway.terminate(&conn.endpoint).await;
        if let Err(e) = self.registry.delete(&conn.connection_id).await {
            warn!("Failed to remove connection {}: {}", conn.connection_id, e);
        }
        self.limiter.forget(&conn.connection_id);
        self.heartbeat.forget(&conn.connection_id);
    }
}
