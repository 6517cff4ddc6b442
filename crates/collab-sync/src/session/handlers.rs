use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use super::{Session, SyncEngine};
use crate::protocol::{plan_sync_messages, PresenceAction, ServerMessage};
use crate::{SyncError, SyncResult};

impl SyncEngine {
    pub(super) async fn handle_join(
        &self,
        session: &Session,
        document_id: String,
        last_known_version: Option<i64>,
    ) -> SyncResult<()> {
        {
            let engine = self.clone();
            let user_id = session.user_id().to_string();
            let connection_id = session.connection_id().to_string();
            tokio::spawn(async move {
                engine.reap_orphans(&user_id, &connection_id).await;
            });
        }

        let previous = session.joined_document();
        if previous.as_deref() != Some(document_id.as_str()) {
            let present = self.registry.count_by_document(&document_id).await?;
            if present >= self.config.max_connections_per_document {
                return Err(SyncError::Capacity(format!(
                    "Document {} has reached its connection limit",
                    document_id
                )));
            }
        }

        let role = self.access.check_access(&document_id, session.user_id()).await?;
        if !role.can_read() {
            return Err(SyncError::Access(format!(
                "No access to document {}",
                document_id
            )));
        }

        if !self
            .registry
            .set_document(
                session.connection_id(),
                Some(&document_id),
                self.config.connection_ttl(),
            )
            .await?
        {
            return Err(SyncError::Registry(format!(
                "Connection {} vanished during join",
                session.connection_id()
            )));
        }
        session.set_joined(Some(document_id.clone()));

        if let Some(previous) = previous.filter(|p| *p != document_id) {
            self.spawn_leave_announcement(session, previous);
        }

        self.send_sync(session, &document_id, last_known_version).await?;

        info!(
            "Connection {} joined document {} as {:?}",
            session.connection_id(),
            document_id,
            role
        );

        let presence = self
            .presence_message(
                session.user_id(),
                session.identity().email.clone(),
                PresenceAction::Join,
                None,
                None,
            )
            .await;
        self.broadcaster
            .broadcast(&document_id, &presence, Some(session.connection_id()))
            .await;
        Ok(())
    }

    /// Stream the document state to the joining connection, chunked when it
    /// would not fit in one message
    async fn send_sync(
        &self,
        session: &Session,
        document_id: &str,
        last_known_version: Option<i64>,
    ) -> SyncResult<()> {
        let snapshot = self.store.latest_snapshot(document_id).await?;
        let version = snapshot.as_ref().map(|s| s.version);
        let ops = self.store.operations_since(document_id, version).await?;

        // A client already holding the latest snapshot only needs the tail
        let snapshot_payload = match snapshot {
            Some(s) if last_known_version == Some(s.version) => None,
            Some(s) => Some(s.payload),
            None => None,
        };

        let messages = plan_sync_messages(
            snapshot_payload,
            ops.into_iter().map(|op| op.payload).collect(),
            version,
            self.config.max_message_bytes,
        )?;

        debug!(
            "Sending {} sync message(s) for {} to {}",
            messages.len(),
            document_id,
            session.connection_id()
        );
        for message in messages {
            self.reply(session, message).await?;
        }
        Ok(())
    }

    pub(super) async fn handle_update(
        &self,
        session: &Session,
        document_id: String,
        update: String,
    ) -> SyncResult<()> {
        let role = self.access.check_access(&document_id, session.user_id()).await?;
        if !role.can_edit() {
            return Err(SyncError::Access(format!(
                "Role {:?} cannot edit document {}",
                role, document_id
            )));
        }
        self.ensure_joined(session, &document_id).await?;

        let update_len = update.len();
        self.store
            .append_operation(&document_id, update.clone(), session.connection_id())
            .await?;

        let message = ServerMessage::Update {
            document_id: document_id.clone(),
            update,
        };
        self.broadcaster
            .broadcast(&document_id, &message, Some(session.connection_id()))
            .await;

        if update_len >= self.config.snapshot_hint_max_update_bytes {
            return Ok(());
        }
        let pending = match self.store.count_operations_since_last_snapshot(&document_id).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Could not count operations for {}: {}", document_id, e);
                return Ok(());
            }
        };
        if self.cadence.should_suggest(&document_id, pending) {
            debug!(
                "Suggesting snapshot for {} after {} operations",
                document_id, pending
            );
            let hint = ServerMessage::SnapshotNeeded {
                document_id: document_id.clone(),
            };
            self.broadcaster.broadcast(&document_id, &hint, None).await;
        }
        Ok(())
    }

    pub(super) async fn handle_presence(
        &self,
        session: &Session,
        document_id: String,
        cursor: Option<JsonValue>,
        selection: Option<JsonValue>,
    ) -> SyncResult<()> {
        let role = self.access.check_access(&document_id, session.user_id()).await?;
        if !role.can_read() {
            return Err(SyncError::Access(format!(
                "No access to document {}",
                document_id
            )));
        }
        self.ensure_joined(session, &document_id).await?;

        let presence = self
            .presence_message(
                session.user_id(),
                session.identity().email.clone(),
                PresenceAction::Update,
                cursor,
                selection,
            )
            .await;
        self.broadcaster
            .broadcast(&document_id, &presence, Some(session.connection_id()))
            .await;
        Ok(())
    }

    pub(super) async fn handle_create_snapshot(
        &self,
        session: &Session,
        document_id: String,
        payload: String,
    ) -> SyncResult<()> {
        let role = self.access.check_access(&document_id, session.user_id()).await?;
        if !role.can_edit() {
            return Err(SyncError::Access(format!(
                "Role {:?} cannot snapshot document {}",
                role, document_id
            )));
        }
        self.ensure_joined(session, &document_id).await?;

        let version = self.store.next_snapshot_version(&document_id).await?;
        match self.store.write_snapshot(&document_id, version, payload).await? {
            Some(snapshot) => info!(
                "Created snapshot {} of document {}",
                snapshot.version, document_id
            ),
            None => debug!(
                "Snapshot {} of document {} already written by another client",
                version, document_id
            ),
        }
        self.cadence.reset(&document_id);

        let created = ServerMessage::SnapshotCreated {
            document_id: document_id.clone(),
            version,
        };
        self.broadcaster.broadcast(&document_id, &created, None).await;
        Ok(())
    }

    pub(super) async fn handle_leave(&self, session: &Session, document_id: String) -> SyncResult<()> {
        self.ensure_joined(session, &document_id).await?;

        self.registry
            .set_document(session.connection_id(), None, self.config.connection_ttl())
            .await?;
        session.set_joined(None);
        info!(
            "Connection {} left document {}",
            session.connection_id(),
            document_id
        );

        self.spawn_leave_announcement(session, document_id);
        Ok(())
    }

    /// Presence event carrying the user's display profile. A missing profile
    /// falls back to the email from the token.
    pub(super) async fn presence_message(
        &self,
        user_id: &str,
        email: Option<String>,
        action: PresenceAction,
        cursor: Option<JsonValue>,
        selection: Option<JsonValue>,
    ) -> ServerMessage {
        let profile = match self.users.profile(user_id).await {
            Ok(profile) => profile,
            Err(e) => {
                debug!("Profile lookup failed for {}: {}", user_id, e);
                None
            }
        };
        let (user_name, profile_email) = match profile {
            Some(p) => (p.name, p.email),
            None => (None, None),
        };

        ServerMessage::Presence {
            action,
            user_id: user_id.to_string(),
            user_name,
            email: profile_email.or(email),
            timestamp: Utc::now().timestamp_millis(),
            cursor,
            selection,
        }
    }
}
