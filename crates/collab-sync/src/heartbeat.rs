//! Liveness tracking and reaping of dead connections.
//!
//! Per connection: idle -> ping pending -> (pong: idle) | (timeout: missed + 1).
//! After `max_missed` consecutive misses the transport is terminated and the
//! registry entry removed. Bookkeeping is process-local and starts empty after
//! a restart.

use dashmap::DashMap;
use futures_util::future::join_all;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::gateway::PushGateway;
use crate::protocol::ServerMessage;
use crate::registry::{Connection, ConnectionRegistry};

#[derive(Debug, Clone)]
struct Liveness {
    last_seen: Instant,
    ping_sent_at: Option<Instant>,
    missed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Wait,
    Ping { after_miss: bool },
    Reap,
}

impl Liveness {
    fn new(now: Instant) -> Self {
        Self {
            last_seen: now,
            ping_sent_at: None,
            missed: 0,
        }
    }

    fn step(&mut self, now: Instant, interval: Duration, pong_timeout: Duration, max_missed: u32) -> Step {
        let mut after_miss = false;

        if let Some(sent) = self.ping_sent_at {
            if now.saturating_duration_since(sent) <= pong_timeout {
                return Step::Wait;
            }
            self.missed += 1;
            self.ping_sent_at = None;
            after_miss = true;
            if self.missed >= max_missed {
                return Step::Reap;
            }
        }

        if now.saturating_duration_since(self.last_seen) >= interval {
            self.ping_sent_at = Some(now);
            return Step::Ping { after_miss };
        }
        Step::Wait
    }
}

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub missed: usize,
    /// Connections terminated for missing too many pongs or failing a ping
    pub reaped: Vec<String>,
    /// Entries removed because they had no endpoint
    pub corrupt: usize,
    pub expired: usize,
}

enum Verdict {
    Idle,
    Pinged { after_miss: bool },
    Reaped(String),
    Corrupt,
}

pub struct HeartbeatMonitor {
    interval: Duration,
    pong_timeout: Duration,
    max_missed: u32,
    push_timeout: Duration,
    states: DashMap<String, Liveness>,
    last_sweep: Mutex<Option<Instant>>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, pong_timeout: Duration, max_missed: u32, push_timeout: Duration) -> Self {
        Self {
            interval,
            pong_timeout,
            max_missed: max_missed.max(1),
            push_timeout,
            states: DashMap::new(),
            last_sweep: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Any inbound traffic, pongs included, clears pending and missed state
    pub fn record_activity(&self, connection_id: &str) {
        self.record_activity_at(connection_id, Instant::now());
    }

    pub fn record_activity_at(&self, connection_id: &str, now: Instant) {
        self.states
            .insert(connection_id.to_string(), Liveness::new(now));
    }

    pub fn forget(&self, connection_id: &str) {
        self.states.remove(connection_id);
    }

    pub fn missed_count(&self, connection_id: &str) -> Option<u32> {
        self.states.get(connection_id).map(|s| s.missed)
    }

    pub fn is_ping_pending(&self, connection_id: &str) -> bool {
        self.states
            .get(connection_id)
            .is_some_and(|s| s.ping_sent_at.is_some())
    }

    /// Claim the right to sweep. Only one sweep per interval proceeds.
    fn try_begin_sweep(&self, now: Instant) -> bool {
        let mut last = match self.last_sweep.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let due = last.map_or(true, |l| now.saturating_duration_since(l) >= self.interval);
        if due {
            *last = Some(now);
        }
        due
    }

    pub async fn sweep(
        &self,
        registry: &dyn ConnectionRegistry,
        gateway: &dyn PushGateway,
    ) -> Option<SweepReport> {
        self.sweep_at(registry, gateway, Instant::now()).await
    }

    /// Run one sweep as of `now`. Returns `None` if another sweep ran less
    /// than one interval ago.
    pub async fn sweep_at(
        &self,
        registry: &dyn ConnectionRegistry,
        gateway: &dyn PushGateway,
        now: Instant,
    ) -> Option<SweepReport> {
        if !self.try_begin_sweep(now) {
            debug!("Heartbeat sweep skipped, last one is recent");
            return None;
        }

        let mut report = SweepReport::default();

        match registry.purge_expired().await {
            Ok(expired) => report.expired = expired,
            Err(e) => warn!("Failed to purge expired connections: {}", e),
        }

        let connections = match registry.list_all().await {
            Ok(connections) => connections,
            Err(e) => {
                warn!("Heartbeat sweep could not list connections: {}", e);
                return Some(report);
            }
        };

        let verdicts = join_all(
            connections
                .into_iter()
                .map(|conn| self.check_connection(conn, registry, gateway, now)),
        )
        .await;

        for verdict in verdicts {
            match verdict {
                Verdict::Idle => {}
                Verdict::Pinged { after_miss } => {
                    report.pinged += 1;
                    if after_miss {
                        report.missed += 1;
                    }
                }
                Verdict::Reaped(id) => {
                    report.missed += 1;
                    report.reaped.push(id);
                }
                Verdict::Corrupt => report.corrupt += 1,
            }
        }

        if !report.reaped.is_empty() || report.corrupt > 0 {
            info!(
                "Heartbeat sweep reaped {} connections ({} corrupt)",
                report.reaped.len(),
                report.corrupt
            );
        }
        Some(report)
    }

    async fn check_connection(
        &self,
        conn: Connection,
        registry: &dyn ConnectionRegistry,
        gateway: &dyn PushGateway,
        now: Instant,
    ) -> Verdict {
        if conn.endpoint.is_empty() {
            warn!(
                "Connection {} has no endpoint, removing",
                conn.connection_id
            );
            self.remove(&conn, registry).await;
            return Verdict::Corrupt;
        }

        let step = self
            .states
            .entry(conn.connection_id.clone())
            .or_insert_with(|| Liveness::new(now))
            .step(now, self.interval, self.pong_timeout, self.max_missed);

        match step {
            Step::Wait => Verdict::Idle,
            Step::Reap => {
                info!(
                    "Connection {} missed {} pongs, terminating",
                    conn.connection_id, self.max_missed
                );
                self.reap(&conn, registry, gateway).await;
                Verdict::Reaped(conn.connection_id)
            }
            Step::Ping { after_miss } => {
                let sent = tokio::time::timeout(
                    self.push_timeout,
                    gateway.push(&conn.endpoint, &ServerMessage::Ping),
                )
                .await;

                match sent {
                    Ok(Ok(())) => Verdict::Pinged { after_miss },
                    Ok(Err(e)) => {
                        debug!("Ping to {} failed: {}", conn.connection_id, e);
                        self.reap(&conn, registry, gateway).await;
                        Verdict::Reaped(conn.connection_id)
                    }
                    Err(_) => {
                        debug!("Ping to {} timed out", conn.connection_id);
                        self.reap(&conn, registry, gateway).await;
                        Verdict::Reaped(conn.connection_id)
                    }
                }
            }
        }
    }

    async fn reap(&self, conn: &Connection, registry: &dyn ConnectionRegistry, gateway: &dyn PushGateway) {
        gateway.terminate(&conn.endpoint).await;
        self.remove(conn, registry).await;
    }

    async fn remove(&self, conn: &Connection, registry: &dyn ConnectionRegistry) {
        self.forget(&conn.connection_id);
        if let Err(e) = registry.delete(&conn.connection_id).await {
            warn!(
                "Failed to remove connection {}: {}",
                conn.connection_id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::LocalPushGateway;
    use crate::registry::MemoryConnectionRegistry;

    const DOC: &str = "11111111-1111-1111-1111-111111111111";
    const INTERVAL: Duration = Duration::from_secs(30);

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(INTERVAL, Duration::from_secs(10), 3, Duration::from_millis(100))
    }

    async fn registered(
        registry: &MemoryConnectionRegistry,
        gateway: &LocalPushGateway,
        id: &str,
    ) -> crate::gateway::EndpointHandle {
        let endpoint = format!("ep-{}", id);
        let handle = gateway.open(endpoint.clone());
        registry
            .save(Connection::new(id, "alice", endpoint, Duration::from_secs(3600)))
            .await
            .unwrap();
        registry
            .set_document(id, Some(DOC), Duration::from_secs(3600))
            .await.unwrap();
        handle
    }

    #[tokio::test]
    async fn test_silent_connection_is_reaped_after_three_misses() {
        let registry = MemoryConnectionRegistry::default();
        let gateway = LocalPushGateway::new(16);
        let monitor = monitor();
        let mut handle = registered(&registry, &gateway, "c1").await;

        let start = Instant::now();
        monitor.record_activity_at("c1", start);

        let mut pings = 0;
        for round in 1..=3 {
            let report = monitor
                .sweep_at(&registry, &gateway, start + INTERVAL * round)
                .await
                .unwrap();
            assert_eq!(report.pinged, 1, "round {}", round);
            assert!(report.reaped.is_empty());
            while let Ok(msg) = handle.receiver.try_recv() {
                assert_eq!(msg, ServerMessage::Ping);
                pings += 1;
            }
        }
        assert_eq!(pings, 3);
        assert_eq!(monitor.missed_count("c1"), Some(2));

        let report = monitor
            .sweep_at(&registry, &gateway, start + INTERVAL * 4)
            .await
            .unwrap();
        assert_eq!(report.reaped, vec!["c1".to_string()]);

        assert!(registry.get("c1").await.unwrap().is_none());
        assert!(registry.by_document(DOC).await.unwrap().is_empty());
        assert!(registry.by_user("alice").await.unwrap().is_empty());
        assert!(!gateway.is_open("ep-c1"));
        assert_eq!(monitor.missed_count("c1"), None);
    }

    #[tokio::test]
    async fn test_pong_resets_state() {
        let registry = MemoryConnectionRegistry::default();
        let gateway = LocalPushGateway::new(16);
        let monitor = monitor();
        let _handle = registered(&registry, &gateway, "c1").await;

        let start = Instant::now();
        monitor.record_activity_at("c1", start);

        monitor.sweep_at(&registry, &gateway, start + INTERVAL).await.unwrap();
        monitor.sweep_at(&registry, &gateway, start + INTERVAL * 2).await.unwrap();
        assert_eq!(monitor.missed_count("c1"), Some(1));
        assert!(monitor.is_ping_pending("c1"));

        monitor.record_activity_at("c1", start + INTERVAL * 2 + Duration::from_secs(1));
        assert_eq!(monitor.missed_count("c1"), Some(0));
        assert!(!monitor.is_ping_pending("c1"));

        // Activity was recent: no ping this round
        let report = monitor
            .sweep_at(&registry, &gateway, start + INTERVAL * 3)
            .await
            .unwrap();
        assert_eq!(report.pinged, 0);
        assert!(registry.get("c1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweeps_are_gated_by_interval() {
        let registry = MemoryConnectionRegistry::default();
        let gateway = LocalPushGateway::new(16);
        let monitor = monitor();

        let start = Instant::now();
        assert!(monitor.sweep_at(&registry, &gateway, start).await.is_some());
        assert!(monitor
            .sweep_at(&registry, &gateway, start + Duration::from_secs(5))
            .await
            .is_none());
        assert!(monitor.sweep_at(&registry, &gateway, start + INTERVAL).await.is_some());
    }

    #[tokio::test]
    async fn test_connection_without_endpoint_is_removed() {
        let registry = MemoryConnectionRegistry::default();
        let gateway = LocalPushGateway::new(16);
        let monitor = monitor();
        registry
            .save(Connection::new("broken", "alice", "", Duration::from_secs(3600)))
            .await
            .unwrap();

        let report = monitor.sweep_at(&registry, &gateway, Instant::now()).await.unwrap();
        assert_eq!(report.corrupt, 1);
        assert!(registry.get("broken").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_ping_reaps_immediately() {
        let registry = MemoryConnectionRegistry::default();
        let gateway = LocalPushGateway::new(16);
        let monitor = monitor();
        drop(registered(&registry, &gateway, "c1").await);

        let start = Instant::now();
        monitor.record_activity_at("c1", start);
        let report = monitor
            .sweep_at(&registry, &gateway, start + INTERVAL)
            .await
            .unwrap();
        assert_eq!(report.reaped, vec!["c1".to_string()]);
        assert!(registry.get("c1").await.unwrap().is_none());
    }
}
