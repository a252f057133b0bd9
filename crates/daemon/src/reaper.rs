//! TTL reaper.
//!
//! Periodically finds sessions past their deadline and drives each one
//! through the engine's teardown path, the same one explicit deletion uses.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::Result;
use crate::store::now_millis;
use crate::supervisor::WorkerLauncher;

/// Background loop reclaiming expired sessions.
pub struct Reaper<L> {
    engine: Arc<Engine<L>>,
    interval: Duration,
}

impl<L: WorkerLauncher> Reaper<L> {
    pub fn new(engine: Arc<Engine<L>>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Run one scan. Returns how many sessions this scan reclaimed: expired
    /// sessions torn down plus abandoned creates rolled back.
    ///
    /// A session that another caller deletes concurrently is skipped; the
    /// engine's per-session serialization guarantees a single teardown.
    pub async fn scan_once(&self) -> Result<usize> {
        let abandoned = self.engine.abort_abandoned_creates().await?;
        if abandoned > 0 {
            info!(count = abandoned, "abandoned creates rolled back");
        }

        let expired = self.engine.store().expired_session_ids(now_millis())?;
        if expired.is_empty() {
            return Ok(abandoned);
        }
        debug!(count = expired.len(), "expired sessions found");

        let mut reaped = abandoned;
        for id in expired {
            match self.engine.expire_session(&id).await {
                Ok(true) => reaped += 1,
                Ok(false) => debug!(session_id = %id, "session already gone"),
                Err(e) => warn!(session_id = %id, error = %e, "failed to expire session"),
            }
        }
        Ok(reaped)
    }

    /// Scan on a fixed interval until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs_f64(), "TTL reaper started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.scan_once().await {
                        Ok(0) => {}
                        Ok(n) => info!(count = n, "expired sessions reaped"),
                        Err(e) => warn!(error = %e, "reaper scan failed"),
                    }
                }
            }
        }

        info!("TTL reaper stopped");
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PortsConfig, WorkerConfig, WorkerMode};
    use crate::ports::PortAllocator;
    use crate::store::{Store, TerminationReason};
    use crate::supervisor::testing::FakeLauncher;
    use crate::supervisor::WorkerSupervisor;
    use protocol::{SessionData, SessionState};
    use std::net::{IpAddr, Ipv4Addr};

    fn engine(launcher: &Arc<FakeLauncher>, ttl: Duration) -> Arc<Engine<Arc<FakeLauncher>>> {
        let store = Store::open_in_memory().unwrap();
        let ports = PortAllocator::new(
            store.clone(),
            &PortsConfig {
                range_start: 43100,
                range_end: 43199,
                skip_bound: false,
            },
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        );
        let config = WorkerConfig {
            mode: WorkerMode::Embedded,
            startup_timeout_ms: 40,
            health_poll_interval_ms: 5,
            ..WorkerConfig::default()
        };
        let supervisor = WorkerSupervisor::new(Arc::clone(launcher), &config);
        Arc::new(Engine::new(store, ports, supervisor, ttl))
    }

    #[tokio::test]
    async fn test_scan_with_nothing_expired() {
        let launcher = FakeLauncher::new();
        let engine = engine(&launcher, Duration::from_secs(60));
        engine.create_session(SessionData::new()).await.unwrap();

        let reaper = Reaper::new(Arc::clone(&engine), Duration::from_secs(1));
        assert_eq!(reaper.scan_once().await.unwrap(), 0);
        assert_eq!(launcher.running_count(), 1);
    }

    #[tokio::test]
    async fn test_scan_reaps_many() {
        let launcher = FakeLauncher::new();
        let engine = engine(&launcher, Duration::from_millis(20));
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(engine.create_session(SessionData::new()).await.unwrap().id);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reaper = Reaper::new(Arc::clone(&engine), Duration::from_secs(1));
        assert_eq!(reaper.scan_once().await.unwrap(), 3);
        assert_eq!(reaper.scan_once().await.unwrap(), 0);
        assert_eq!(launcher.running_count(), 0);

        for id in ids {
            let stored = engine.store().get_session(&id).unwrap().unwrap();
            assert_eq!(stored.status, SessionState::Terminated);
            assert_eq!(stored.termination_reason, Some(TerminationReason::Expired));
        }
    }

    #[tokio::test]
    async fn test_scan_rolls_back_abandoned_create() {
        let launcher = FakeLauncher::new();
        launcher.fail_next_starts(10);
        let engine = engine(&launcher, Duration::from_secs(60));

        let result = tokio::time::timeout(
            Duration::from_millis(15),
            engine.create_session(SessionData::new()),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(launcher.running_count(), 1);

        let reaper = Reaper::new(Arc::clone(&engine), Duration::from_secs(1));
        assert_eq!(reaper.scan_once().await.unwrap(), 1);

        let store = engine.store();
        assert!(store.list_sessions().unwrap().is_empty());
        assert!(store.list_operations().unwrap().is_empty());
        assert!(store.list_reservations().unwrap().is_empty());
        assert_eq!(launcher.running_count(), 0);
    }

    #[tokio::test]
    async fn test_background_loop_and_shutdown() {
        let launcher = FakeLauncher::new();
        let engine = engine(&launcher, Duration::from_millis(20));
        let session = engine.create_session(SessionData::new()).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = Reaper::new(Arc::clone(&engine), Duration::from_millis(10))
            .spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(engine.get_session(&session.id).is_err());
        assert_eq!(launcher.running_count(), 0);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
