use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ContainerState, PoolManager, create_member, destroy_container};
use crate::error::{Result, SandboxError};
use crate::labels;
use crate::runtime::short_id;

/// Outcome of one health-check tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub probed: usize,
    pub unhealthy: usize,
    pub restarted: usize,
    pub restart_failed: usize,
}

/// Runtime states a zombie can be in.
const ZOMBIE_STATES: [&str; 2] = ["exited", "dead"];

impl PoolManager {
    /// Run the health checker and the zombie sweep until `cancel` fires.
    pub fn spawn_maintenance(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let health_every = pool.config.health_interval;
            let sweep_every = pool.config.sweep_interval;
            let start = tokio::time::Instant::now();
            let mut health = tokio::time::interval_at(start + health_every, health_every);
            let mut sweep = tokio::time::interval_at(start + sweep_every, sweep_every);
            health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            info!(
                health_secs = health_every.as_secs(),
                sweep_secs = sweep_every.as_secs(),
                "pool maintenance started"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = health.tick() => {
                        let report = pool.health_check().await;
                        if report.unhealthy > 0 {
                            info!(
                                probed = report.probed,
                                unhealthy = report.unhealthy,
                                restarted = report.restarted,
                                failed = report.restart_failed,
                                "health check tick"
                            );
                        }
                    }
                    _ = sweep.tick() => {
                        if let Err(e) = pool.sweep_zombies().await {
                            warn!(error = %e, "zombie sweep failed");
                        }
                    }
                }
            }
            info!("pool maintenance stopped");
        })
    }

    /// One health-check tick.
    ///
    /// Probes every idle or busy container concurrently, marks failures (and
    /// tainted idle containers) `Unhealthy`, then replaces every unhealthy
    /// container. `Restarting` entries are left alone. Failures are logged and
    /// retried on the next tick.
    pub async fn health_check(&self) -> HealthReport {
        let mut report = HealthReport::default();
        if self.closed.load(Ordering::Acquire) {
            return report;
        }

        let targets: Vec<(u64, String)> = self
            .lock_table()
            .iter()
            .filter(|e| matches!(e.state, ContainerState::Idle | ContainerState::Busy))
            .map(|e| (e.slot, e.id.clone()))
            .collect();
        report.probed = targets.len();

        let mut probes = tokio::task::JoinSet::new();
        for (slot, id) in targets {
            let runtime = Arc::clone(&self.runtime);
            let timeout = self.config.probe_timeout;
            probes.spawn(async move {
                let healthy = match tokio::time::timeout(timeout, runtime.inspect_container(&id)).await
                {
                    Ok(Ok(status)) if status.running => true,
                    Ok(Ok(status)) => {
                        warn!(id = %short_id(&id), state = %status.state, "container not running");
                        false
                    }
                    Ok(Err(e)) => {
                        warn!(id = %short_id(&id), error = %e, "health probe failed");
                        false
                    }
                    Err(_) => {
                        warn!(id = %short_id(&id), timeout_ms = timeout.as_millis() as u64, "health probe timed out");
                        false
                    }
                };
                (slot, id, healthy)
            });
        }

        let mut failed = Vec::new();
        while let Some(result) = probes.join_next().await {
            match result {
                Ok((slot, id, false)) => failed.push((slot, id)),
                Ok(_) => {}
                Err(e) => error!(error = %e, "health probe task panicked"),
            }
        }

        let restart_slots: Vec<u64> = {
            let mut table = self.lock_table();
            for (slot, id) in &failed {
                if let Some(entry) = table.iter_mut().find(|e| e.slot == *slot && &e.id == id)
                    && matches!(entry.state, ContainerState::Idle | ContainerState::Busy)
                {
                    entry.state = ContainerState::Unhealthy;
                }
            }
            for entry in table.iter_mut() {
                if entry.tainted && entry.state == ContainerState::Idle {
                    entry.state = ContainerState::Unhealthy;
                }
            }
            table
                .iter()
                .filter(|e| e.state == ContainerState::Unhealthy)
                .map(|e| e.slot)
                .collect()
        };
        report.unhealthy = restart_slots.len();

        // Restarts for different slots are independent.
        let restarts = restart_slots.into_iter().map(|slot| self.restart(slot));
        for result in futures_util::future::join_all(restarts).await {
            match result {
                Ok(()) => report.restarted += 1,
                Err(e) => {
                    error!(error = %e, "container restart failed, retrying next tick");
                    report.restart_failed += 1;
                }
            }
        }
        report
    }

    /// Replace the unhealthy container in `slot`: stop, remove, create and
    /// start a fresh one for the same image, then mark it `Idle`.
    async fn restart(&self, slot: u64) -> Result<()> {
        let (old_id, image) = {
            let mut table = self.lock_table();
            let Some(entry) = table
                .iter_mut()
                .find(|e| e.slot == slot && e.state == ContainerState::Unhealthy)
            else {
                return Ok(());
            };
            entry.state = ContainerState::Restarting;
            (entry.id.clone(), entry.image.clone())
        };
        info!(id = %short_id(&old_id), image = %image, slot, "restarting container");

        destroy_container(self.runtime.as_ref(), &old_id, self.config.stop_grace).await;

        let limits = self.lock_limits().get(&image).cloned();
        let created = match limits {
            Some(limits) => {
                let spec = self.member_spec(&image, &limits);
                create_member(self.runtime.as_ref(), &spec).await
            }
            None => Err(SandboxError::Config(format!(
                "no resource limits recorded for image {image}"
            ))),
        };

        // Ok(Some(id)) means the slot vanished (pool shut down) and the fresh
        // container has nowhere to go.
        let outcome = {
            let mut table = self.lock_table();
            match (created, table.iter_mut().find(|e| e.slot == slot)) {
                (Ok(new_id), Some(entry)) => {
                    info!(old = %short_id(&old_id), new = %short_id(&new_id), slot, "container replaced");
                    entry.id = new_id;
                    entry.state = ContainerState::Idle;
                    entry.tainted = false;
                    entry.last_used_at = Utc::now();
                    Ok(None)
                }
                (Ok(new_id), None) => Ok(Some(new_id)),
                (Err(e), entry) => {
                    if let Some(entry) = entry {
                        entry.state = ContainerState::Unhealthy;
                    }
                    Err(e)
                }
            }
        };

        match outcome {
            Ok(None) => {
                self.counters.restarts.fetch_add(1, Ordering::Relaxed);
                self.available.notify_waiters();
                Ok(())
            }
            Ok(Some(stray)) => {
                destroy_container(self.runtime.as_ref(), &stray, self.config.stop_grace).await;
                Ok(())
            }
            Err(e) => {
                self.counters
                    .restart_failures
                    .fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Force-remove managed containers that are not pool members and have
    /// exited. Returns how many were removed.
    pub async fn sweep_zombies(&self) -> Result<usize> {
        let containers = self
            .runtime
            .list_containers(&[(labels::MANAGED, labels::TRUE)])
            .await?;

        let mut removed = 0;
        for container in containers
            .iter()
            .filter(|c| !c.has_label(labels::POOL, labels::TRUE))
            .filter(|c| ZOMBIE_STATES.contains(&c.state.as_str()))
        {
            match self.runtime.remove_container(&container.id).await {
                Ok(()) => {
                    info!(id = %short_id(&container.id), image = %container.image, "removed zombie container");
                    removed += 1;
                }
                Err(e) => {
                    warn!(id = %short_id(&container.id), error = %e, "failed to remove zombie container")
                }
            }
        }
        if removed > 0 {
            self.counters
                .zombies_removed
                .fetch_add(removed as u64, Ordering::Relaxed);
        } else {
            debug!("zombie sweep found nothing");
        }
        Ok(removed)
    }

    /// Remove pool members left behind by an earlier process. Pool
    /// membership does not survive restarts, so these are never reused.
    pub async fn reap_orphans(&self) -> Result<usize> {
        let containers = self
            .runtime
            .list_containers(&[(labels::MANAGED, labels::TRUE), (labels::POOL, labels::TRUE)])
            .await?;

        let mut removed = 0;
        for container in containers
            .iter()
            .filter(|c| !c.has_label(labels::POOL_OWNER, &self.owner))
        {
            match self.runtime.remove_container(&container.id).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(id = %short_id(&container.id), error = %e, "failed to remove orphaned pool container")
                }
            }
        }
        if removed > 0 {
            info!(removed, "removed orphaned pool containers");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::language::LanguageRegistry;
    use crate::mock::MockRuntime;
    use crate::pool::PoolConfig;
    use crate::runtime::ContainerRuntime;

    fn registry() -> LanguageRegistry {
        LanguageRegistry::from_json(
            r#"{
                "python": { "image": "python", "extension": ".py", "entry": "python3" },
                "node": { "image": "node", "extension": ".js", "entry": "node" }
            }"#,
        )
        .unwrap()
    }

    async fn warm_pool(mock: &Arc<MockRuntime>, size: usize) -> Arc<PoolManager> {
        let runtime: Arc<dyn ContainerRuntime> = mock.clone();
        let pool = Arc::new(PoolManager::new(
            runtime,
            PoolConfig {
                default_size: size,
                probe_timeout: Duration::from_millis(200),
                ..PoolConfig::default()
            },
        ));
        pool.warm_up(&registry()).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn healthy_pool_is_left_alone() {
        let mock = Arc::new(MockRuntime::new());
        let pool = warm_pool(&mock, 2).await;
        let before: Vec<_> = pool.containers().into_iter().map(|e| e.id).collect();

        let report = pool.health_check().await;
        assert_eq!(report.probed, 4);
        assert_eq!(report.unhealthy, 0);
        let after: Vec<_> = pool.containers().into_iter().map(|e| e.id).collect();
        assert_eq!(before, after);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn dead_container_is_replaced_in_same_slot() {
        let mock = Arc::new(MockRuntime::new());
        let pool = warm_pool(&mock, 1).await;
        let victim = pool
            .containers()
            .into_iter()
            .find(|e| e.image == "python")
            .unwrap();
        mock.crash(&victim.id);

        let report = pool.health_check().await;
        assert_eq!(report.unhealthy, 1);
        assert_eq!(report.restarted, 1);

        let replaced = pool
            .containers()
            .into_iter()
            .find(|e| e.slot == victim.slot)
            .unwrap();
        assert_ne!(replaced.id, victim.id);
        assert_eq!(replaced.image, "python");
        assert_eq!(replaced.state, ContainerState::Idle);
        assert!(!mock.exists(&victim.id));
        assert_eq!(pool.stats().restarts, 1);
        assert_eq!(pool.stats().total(), 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn hung_probe_counts_as_failure() {
        let mock = Arc::new(MockRuntime::new());
        let pool = warm_pool(&mock, 1).await;
        let victim = pool.containers().into_iter().next().unwrap();
        mock.hang_inspect(&victim.id);

        let report = pool.health_check().await;
        assert_eq!(report.unhealthy, 1);
        assert_eq!(report.restarted, 1);
        assert!(pool.containers().iter().all(|e| e.id != victim.id));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn failed_restart_is_retried_next_tick() {
        let mock = Arc::new(MockRuntime::new());
        let pool = warm_pool(&mock, 1).await;
        let victim = pool.containers().into_iter().next().unwrap();
        mock.crash(&victim.id);
        mock.fail_next_creates(1);

        let first = pool.health_check().await;
        assert_eq!(first.restart_failed, 1);
        let entry = pool
            .containers()
            .into_iter()
            .find(|e| e.slot == victim.slot)
            .unwrap();
        assert_eq!(entry.state, ContainerState::Unhealthy);
        assert!(pool.acquire(&victim.image).is_err());

        let second = pool.health_check().await;
        assert_eq!(second.restarted, 1);
        let entry = pool
            .containers()
            .into_iter()
            .find(|e| e.slot == victim.slot)
            .unwrap();
        assert_eq!(entry.state, ContainerState::Idle);
        assert_eq!(pool.stats().restart_failures, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn tainted_idle_container_is_replaced() {
        let mock = Arc::new(MockRuntime::new());
        let pool = warm_pool(&mock, 1).await;

        let lease = pool.acquire("node").unwrap();
        let old_id = lease.id().to_string();
        lease.mark_tainted();

        // Busy and tainted: left alone until released.
        let report = pool.health_check().await;
        assert_eq!(report.unhealthy, 0);

        drop(lease);
        let report = pool.health_check().await;
        assert_eq!(report.restarted, 1);
        let fresh = pool.acquire("node").unwrap();
        assert_ne!(fresh.id(), old_id);
        drop(fresh);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn busy_container_failing_probe_is_not_resurrected_by_release() {
        let mock = Arc::new(MockRuntime::new());
        let pool = warm_pool(&mock, 1).await;

        let lease = pool.acquire("python").unwrap();
        let old_id = lease.id().to_string();
        mock.crash(&old_id);

        let report = pool.health_check().await;
        assert_eq!(report.restarted, 1);

        drop(lease);
        let containers = pool.containers();
        assert!(containers.iter().all(|e| e.id != old_id));
        assert_eq!(pool.stats().idle, 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_removes_only_exited_non_pool_containers() {
        let mock = Arc::new(MockRuntime::new());
        let pool = warm_pool(&mock, 1).await;

        let exited = mock.add_foreign(labels::ephemeral(), "exited");
        let running = mock.add_foreign(labels::ephemeral(), "running");
        let unmanaged = mock.add_foreign(Default::default(), "exited");
        // A crashed pool member is the health checker's job, not the sweep's.
        let member = pool.containers().into_iter().next().unwrap();
        mock.crash(&member.id);

        let removed = pool.sweep_zombies().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!mock.exists(&exited));
        assert!(mock.exists(&running));
        assert!(mock.exists(&unmanaged));
        assert!(mock.exists(&member.id));
        assert_eq!(pool.stats().zombies_removed, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn reap_orphans_skips_own_members() {
        let mock = Arc::new(MockRuntime::new());
        let pool = warm_pool(&mock, 1).await;
        let orphan = mock.add_foreign(labels::pool_member("python", "previous-run"), "running");

        let removed = pool.reap_orphans().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!mock.exists(&orphan));
        assert_eq!(mock.live_count(), 2);
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_loop_heals_and_stops_on_cancel() {
        let mock = Arc::new(MockRuntime::new());
        let pool = warm_pool(&mock, 1).await;
        let victim = pool.containers().into_iter().next().unwrap();
        mock.crash(&victim.id);

        let cancel = CancellationToken::new();
        let handle = pool.spawn_maintenance(cancel.clone());
        tokio::time::sleep(pool.config().health_interval + Duration::from_secs(1)).await;
        assert!(pool.stats().restarts >= 1);

        cancel.cancel();
        handle.await.unwrap();
        pool.shutdown().await;
    }
}
