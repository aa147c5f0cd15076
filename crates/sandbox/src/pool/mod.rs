mod lease;
mod maintenance;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

pub use lease::Lease;
pub use maintenance::HealthReport;

use crate::config::{ResourceLimits, WORKSPACE_DIR};
use crate::error::{Result, SandboxError};
use crate::labels;
use crate::language::LanguageRegistry;
use crate::runtime::{ContainerRuntime, ContainerSpec, short_id};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_POOL_SIZE: usize = 1;
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

/// Pool members idle on this until an exec arrives.
const KEEPALIVE_COMMAND: [&str; 3] = ["tail", "-f", "/dev/null"];

// ---------------------------------------------------------------------------
// Pool entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Idle,
    Busy,
    Unhealthy,
    Restarting,
}

/// One live container tracked by the pool. Owned by [`PoolManager`];
/// borrowers only ever see it through a [`Lease`].
#[derive(Debug, Clone)]
pub struct PooledContainer {
    /// Logical position in the pool. Survives restarts; the id does not.
    pub slot: u64,
    pub id: String,
    pub image: String,
    pub state: ContainerState,
    pub last_used_at: DateTime<Utc>,
    /// Killed at a deadline; possibly dirty, replaced on the next health tick.
    pub tainted: bool,
}

// ---------------------------------------------------------------------------
// Configuration and statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Containers per language when `sizes` has no entry for it.
    pub default_size: usize,
    /// Per-language pool size, keyed by language id.
    pub sizes: HashMap<String, usize>,
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    pub sweep_interval: Duration,
    pub stop_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_size: DEFAULT_POOL_SIZE,
            sizes: HashMap::new(),
            health_interval: DEFAULT_HEALTH_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicU64,
    rejected: AtomicU64,
    released: AtomicU64,
    restarts: AtomicU64,
    restart_failures: AtomicU64,
    zombies_removed: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub busy: usize,
    pub unhealthy: usize,
    pub restarting: usize,
    pub acquired: u64,
    pub rejected: u64,
    pub released: u64,
    pub restarts: u64,
    pub restart_failures: u64,
    pub zombies_removed: u64,
}

impl PoolStats {
    pub fn total(&self) -> usize {
        self.idle + self.busy + self.unhealthy + self.restarting
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmUpReport {
    pub created: usize,
    pub failed: usize,
    /// Images that still have no container after warm-up.
    pub empty_images: Vec<String>,
}

// ---------------------------------------------------------------------------
// PoolManager
// ---------------------------------------------------------------------------

/// Bounded set of live, reusable containers per image.
///
/// The container table is a plain `Vec` behind one `std::sync::Mutex`; the
/// lock is never held across an `.await`. `acquire` is a linear scan that
/// either flips an `Idle` entry to `Busy` or reports `NoCapacity` at once.
/// Background maintenance (health probes, restarts, zombie sweeps) lives in
/// `maintenance.rs`.
pub struct PoolManager {
    runtime: Arc<dyn ContainerRuntime>,
    config: PoolConfig,
    /// Written into `cee.pool.owner` so a restarted process can tell its own
    /// pool members from leftovers.
    owner: String,
    table: Mutex<Vec<PooledContainer>>,
    /// Resource envelope per image, used for warm-up and replacements.
    limits: Mutex<HashMap<String, ResourceLimits>>,
    available: Notify,
    warm_lock: tokio::sync::Mutex<()>,
    next_slot: AtomicU64,
    counters: Counters,
    closed: AtomicBool,
}

impl PoolManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: PoolConfig) -> Self {
        Self {
            runtime,
            config,
            owner: uuid::Uuid::new_v4().to_string(),
            table: Mutex::new(Vec::new()),
            limits: Mutex::new(HashMap::new()),
            available: Notify::new(),
            warm_lock: tokio::sync::Mutex::new(()),
            next_slot: AtomicU64::new(0),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Bring every image up to its configured size.
    ///
    /// Counts containers in any state, so calling it again only fills the
    /// deficit left by failed creations. Creation failures are logged and
    /// reported; they do not abort warm-up of other images.
    pub async fn warm_up(&self, registry: &LanguageRegistry) -> Result<WarmUpReport> {
        let _guard = self.warm_lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(SandboxError::runtime("warm_up", "pool is shut down"));
        }

        let targets = self.targets(registry);
        {
            let mut limits = self.lock_limits();
            for (image, (_, image_limits)) in &targets {
                limits.insert(image.clone(), image_limits.clone());
            }
        }

        let mut report = WarmUpReport::default();
        let mut join_set = tokio::task::JoinSet::new();
        for (image, (target, image_limits)) in &targets {
            let existing = self.lock_table().iter().filter(|e| &e.image == image).count();
            let deficit = target.saturating_sub(existing);
            if deficit == 0 {
                debug!(image = %image, existing, "pool already at target size");
                continue;
            }

            if let Err(e) = self.runtime.ensure_image(image).await {
                error!(image = %image, error = %e, "failed to ensure image, skipping");
                report.failed += deficit;
                continue;
            }

            info!(image = %image, existing, deficit, "warming up pool");
            for _ in 0..deficit {
                let runtime = Arc::clone(&self.runtime);
                let spec = self.member_spec(image, image_limits);
                join_set.spawn(async move {
                    let id = create_member(runtime.as_ref(), &spec).await?;
                    Ok::<_, SandboxError>((spec.image, id))
                });
            }
        }

        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(Ok((image, id))) => {
                    self.insert_idle(image, id);
                    report.created += 1;
                }
                Ok(Err(e)) => {
                    error!(error = %e, "failed to create pool container");
                    report.failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "pool container creation task panicked");
                    report.failed += 1;
                }
            }
        }

        {
            let table = self.lock_table();
            report.empty_images = targets
                .keys()
                .filter(|image| !table.iter().any(|e| &e.image == *image))
                .cloned()
                .collect();
        }
        if !report.empty_images.is_empty() {
            warn!(
                images = ?report.empty_images,
                "pool warm-up left images without any container"
            );
        }
        info!(
            created = report.created,
            failed = report.failed,
            total = self.lock_table().len(),
            "pool warm-up complete"
        );
        Ok(report)
    }

    /// Borrow an idle container for `image`, or fail with `NoCapacity`.
    ///
    /// Never waits: the only blocking is the table lock.
    pub fn acquire(self: &Arc<Self>, image: &str) -> Result<Lease> {
        match self.try_acquire(image) {
            Some(lease) => Ok(lease),
            None => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(image = %image, "no idle container");
                Err(SandboxError::NoCapacity {
                    image: image.to_string(),
                })
            }
        }
    }

    /// Like [`acquire`](Self::acquire), but waits up to `wait` for a release.
    pub async fn acquire_within(self: &Arc<Self>, image: &str, wait: Duration) -> Result<Lease> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_acquire(image) {
                return Ok(lease);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.acquire(image);
            }
        }
    }

    fn try_acquire(self: &Arc<Self>, image: &str) -> Option<Lease> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let mut table = self.lock_table();
        // Clean containers first; a tainted one is still usable until replaced.
        let index = table
            .iter()
            .position(|e| e.image == image && e.state == ContainerState::Idle && !e.tainted)
            .or_else(|| {
                table
                    .iter()
                    .position(|e| e.image == image && e.state == ContainerState::Idle)
            })?;
        let entry = table.get_mut(index)?;
        entry.state = ContainerState::Busy;
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        debug!(id = %short_id(&entry.id), image = %image, slot = entry.slot, "acquired container");
        Some(Lease::new(
            Arc::clone(self),
            entry.id.clone(),
            entry.image.clone(),
        ))
    }

    /// Return a borrowed container as clean. Dropping the lease instead
    /// returns it tainted.
    pub fn release(&self, lease: Lease) {
        lease.release();
    }

    /// Busy → Idle for the container with this id.
    ///
    /// If the health checker took the container away meanwhile (marked it
    /// unhealthy or already replaced it), only the timestamp is touched.
    fn release_entry(&self, id: &str) {
        let mut table = self.lock_table();
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        match table.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.last_used_at = Utc::now();
                if entry.state == ContainerState::Busy {
                    entry.state = ContainerState::Idle;
                    debug!(id = %short_id(id), "released container");
                } else {
                    debug!(id = %short_id(id), state = ?entry.state, "released container not busy");
                }
            }
            None => debug!(id = %short_id(id), "released container no longer tracked"),
        }
        drop(table);
        self.available.notify_waiters();
    }

    fn mark_tainted(&self, id: &str) {
        if let Some(entry) = self.lock_table().iter_mut().find(|e| e.id == id) {
            entry.tainted = true;
            info!(id = %short_id(id), "container tainted, scheduled for replacement");
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for entry in self.lock_table().iter() {
            match entry.state {
                ContainerState::Idle => stats.idle += 1,
                ContainerState::Busy => stats.busy += 1,
                ContainerState::Unhealthy => stats.unhealthy += 1,
                ContainerState::Restarting => stats.restarting += 1,
            }
        }
        stats.acquired = self.counters.acquired.load(Ordering::Relaxed);
        stats.rejected = self.counters.rejected.load(Ordering::Relaxed);
        stats.released = self.counters.released.load(Ordering::Relaxed);
        stats.restarts = self.counters.restarts.load(Ordering::Relaxed);
        stats.restart_failures = self.counters.restart_failures.load(Ordering::Relaxed);
        stats.zombies_removed = self.counters.zombies_removed.load(Ordering::Relaxed);
        stats
    }

    /// Snapshot of the container table.
    pub fn containers(&self) -> Vec<PooledContainer> {
        self.lock_table().clone()
    }

    /// Stop and remove every tracked container. Later acquires report
    /// `NoCapacity`. Background maintenance must be cancelled by the caller.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = self.warm_lock.lock().await;
        let entries: Vec<PooledContainer> = self.lock_table().drain(..).collect();
        info!(count = entries.len(), "shutting down container pool");

        let mut join_set = tokio::task::JoinSet::new();
        for entry in entries {
            let runtime = Arc::clone(&self.runtime);
            let grace = self.config.stop_grace;
            join_set.spawn(async move {
                destroy_container(runtime.as_ref(), &entry.id, grace).await;
            });
        }
        while let Some(result) = join_set.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "container teardown task panicked");
            }
        }
        self.available.notify_waiters();
        info!("container pool shutdown complete");
    }

    // -- internals shared with maintenance --

    /// Per image: target size and the widest resource envelope among the
    /// languages that use it.
    fn targets(&self, registry: &LanguageRegistry) -> BTreeMap<String, (usize, ResourceLimits)> {
        let mut targets: BTreeMap<String, (usize, ResourceLimits)> = BTreeMap::new();
        for descriptor in registry.iter() {
            let size = self
                .config
                .sizes
                .get(&descriptor.id)
                .copied()
                .unwrap_or(self.config.default_size);
            let limits = ResourceLimits::for_descriptor(descriptor);
            targets
                .entry(descriptor.image.clone())
                .and_modify(|(target, current)| {
                    *target = (*target).max(size);
                    widen(current, &limits);
                })
                .or_insert((size, limits));
        }
        targets
    }

    fn member_spec(&self, image: &str, limits: &ResourceLimits) -> ContainerSpec {
        ContainerSpec {
            image: image.to_string(),
            command: KEEPALIVE_COMMAND.iter().map(|s| s.to_string()).collect(),
            labels: labels::pool_member(image, &self.owner),
            workdir: Some(WORKSPACE_DIR.to_string()),
            resources: limits.clone(),
            network_disabled: true,
            scratch_volume: Some(WORKSPACE_DIR.to_string()),
            binds: Vec::new(),
        }
    }

    fn insert_idle(&self, image: String, id: String) {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        info!(id = %short_id(&id), image = %image, slot, "pool container ready");
        self.lock_table().push(PooledContainer {
            slot,
            id,
            image,
            state: ContainerState::Idle,
            last_used_at: Utc::now(),
            tainted: false,
        });
        self.available.notify_waiters();
    }

    fn lock_table(&self) -> MutexGuard<'_, Vec<PooledContainer>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_limits(&self) -> MutexGuard<'_, HashMap<String, ResourceLimits>> {
        self.limits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        let remaining = self.table.get_mut().map(|t| t.len()).unwrap_or_default();
        if !self.closed.load(Ordering::Acquire) && remaining > 0 {
            warn!(remaining, "PoolManager dropped without calling shutdown()");
        }
    }
}

/// Merge `other` into `current`, keeping the more permissive value of each
/// limit. A shared image must be able to run every language that uses it.
fn widen(current: &mut ResourceLimits, other: &ResourceLimits) {
    current.memory_bytes = current.memory_bytes.max(other.memory_bytes);
    current.nano_cpus = current.nano_cpus.max(other.nano_cpus);
    current.pids_limit = current.pids_limit.max(other.pids_limit);
    current.readonly_rootfs = current.readonly_rootfs && other.readonly_rootfs;
    for limit in &other.ulimits {
        match current.ulimits.iter_mut().find(|u| u.name == limit.name) {
            Some(existing) => {
                existing.soft = existing.soft.max(limit.soft);
                existing.hard = existing.hard.max(limit.hard);
            }
            None => current.ulimits.push(limit.clone()),
        }
    }
}

/// Create and start one pool member. A container that fails to start is
/// removed before the error is returned.
async fn create_member(runtime: &dyn ContainerRuntime, spec: &ContainerSpec) -> Result<String> {
    let id = runtime.create_container(spec).await?;
    if let Err(e) = runtime.start_container(&id).await {
        if let Err(remove_err) = runtime.remove_container(&id).await {
            warn!(id = %short_id(&id), error = %remove_err, "failed to remove unstartable container");
        }
        return Err(e);
    }
    Ok(id)
}

/// Best-effort stop + force remove.
async fn destroy_container(runtime: &dyn ContainerRuntime, id: &str, grace: Duration) {
    if let Err(e) = runtime.stop_container(id, grace).await {
        debug!(id = %short_id(id), error = %e, "stop failed, removing anyway");
    }
    if let Err(e) = runtime.remove_container(id).await {
        warn!(id = %short_id(id), error = %e, "failed to remove container");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRuntime;

    fn registry() -> LanguageRegistry {
        LanguageRegistry::from_json(
            r#"{
                "python": { "image": "python", "extension": ".py", "entry": "python3" },
                "node": { "image": "node", "extension": ".js", "entry": "node" },
                "go": { "image": "golang", "extension": ".go", "entry": ["go", "run", "{code}"], "compiled": true }
            }"#,
        )
        .unwrap()
    }

    fn pool_with(mock: &Arc<MockRuntime>, config: PoolConfig) -> Arc<PoolManager> {
        let runtime: Arc<dyn ContainerRuntime> = mock.clone();
        Arc::new(PoolManager::new(runtime, config))
    }

    fn sized(size: usize) -> PoolConfig {
        PoolConfig {
            default_size: size,
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn warm_up_creates_configured_size_per_image() {
        let mock = Arc::new(MockRuntime::new());
        let pool = pool_with(&mock, sized(2));

        let report = pool.warm_up(&registry()).await.unwrap();
        assert_eq!(report.created, 6);
        assert_eq!(report.failed, 0);
        assert!(report.empty_images.is_empty());

        let stats = pool.stats();
        assert_eq!(stats.idle, 6);
        assert_eq!(mock.running_count(), 6);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn warm_up_is_idempotent() {
        let mock = Arc::new(MockRuntime::new());
        let pool = pool_with(&mock, sized(2));

        pool.warm_up(&registry()).await.unwrap();
        let second = pool.warm_up(&registry()).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(pool.stats().total(), 6);
        assert_eq!(mock.created_count(), 6);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn warm_up_fills_deficit_after_failures() {
        let mock = Arc::new(MockRuntime::new());
        mock.fail_next_creates(2);
        let pool = pool_with(&mock, sized(2));

        let first = pool.warm_up(&registry()).await.unwrap();
        assert_eq!(first.created, 4);
        assert_eq!(first.failed, 2);

        let second = pool.warm_up(&registry()).await.unwrap();
        assert_eq!(second.created, 2);
        assert_eq!(pool.stats().idle, 6);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn warm_up_reports_images_left_empty() {
        let mock = Arc::new(MockRuntime::new());
        mock.fail_image("golang");
        let pool = pool_with(&mock, sized(1));

        let report = pool.warm_up(&registry()).await.unwrap();
        assert_eq!(report.empty_images, vec!["golang".to_string()]);
        assert_eq!(pool.stats().idle, 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn per_language_sizes_take_max_for_shared_image() {
        let mock = Arc::new(MockRuntime::new());
        let registry = LanguageRegistry::from_json(
            r#"{
                "python": { "image": "poly", "extension": ".py", "entry": "python3" },
                "ruby": { "image": "poly", "extension": ".rb", "entry": "ruby", "compiled": true }
            }"#,
        )
        .unwrap();
        let pool = pool_with(
            &mock,
            PoolConfig {
                default_size: 1,
                sizes: HashMap::from([("ruby".to_string(), 3)]),
                ..PoolConfig::default()
            },
        );

        pool.warm_up(&registry).await.unwrap();
        assert_eq!(pool.stats().idle, 3);
        // The shared image runs a compiled language, so its root stays writable.
        let spec = mock.last_spec().unwrap();
        assert!(!spec.resources.readonly_rootfs);
        assert_eq!(spec.resources.pids_limit, 256);
        assert!(spec.network_disabled);
        assert_eq!(spec.scratch_volume.as_deref(), Some(WORKSPACE_DIR));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn acquire_marks_busy_and_exhaustion_is_explicit() {
        let mock = Arc::new(MockRuntime::new());
        let pool = pool_with(&mock, sized(1));
        pool.warm_up(&registry()).await.unwrap();

        let lease = pool.acquire("python").unwrap();
        assert_eq!(lease.image(), "python");
        assert_eq!(pool.stats().busy, 1);

        let err = pool.acquire("python").unwrap_err();
        assert!(matches!(err, SandboxError::NoCapacity { ref image } if image == "python"));
        assert!(err.is_retryable());

        // Unknown images have no capacity either.
        assert!(pool.acquire("cobol").is_err());
        assert_eq!(pool.stats().rejected, 2);

        drop(lease);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn release_returns_container_to_idle() {
        let mock = Arc::new(MockRuntime::new());
        let pool = pool_with(&mock, sized(1));
        pool.warm_up(&registry()).await.unwrap();

        let lease = pool.acquire("node").unwrap();
        let id = lease.id().to_string();
        let before = pool.containers();
        pool.release(lease);

        let stats = pool.stats();
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.released, 1);
        let after = pool.containers();
        let entry = after.iter().find(|e| e.id == id).unwrap();
        assert_eq!(entry.state, ContainerState::Idle);
        let earlier = before.iter().find(|e| e.id == id).unwrap();
        assert!(entry.last_used_at >= earlier.last_used_at);

        // Same container is handed out again.
        let again = pool.acquire("node").unwrap();
        assert_eq!(again.id(), id);
        drop(again);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn dropping_lease_releases() {
        let mock = Arc::new(MockRuntime::new());
        let pool = pool_with(&mock, sized(1));
        pool.warm_up(&registry()).await.unwrap();

        {
            let _lease = pool.acquire("python").unwrap();
            assert_eq!(pool.stats().busy, 1);
        }
        assert_eq!(pool.stats().busy, 0);
        assert_eq!(pool.stats().idle, 3);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn lease_released_when_borrower_panics() {
        let mock = Arc::new(MockRuntime::new());
        let pool = pool_with(&mock, sized(1));
        pool.warm_up(&registry()).await.unwrap();

        let borrower = Arc::clone(&pool);
        let result = tokio::spawn(async move {
            let _lease = borrower.acquire("python").unwrap();
            panic!("borrower blew up");
        })
        .await;
        assert!(result.is_err());
        assert_eq!(pool.stats().busy, 0);
        assert!(pool.acquire("python").is_ok());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_acquires_never_share_a_container() {
        let mock = Arc::new(MockRuntime::new());
        let pool = pool_with(&mock, sized(3));
        pool.warm_up(&registry()).await.unwrap();

        let mut join_set = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            join_set.spawn(async move { pool.acquire("python").ok() });
        }
        let mut leases = Vec::new();
        while let Some(result) = join_set.join_next().await {
            if let Some(lease) = result.unwrap() {
                leases.push(lease);
            }
        }
        assert_eq!(leases.len(), 3);
        let mut ids: Vec<_> = leases.iter().map(|l| l.id().to_string()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert_eq!(pool.stats().rejected, 13);

        drop(leases);
        assert_eq!(pool.stats().idle, 9);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn acquire_within_waits_for_release() {
        let mock = Arc::new(MockRuntime::new());
        let pool = pool_with(&mock, sized(1));
        pool.warm_up(&registry()).await.unwrap();

        let first = pool.acquire("python").unwrap();
        let first_id = first.id().to_string();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(
                async move { pool.acquire_within("python", Duration::from_secs(5)).await },
            )
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(first);

        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.id(), first_id);
        drop(second);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn acquire_within_times_out_with_no_capacity() {
        let mock = Arc::new(MockRuntime::new());
        let pool = pool_with(&mock, sized(1));
        pool.warm_up(&registry()).await.unwrap();

        let held = pool.acquire("python").unwrap();
        let err = pool
            .acquire_within("python", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::NoCapacity { .. }));
        drop(held);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn clean_containers_preferred_over_tainted() {
        let mock = Arc::new(MockRuntime::new());
        let pool = pool_with(&mock, sized(2));
        pool.warm_up(&registry()).await.unwrap();

        let lease = pool.acquire("python").unwrap();
        let tainted_id = lease.id().to_string();
        lease.mark_tainted();
        drop(lease);

        let next = pool.acquire("python").unwrap();
        assert_ne!(next.id(), tainted_id);
        // Tainted one is still usable when nothing else is idle.
        let fallback = pool.acquire("python").unwrap();
        assert_eq!(fallback.id(), tainted_id);
        drop((next, fallback));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_removes_everything_and_rejects_acquire() {
        let mock = Arc::new(MockRuntime::new());
        let pool = pool_with(&mock, sized(1));
        pool.warm_up(&registry()).await.unwrap();

        pool.shutdown().await;
        assert_eq!(pool.stats().total(), 0);
        assert_eq!(mock.live_count(), 0);
        assert!(pool.acquire("python").is_err());
        assert!(pool.warm_up(&registry()).await.is_err());
    }

    #[test]
    fn widen_keeps_most_permissive_limits() {
        let registry = registry();
        let mut python = ResourceLimits::for_descriptor(registry.lookup("python").unwrap());
        let go = ResourceLimits::for_descriptor(registry.lookup("go").unwrap());
        widen(&mut python, &go);
        assert_eq!(python.nano_cpus, go.nano_cpus);
        assert_eq!(python.pids_limit, go.pids_limit);
        assert!(!python.readonly_rootfs);
        assert_eq!(python.ulimits.len(), 4);
    }
}
