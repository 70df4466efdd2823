//! Configuration of an ingestion task.

use data_types::{FabricUrl, IncrementalPushPolicy, Topic};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Server-level ingestion options.
#[derive(Debug, Clone)]
pub struct IngesterConfig {
    /// How long a promoting partition must see no traffic on the version
    /// topic before it may take over as leader.
    pub promotion_to_leader_delay: Duration,

    /// Same as [`Self::promotion_to_leader_delay`], for system stores, which
    /// tolerate a much shorter handoff window.
    pub system_store_promotion_to_leader_delay: Duration,

    /// Deadline for a subscribed partition to finish bootstrapping before the
    /// push is failed.
    pub bootstrap_timeout: Duration,

    /// Total bytes the drainer queues may hold before consumption blocks.
    pub buffer_memory_capacity: usize,

    /// Blocked producers are only woken once at least this many bytes have
    /// been freed, so a stream of small records cannot starve a large one.
    pub buffer_notify_delta: usize,

    /// Number of drainer workers; partitions hash onto workers.
    pub drainer_pool_size: usize,

    /// Whether leaders may bootstrap from a remote fabric's version topic.
    pub native_replication_enabled: bool,

    /// Whether partial-update records are accepted.
    pub write_computation_enabled: bool,

    /// Known upstream clusters by id.
    pub cluster_id_to_url: BTreeMap<u32, FabricUrl>,

    /// The fabric this host lives on.
    pub local_url: FabricUrl,

    /// Cap on waiting for an in-flight persist future during demotions and
    /// topic switches. Hitting it is a benign producer failure.
    pub future_wait_timeout: Duration,

    /// How long upstream end-offset and timestamp lookups may be served from
    /// cache.
    pub upstream_metadata_ttl: Duration,

    /// Hybrid partitions are advertised ready once their replication lag
    /// drops to this many records.
    pub ready_to_serve_lag_budget: i64,

    /// Loop pacing when all upstreams are idle.
    pub idle_poll_backoff: Duration,
}

impl IngesterConfig {
    /// Validate cross-field invariants.
    ///
    /// # Panics
    ///
    /// Panics if `buffer_notify_delta >= buffer_memory_capacity` or the
    /// drainer pool is empty, both of which would wedge ingestion.
    pub fn validated(self) -> Self {
        assert!(
            self.buffer_notify_delta < self.buffer_memory_capacity,
            "notify delta {} must be below buffer capacity {}",
            self.buffer_notify_delta,
            self.buffer_memory_capacity
        );
        assert!(self.drainer_pool_size > 0, "drainer pool must not be empty");
        self
    }
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            promotion_to_leader_delay: Duration::from_secs(300),
            system_store_promotion_to_leader_delay: Duration::from_secs(60),
            bootstrap_timeout: Duration::from_secs(24 * 60 * 60),
            buffer_memory_capacity: 125 * 1024 * 1024,
            buffer_notify_delta: 10 * 1024 * 1024,
            drainer_pool_size: 8,
            native_replication_enabled: false,
            write_computation_enabled: false,
            cluster_id_to_url: BTreeMap::new(),
            local_url: FabricUrl::from("local://"),
            future_wait_timeout: Duration::from_secs(60),
            upstream_metadata_ttl: Duration::from_secs(30),
            ready_to_serve_lag_budget: 1_000,
            idle_poll_backoff: Duration::from_millis(10),
        }
    }
}

/// Per-store-version facts the task needs. Mutable flags are updated by the
/// control plane while the task runs.
#[derive(Debug)]
pub struct StoreContext {
    /// Store name.
    pub store_name: String,
    /// Version this task ingests.
    pub version: u32,
    /// Whether this is a system store (shorter promotion handoff).
    pub system_store: bool,
    /// Whether the store takes nearline writes through a real-time topic.
    pub hybrid: bool,
    /// Whether partial updates are enabled for this store.
    pub write_compute_enabled: bool,
    /// Version-topic sub-partitions per user partition.
    pub amplification_factor: u32,
    /// How incremental pushes reach this version.
    pub incremental_push_policy: IncrementalPushPolicy,
    /// Whether this version currently serves reads.
    current_version: AtomicBool,
    /// Set while the store is the duplicate side of a migration; promotions
    /// pause until it clears.
    migration_duplicate: AtomicBool,
}

impl StoreContext {
    /// Context for a batch-only store version.
    pub fn new(store_name: impl Into<String>, version: u32) -> Self {
        Self {
            store_name: store_name.into(),
            version,
            system_store: false,
            hybrid: false,
            write_compute_enabled: false,
            amplification_factor: 1,
            incremental_push_policy: IncrementalPushPolicy::default(),
            current_version: AtomicBool::new(false),
            migration_duplicate: AtomicBool::new(false),
        }
    }

    /// Mark the store hybrid.
    pub fn with_hybrid(mut self, hybrid: bool) -> Self {
        self.hybrid = hybrid;
        self
    }

    /// Enable partial updates.
    pub fn with_write_compute(mut self, enabled: bool) -> Self {
        self.write_compute_enabled = enabled;
        self
    }

    /// Set the amplification factor.
    pub fn with_amplification_factor(mut self, factor: u32) -> Self {
        assert!(factor > 0, "amplification factor must be positive");
        self.amplification_factor = factor;
        self
    }

    /// Mark the store as a system store.
    pub fn with_system_store(mut self, system_store: bool) -> Self {
        self.system_store = system_store;
        self
    }

    /// The version topic this task ingests into.
    pub fn version_topic(&self) -> Topic {
        Topic::version_topic(&self.store_name, self.version)
    }

    /// Whether this version currently serves reads.
    pub fn is_current_version(&self) -> bool {
        self.current_version.load(Ordering::SeqCst)
    }

    /// Flip the current-version flag.
    pub fn set_current_version(&self, current: bool) {
        self.current_version.store(current, Ordering::SeqCst);
    }

    /// Whether the store is the duplicate side of a migration.
    pub fn is_migration_duplicate(&self) -> bool {
        self.migration_duplicate.load(Ordering::SeqCst)
    }

    /// Flip the migration-duplicate flag.
    pub fn set_migration_duplicate(&self, duplicate: bool) {
        self.migration_duplicate.store(duplicate, Ordering::SeqCst);
    }
}
