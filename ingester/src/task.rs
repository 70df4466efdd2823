//! The per-store-version ingestion task.
//!
//! One task owns the action queue, the upstream poll loop, the partition
//! state machine, and the deadline-driven long-running-task checker. Role
//! fields of a partition's state are mutated only here; drainers and produce
//! completions touch offsets and persist signals through the shared handles.

use crate::actions::{ActionKind, ActionQueue, IngestionAction};
use crate::completion::{CompletionSignal, WaitResult};
use crate::config::{IngesterConfig, StoreContext};
use crate::delegator::UpdateApplier;
use crate::drainer::{DrainerDeps, DrainerPool};
use crate::error::{ErrorSink, IngestError, Result};
use crate::gateway::ProducerGateway;
use crate::metrics::IngesterMetrics;
use crate::offsets::OffsetMetadataStore;
use crate::pcs::{PartitionConsumptionState, PartitionState, SharedPcs};
use crate::status::StatusReporter;
use crate::upstream_cache::UpstreamMetadataCache;
use clock::TimeProvider;
use data_types::{FabricUrl, PartitionId, Topic, TopicSwitch, LOWEST_OFFSET};
use parking_lot::{Mutex, RwLock};
use pubsub::{ProducerProvider, TopicConsumer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use storage::StorageEngine;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything needed to assemble an [`IngestionTask`].
#[derive(Debug)]
pub struct IngestionTaskParams {
    /// Server configuration.
    pub config: IngesterConfig,
    /// The store version this task ingests.
    pub store: Arc<StoreContext>,
    /// Identity of this host, stamped into leader footers.
    pub host_id: String,
    /// Upstream log client.
    pub consumer: Arc<dyn TopicConsumer>,
    /// Local storage engine of this store version.
    pub storage: Arc<dyn StorageEngine>,
    /// Source of the version-topic producer.
    pub producer_provider: Arc<dyn ProducerProvider>,
    /// Status reporting seam.
    pub status: Arc<dyn StatusReporter>,
    /// Clock.
    pub time: Arc<dyn TimeProvider>,
    /// Metric registry.
    pub registry: Arc<metric::Registry>,
    /// Merge function of the partial-update path, when enabled.
    pub update_applier: Option<Arc<dyn UpdateApplier>>,
    /// Fabric hosting the remote version topic, when native replication may
    /// bootstrap from one.
    pub remote_vt_url: Option<FabricUrl>,
}

/// The per-version ingestion task.
#[derive(Debug)]
pub struct IngestionTask {
    pub(crate) config: IngesterConfig,
    pub(crate) store: Arc<StoreContext>,
    pub(crate) version_topic: Topic,
    pub(crate) consumer: Arc<dyn TopicConsumer>,
    pub(crate) storage: Arc<dyn StorageEngine>,
    pub(crate) meta: Arc<OffsetMetadataStore>,
    pub(crate) upstream_meta: UpstreamMetadataCache,
    pub(crate) gateway: Arc<ProducerGateway>,
    pub(crate) drainers: DrainerPool,
    pub(crate) partitions: RwLock<HashMap<u32, SharedPcs>>,
    pub(crate) actions: ActionQueue,
    pub(crate) errors: Arc<ErrorSink>,
    pub(crate) status: Arc<dyn StatusReporter>,
    pub(crate) time: Arc<dyn TimeProvider>,
    pub(crate) metrics: IngesterMetrics,
    pub(crate) update_applier: Option<Arc<dyn UpdateApplier>>,
    pub(crate) remote_vt_url: Option<FabricUrl>,
    sessions: Mutex<HashMap<u32, u64>>,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl IngestionTask {
    /// Assemble a task. Must run inside a tokio runtime; the drainer pool
    /// spawns its workers immediately.
    pub fn new(params: IngestionTaskParams) -> Arc<Self> {
        let IngestionTaskParams {
            config,
            store,
            host_id,
            consumer,
            storage,
            producer_provider,
            status,
            time,
            registry,
            update_applier,
            remote_vt_url,
        } = params;
        let config = config.validated();

        let version_topic = store.version_topic();
        let metrics = IngesterMetrics::new(&registry);
        let meta = Arc::new(OffsetMetadataStore::new(Arc::clone(&storage)));
        let errors = Arc::new(ErrorSink::new());

        let drainers = DrainerPool::new(
            config.drainer_pool_size,
            config.buffer_memory_capacity,
            config.buffer_notify_delta,
            Arc::new(DrainerDeps {
                storage: Arc::clone(&storage),
                meta: Arc::clone(&meta),
                status: Arc::clone(&status),
                errors: Arc::clone(&errors),
                metrics: metrics.clone(),
            }),
        );

        let gateway = Arc::new(ProducerGateway::new(
            producer_provider,
            version_topic.clone(),
            host_id,
            Arc::clone(&time),
        ));

        let upstream_meta = UpstreamMetadataCache::new(
            Arc::clone(&consumer),
            Arc::clone(&time),
            config.upstream_metadata_ttl,
        );

        Arc::new(Self {
            config,
            store,
            version_topic,
            consumer,
            storage,
            meta,
            upstream_meta,
            gateway,
            drainers,
            partitions: RwLock::new(HashMap::new()),
            actions: ActionQueue::new(),
            errors: Arc::clone(&errors),
            status,
            time,
            metrics,
            update_applier,
            remote_vt_url,
            sessions: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(true),
        })
    }

    fn bump_session(&self, partition: PartitionId) -> u64 {
        let mut sessions = self.sessions.lock();
        let session = sessions.entry(partition.get()).or_insert(0);
        *session += 1;
        *session
    }

    pub(crate) fn current_session(&self, partition: PartitionId) -> u64 {
        *self.sessions.lock().get(&partition.get()).unwrap_or(&0)
    }

    fn submit(&self, kind: ActionKind, partition: PartitionId, session_id: u64) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(IngestError::NotRunning);
        }
        self.actions.push(IngestionAction {
            kind,
            partition,
            session_id,
        });
        Ok(())
    }

    /// Start tailing the version topic on `partition`.
    pub fn subscribe(&self, partition: PartitionId) -> Result<()> {
        let session = self.bump_session(partition);
        self.submit(ActionKind::Subscribe, partition, session)
    }

    /// Stop consuming `partition` and drop its in-memory state.
    pub fn unsubscribe(&self, partition: PartitionId) -> Result<()> {
        let session = self.bump_session(partition);
        self.submit(ActionKind::Unsubscribe, partition, session)
    }

    /// Request promotion of `partition`. The promotion completes later, once
    /// the version topic quiesces.
    pub fn standby_to_leader(&self, partition: PartitionId) -> Result<()> {
        // captures the current session: any later role command invalidates
        // this promotion
        let session = self.current_session(partition);
        self.submit(ActionKind::StandbyToLeader, partition, session)
    }

    /// Demote `partition` back to standby.
    pub fn leader_to_standby(&self, partition: PartitionId) -> Result<()> {
        let session = self.bump_session(partition);
        self.submit(ActionKind::LeaderToStandby, partition, session)
    }

    /// Unsubscribe `partition` and delete its local state.
    pub fn drop_partition(&self, partition: PartitionId) -> Result<()> {
        let session = self.bump_session(partition);
        self.submit(ActionKind::DropPartition, partition, session)
    }

    pub(crate) fn pcs(&self, partition: PartitionId) -> Option<SharedPcs> {
        self.partitions.read().get(&partition.get()).map(Arc::clone)
    }

    fn partitions_snapshot(&self) -> Vec<(PartitionId, SharedPcs)> {
        self.partitions
            .read()
            .iter()
            .map(|(p, pcs)| (PartitionId::new(*p), Arc::clone(pcs)))
            .collect()
    }

    /// Whether this task still accepts commands.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The store context this task ingests for.
    pub fn store_context(&self) -> &Arc<StoreContext> {
        &self.store
    }

    /// Run the ingestion loop until shutdown.
    pub async fn run(self: &Arc<Self>) {
        info!(topic = %self.version_topic, "ingestion task started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let polled = self.run_once().await;
            if polled == 0 && self.actions.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.idle_poll_backoff) => {}
                    _ = self.shutdown.cancelled() => {}
                }
            }
        }
        info!(topic = %self.version_topic, "ingestion task stopped");
    }

    /// One loop iteration: surface staged errors, service queued actions,
    /// run the long-running-task checker, poll, delegate, report readiness.
    /// Returns the number of records polled.
    pub async fn run_once(self: &Arc<Self>) -> usize {
        self.surface_errors();
        self.process_actions().await;
        self.long_running_task_check().await;

        let records = match self.consumer.poll().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "upstream poll failed");
                Vec::new()
            }
        };
        let polled = records.len();
        for record in records {
            self.delegate_record(record).await;
        }

        self.check_readiness().await;
        polled
    }

    /// Stop the loop, unsubscribe everything and close the shared producer.
    pub async fn shutdown(self: &Arc<Self>) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();

        for (partition, pcs) in self.partitions_snapshot() {
            let leader_topic = pcs.lock().leader_topic_or(&self.version_topic);
            let _ = self.consumer.unsubscribe(&self.version_topic, partition).await;
            if leader_topic != self.version_topic {
                let _ = self.consumer.unsubscribe(&leader_topic, partition).await;
            }
        }
        self.partitions.write().clear();

        self.drainers.shutdown().await;
        if let Err(e) = self.gateway.close().await {
            warn!(error = %e, "closing producer failed");
        }
    }

    fn surface_errors(&self) {
        for staged in self.errors.drain() {
            error!(error = %staged, "ingestion error surfaced");
            if let Some(partition) = staged.partition() {
                if let Some(pcs) = self.pcs(partition) {
                    let mut state = pcs.lock();
                    if !state.failed {
                        state.failed = true;
                        drop(state);
                        self.status.error(partition, &staged.to_string());
                    }
                }
            }
        }
    }

    async fn process_actions(self: &Arc<Self>) {
        for action in self.actions.drain() {
            debug!(?action, "processing action");
            let result = match action.kind {
                ActionKind::Subscribe => self.execute_subscribe(action).await,
                ActionKind::Unsubscribe => self.execute_unsubscribe(action.partition).await,
                ActionKind::StandbyToLeader => self.execute_standby_to_leader(action),
                ActionKind::LeaderToStandby => self.execute_leader_to_standby(action).await,
                ActionKind::DropPartition => self.execute_drop(action.partition).await,
            };
            if let Err(e) = result {
                error!(?action, error = %e, "action failed");
                self.status.error(action.partition, &e.to_string());
            }
        }
    }

    async fn execute_subscribe(&self, action: IngestionAction) -> Result<()> {
        let partition = action.partition;
        if self.pcs(partition).is_some() {
            // re-delivered subscribe is a no-op
            return Ok(());
        }

        self.storage
            .create_partition(partition)
            .map_err(|source| IngestError::Storage { partition, source })?;
        let offset_record = self
            .meta
            .load_offset_record(partition)
            .map_err(|source| IngestError::Metadata { partition, source })?;
        let start_offset = offset_record.local_version_topic_offset;

        let pcs = PartitionConsumptionState::new(
            partition,
            self.store.amplification_factor,
            self.store.hybrid,
            self.store.incremental_push_policy,
            offset_record,
            action.session_id,
            self.time.now(),
        );
        self.partitions
            .write()
            .insert(partition.get(), Arc::new(Mutex::new(pcs)));

        self.consumer
            .subscribe(
                &self.version_topic,
                partition,
                start_offset,
                &self.config.local_url,
            )
            .await
            .map_err(|source| IngestError::Fabric { source })?;
        info!(%partition, offset = start_offset, "subscribed to version topic");
        Ok(())
    }

    async fn execute_unsubscribe(&self, partition: PartitionId) -> Result<()> {
        let Some(pcs) = self.partitions.write().remove(&partition.get()) else {
            return Ok(());
        };

        let (leader_topic, last_queued) = {
            let mut state = pcs.lock();
            state.clear_transient_records();
            (
                state.leader_topic_or(&self.version_topic),
                state.last_queued_record_persisted_future.take(),
            )
        };

        let _ = self.consumer.unsubscribe(&self.version_topic, partition).await;
        if leader_topic != self.version_topic {
            let _ = self.consumer.unsubscribe(&leader_topic, partition).await;
        }
        self.wait_for_persist(partition, last_queued).await;
        self.gateway
            .close_partition(partition)
            .await
            .map_err(|source| IngestError::Producer { partition, source })?;
        info!(%partition, "unsubscribed");
        Ok(())
    }

    async fn execute_drop(&self, partition: PartitionId) -> Result<()> {
        self.execute_unsubscribe(partition).await?;
        self.meta
            .delete_offset_record(partition)
            .map_err(|source| IngestError::Metadata { partition, source })?;
        self.storage
            .drop_partition(partition)
            .map_err(|source| IngestError::Storage { partition, source })?;
        info!(%partition, "dropped partition state");
        Ok(())
    }

    fn execute_standby_to_leader(&self, action: IngestionAction) -> Result<()> {
        let partition = action.partition;
        if action.session_id != self.current_session(partition) {
            info!(%partition, "skipping stale promotion request");
            return Ok(());
        }
        let Some(pcs) = self.pcs(partition) else {
            return Ok(());
        };

        let mut state = pcs.lock();
        if state.state != PartitionState::Standby {
            return Ok(());
        }
        state.leader_session_id = action.session_id;
        state.state = if self.store.is_migration_duplicate() {
            PartitionState::PauseTransitionFromStandbyToLeader
        } else {
            PartitionState::InTransitionFromStandbyToLeader
        };
        info!(%partition, state = ?state.state, "promotion requested, deferring until quiescence");
        Ok(())
    }

    async fn execute_leader_to_standby(&self, action: IngestionAction) -> Result<()> {
        let partition = action.partition;
        if action.session_id != self.current_session(partition) {
            info!(%partition, "skipping stale demotion request");
            return Ok(());
        }
        let Some(pcs) = self.pcs(partition) else {
            return Ok(());
        };

        let (state_now, leader_topic, consume_remotely) = {
            let state = pcs.lock();
            (
                state.state,
                state.leader_topic_or(&self.version_topic),
                state.consume_remotely,
            )
        };

        match state_now {
            PartitionState::Leader => {
                if leader_topic == self.version_topic && !consume_remotely {
                    let mut state = pcs.lock();
                    state.state = PartitionState::Standby;
                    state.clear_transient_records();
                } else {
                    self.consumer
                        .unsubscribe(&leader_topic, partition)
                        .await
                        .map_err(|source| IngestError::Fabric { source })?;

                    let (persist, queued) = {
                        let mut state = pcs.lock();
                        (
                            state.last_leader_persist_future.take(),
                            state.last_queued_record_persisted_future.take(),
                        )
                    };
                    self.wait_for_persist(partition, persist).await;
                    self.wait_for_persist(partition, queued).await;

                    let local_offset = {
                        let mut state = pcs.lock();
                        state.state = PartitionState::Standby;
                        state.consume_remotely = false;
                        state.skip_upstream_records = false;
                        state.source_fabric_url = None;
                        state.clear_transient_records();
                        state.offset_record.local_version_topic_offset
                    };
                    self.consumer
                        .subscribe(
                            &self.version_topic,
                            partition,
                            local_offset,
                            &self.config.local_url,
                        )
                        .await
                        .map_err(|source| IngestError::Fabric { source })?;
                    self.gateway
                        .close_segment(partition)
                        .await
                        .map_err(|source| IngestError::Producer { partition, source })?;
                }
                self.metrics.leader_demotions.inc(1);
                info!(%partition, "demoted to standby");
            }
            PartitionState::InTransitionFromStandbyToLeader
            | PartitionState::PauseTransitionFromStandbyToLeader => {
                // promotion never completed; just fall back
                pcs.lock().state = PartitionState::Standby;
                info!(%partition, "cancelled pending promotion");
            }
            PartitionState::Standby | PartitionState::Offline => {}
        }
        Ok(())
    }

    /// Await a persist signal with the configured cap. Timeouts are benign
    /// producer failures: counted, the signal cancelled, the partition keeps
    /// going.
    pub(crate) async fn wait_for_persist(
        &self,
        partition: PartitionId,
        signal: Option<CompletionSignal>,
    ) {
        let Some(signal) = signal else { return };
        match signal.wait(self.config.future_wait_timeout).await {
            WaitResult::TimedOut => {
                self.metrics.benign_producer_failure.inc(1);
                signal.cancel();
                warn!(%partition, "persist wait timed out; continuing");
            }
            WaitResult::Failed(message) => {
                // the failure itself was staged where it happened
                debug!(%partition, message, "awaited persist signal had failed");
            }
            WaitResult::Completed(_) | WaitResult::Cancelled => {}
        }
    }

    async fn long_running_task_check(self: &Arc<Self>) {
        for (partition, pcs) in self.partitions_snapshot() {
            let now = self.time.now();

            enum Decision {
                None,
                Promote,
                PushTimeout,
                Unpause,
                LeaderHousekeeping {
                    switch_to_local: bool,
                    topic_switch: Option<TopicSwitch>,
                },
            }

            let decision = {
                let state = pcs.lock();
                if state.failed {
                    continue;
                }

                let quiet_for = now
                    .checked_duration_since(state.latest_message_consumption_ts)
                    .unwrap_or_default();
                let promotion_delay = if self.store.system_store {
                    self.config.system_store_promotion_to_leader_delay
                } else {
                    self.config.promotion_to_leader_delay
                };

                let bootstrapping_too_long = !state.completed_reported
                    && now
                        .checked_duration_since(state.consumption_start_ts)
                        .map(|age| age > self.config.bootstrap_timeout)
                        .unwrap_or(false);
                if bootstrapping_too_long {
                    Decision::PushTimeout
                } else {
                    match state.state {
                        PartitionState::PauseTransitionFromStandbyToLeader
                            if !self.store.is_migration_duplicate() =>
                        {
                            Decision::Unpause
                        }
                        PartitionState::InTransitionFromStandbyToLeader
                            if quiet_for > promotion_delay =>
                        {
                            Decision::Promote
                        }
                        PartitionState::Leader => {
                            let leader_topic = state.leader_topic_or(&self.version_topic);
                            let on_vt_or_reprocessing = leader_topic.is_version_topic()
                                || leader_topic.is_stream_reprocessing();
                            let incremental_push_exception = state.incremental_push_policy
                                == data_types::IncrementalPushPolicy::PushToVersionTopic
                                && !self.store.write_compute_enabled
                                && state.hybrid;
                            let switch_to_local = state.consume_remotely
                                && state.end_of_push_received
                                && on_vt_or_reprocessing
                                && !incremental_push_exception;

                            let topic_switch = state.pending_topic_switch.clone().filter(|_| {
                                quiet_for > promotion_delay
                                    || leader_topic.is_stream_reprocessing()
                            });

                            if switch_to_local || topic_switch.is_some() {
                                Decision::LeaderHousekeeping {
                                    switch_to_local,
                                    topic_switch,
                                }
                            } else {
                                Decision::None
                            }
                        }
                        _ => Decision::None,
                    }
                }
            };

            match decision {
                Decision::None => {}
                Decision::PushTimeout => {
                    let mut state = pcs.lock();
                    if !state.failed {
                        state.failed = true;
                        drop(state);
                        let e = IngestError::PushTimeout { partition };
                        self.status.error(partition, &e.to_string());
                        error!(%partition, "push exceeded bootstrap deadline");
                    }
                }
                Decision::Unpause => {
                    pcs.lock().state = PartitionState::InTransitionFromStandbyToLeader;
                    info!(%partition, "migration duplicate cleared, resuming promotion");
                }
                Decision::Promote => {
                    self.complete_promotion(partition, &pcs).await;
                }
                Decision::LeaderHousekeeping {
                    switch_to_local,
                    topic_switch,
                } => {
                    if switch_to_local {
                        if let Err(e) = self.switch_to_local_consumption(partition, &pcs).await {
                            error!(%partition, error = %e, "switch to local consumption failed");
                        }
                    }
                    if let Some(switch) = topic_switch {
                        if let Err(e) = self.execute_topic_switch(partition, &pcs, switch).await {
                            error!(%partition, error = %e, "topic switch failed");
                            self.status.error(partition, &e.to_string());
                        }
                    }
                }
            }
        }
    }

    async fn complete_promotion(self: &Arc<Self>, partition: PartitionId, pcs: &SharedPcs) {
        // a demotion or unsubscribe submitted since the promotion request
        // makes this promotion stale
        if pcs.lock().leader_session_id != self.current_session(partition) {
            info!(%partition, "promotion superseded, staying standby");
            pcs.lock().state = PartitionState::Standby;
            return;
        }

        if let Err(e) = self.consumer.unsubscribe(&self.version_topic, partition).await {
            warn!(%partition, error = %e, "unsubscribing version topic failed");
        }

        let forced_standby = {
            let mut state = pcs.lock();
            if state.offset_record.leader_topic_raw.is_none() {
                state.offset_record.leader_topic_raw = Some(self.version_topic.as_str().to_string());
            }
            state.end_of_push_received
                && !partition.is_leader_sub_partition(state.amplification_factor)
        };

        if forced_standby {
            // this sub-partition is not entitled to produce for its user
            // partition; it keeps following the version topic
            let local_offset = {
                let mut state = pcs.lock();
                state.state = PartitionState::Standby;
                state.offset_record.local_version_topic_offset
            };
            if let Err(e) = self
                .consumer
                .subscribe(
                    &self.version_topic,
                    partition,
                    local_offset,
                    &self.config.local_url,
                )
                .await
            {
                warn!(%partition, error = %e, "resubscribing version topic failed");
            }
            info!(%partition, "non-leader sub-partition stays standby after end-of-push");
            return;
        }

        if let Err(e) = self.start_consuming_as_leader(partition, pcs).await {
            error!(%partition, error = %e, "failed to start consuming as leader");
            self.status.error(partition, &e.to_string());
            let mut state = pcs.lock();
            state.failed = true;
        }
    }

    pub(crate) fn resolve_consume_remotely(&self, source_url: &FabricUrl) -> bool {
        self.config.native_replication_enabled && source_url != &self.config.local_url
    }

    fn leader_source_url(&self, leader_topic: &Topic, end_of_push_received: bool) -> FabricUrl {
        if *leader_topic == self.version_topic {
            // remote bootstrap of the version topic itself
            let remote_eligible = self.config.native_replication_enabled
                && !end_of_push_received
                && !self.store.is_current_version();
            if remote_eligible {
                if let Some(remote) = &self.remote_vt_url {
                    if remote != &self.config.local_url {
                        return remote.clone();
                    }
                }
            }
            return self.config.local_url.clone();
        }

        // real-time and reprocessing sources come from the last topic switch
        let switch = self
            .meta
            .version_state()
            .ok()
            .flatten()
            .and_then(|s| s.last_topic_switch.clone());
        match switch {
            Some(switch) if switch.source_topic == *leader_topic => {
                switch.source_fabric_urls[0].clone()
            }
            _ => self.config.local_url.clone(),
        }
    }

    /// Compute the upstream start offset per the recorded checkpoint, the
    /// rewind timestamp of a topic switch, or the beginning of the topic.
    pub(crate) async fn upstream_start_offset(
        &self,
        partition: PartitionId,
        topic: &Topic,
        url: &FabricUrl,
        checkpointed: Option<i64>,
        rewind_start_timestamp: Option<i64>,
    ) -> i64 {
        if let Some(offset) = checkpointed {
            return offset;
        }
        if let Some(ts) = rewind_start_timestamp {
            if ts > 0 {
                match self
                    .upstream_meta
                    .offset_for_timestamp(url, topic, partition, ts)
                    .await
                {
                    // the upstream returns the next offset to consume; the
                    // subscription resumes after the given offset
                    Ok(Some(offset)) => return offset - 1,
                    Ok(None) => return LOWEST_OFFSET,
                    Err(e) => {
                        warn!(%partition, error = %e, "offset-for-timestamp lookup failed");
                        return LOWEST_OFFSET;
                    }
                }
            }
        }
        LOWEST_OFFSET
    }

    async fn start_consuming_as_leader(
        self: &Arc<Self>,
        partition: PartitionId,
        pcs: &SharedPcs,
    ) -> Result<()> {
        let (leader_topic, end_of_push_received, checkpointed) = {
            let state = pcs.lock();
            (
                state.leader_topic_or(&self.version_topic),
                state.end_of_push_received,
                state.offset_record.upstream_offset(),
            )
        };

        let source_url = self.leader_source_url(&leader_topic, end_of_push_received);
        let consume_remotely = self.resolve_consume_remotely(&source_url);

        let rewind = self
            .meta
            .version_state()
            .ok()
            .flatten()
            .and_then(|s| s.last_topic_switch.clone())
            .filter(|s| s.source_topic == leader_topic)
            .map(|s| s.rewind_start_timestamp);
        let start_offset = self
            .upstream_start_offset(partition, &leader_topic, &source_url, checkpointed, rewind)
            .await;

        self.consumer
            .subscribe(&leader_topic, partition, start_offset, &source_url)
            .await
            .map_err(|source| IngestError::Fabric { source })?;

        {
            let mut state = pcs.lock();
            state.state = PartitionState::Leader;
            state.consume_remotely = consume_remotely;
            state.source_fabric_url = consume_remotely.then(|| source_url.clone());
            state.skip_upstream_records =
                consume_remotely && end_of_push_received && leader_topic.is_version_topic();
            state.clear_transient_records();
            // a pending switch pointing at the topic just subscribed is
            // honored by this promotion
            if state
                .pending_topic_switch
                .as_ref()
                .map(|s| s.source_topic == leader_topic)
                .unwrap_or(false)
            {
                state.pending_topic_switch = None;
            }
        }

        self.metrics.leader_promotions.inc(1);
        info!(
            %partition,
            topic = %leader_topic,
            url = %source_url,
            remote = consume_remotely,
            offset = start_offset,
            "consuming as leader"
        );
        Ok(())
    }

    async fn switch_to_local_consumption(
        self: &Arc<Self>,
        partition: PartitionId,
        pcs: &SharedPcs,
    ) -> Result<()> {
        let (current_topic, persist, queued) = {
            let mut state = pcs.lock();
            (
                state.leader_topic_or(&self.version_topic),
                state.last_leader_persist_future.take(),
                state.last_queued_record_persisted_future.take(),
            )
        };

        self.consumer
            .unsubscribe(&current_topic, partition)
            .await
            .map_err(|source| IngestError::Fabric { source })?;
        self.wait_for_persist(partition, persist).await;
        self.wait_for_persist(partition, queued).await;

        let local_offset = {
            let mut state = pcs.lock();
            state.consume_remotely = false;
            state.skip_upstream_records = false;
            state.source_fabric_url = None;
            state.offset_record.leader_topic_raw = Some(self.version_topic.as_str().to_string());
            state.offset_record.local_version_topic_offset
        };
        self.consumer
            .subscribe(
                &self.version_topic,
                partition,
                local_offset,
                &self.config.local_url,
            )
            .await
            .map_err(|source| IngestError::Fabric { source })?;
        info!(%partition, "leader switched to local version-topic consumption");
        Ok(())
    }

    pub(crate) async fn execute_topic_switch(
        self: &Arc<Self>,
        partition: PartitionId,
        pcs: &SharedPcs,
        switch: TopicSwitch,
    ) -> Result<()> {
        let (old_topic, persist, queued) = {
            let mut state = pcs.lock();
            (
                state.leader_topic_or(&self.version_topic),
                state.last_leader_persist_future.take(),
                state.last_queued_record_persisted_future.take(),
            )
        };

        self.consumer
            .unsubscribe(&old_topic, partition)
            .await
            .map_err(|source| IngestError::Fabric { source })?;
        self.wait_for_persist(partition, persist).await;
        self.wait_for_persist(partition, queued).await;

        let source_url = switch.source_fabric_urls[0].clone();
        let start_offset = self
            .upstream_start_offset(
                partition,
                &switch.source_topic,
                &source_url,
                None,
                Some(switch.rewind_start_timestamp),
            )
            .await;
        let consume_remotely = self.resolve_consume_remotely(&source_url);

        {
            let mut state = pcs.lock();
            state.offset_record.leader_topic_raw = Some(switch.source_topic.as_str().to_string());
            state.offset_record.set_upstream_offset(start_offset);
            state.consume_remotely = consume_remotely;
            state.source_fabric_url = consume_remotely.then(|| source_url.clone());
            state.skip_upstream_records = false;
            state.pending_topic_switch = None;
            self.meta
                .save_offset_record(partition, &state.offset_record)
                .map_err(|source| IngestError::Metadata { partition, source })?;
        }

        self.consumer
            .subscribe(&switch.source_topic, partition, start_offset, &source_url)
            .await
            .map_err(|source| IngestError::Fabric { source })?;
        self.metrics.topic_switches.inc(1);
        info!(
            %partition,
            from = %old_topic,
            to = %switch.source_topic,
            url = %source_url,
            offset = start_offset,
            "executed topic switch"
        );
        Ok(())
    }

    async fn check_readiness(&self) {
        for (partition, pcs) in self.partitions_snapshot() {
            let (failed, completed, latch_released, hybrid, eop, local_offset, is_leader, leader_topic, source_url, upstream_offset) = {
                let state = pcs.lock();
                (
                    state.failed,
                    state.completed_reported,
                    state.latch_released,
                    state.hybrid,
                    state.end_of_push_received,
                    state.offset_record.local_version_topic_offset,
                    state.is_leader(),
                    state.leader_topic_or(&self.version_topic),
                    state
                        .source_fabric_url
                        .clone()
                        .unwrap_or_else(|| self.config.local_url.clone()),
                    state.offset_record.upstream_offset().unwrap_or(LOWEST_OFFSET),
                )
            };
            if failed {
                continue;
            }

            let vt_end = match self
                .upstream_meta
                .end_offset(&self.config.local_url, &self.version_topic, partition)
                .await
            {
                Ok(end) => end,
                Err(e) => {
                    debug!(%partition, error = %e, "end-offset lookup failed");
                    continue;
                }
            };
            let base_caught_up = local_offset >= vt_end - 1;

            if !hybrid {
                if eop && base_caught_up && !completed {
                    let mut state = pcs.lock();
                    if !state.completed_reported {
                        state.completed_reported = true;
                        drop(state);
                        self.status.completed(partition);
                    }
                }
                continue;
            }

            if !eop {
                continue;
            }

            if base_caught_up && !latch_released {
                let mut state = pcs.lock();
                if !state.latch_released {
                    state.latch_released = true;
                    drop(state);
                    self.status.caught_up_base_topic(partition);
                }
            }

            let lag = if is_leader && leader_topic != self.version_topic {
                let end = match self
                    .upstream_meta
                    .end_offset(&source_url, &leader_topic, partition)
                    .await
                {
                    Ok(end) => end,
                    Err(e) => {
                        debug!(%partition, error = %e, "leader lag lookup failed");
                        continue;
                    }
                };
                let lag = (end - 1 - upstream_offset).max(0);
                self.metrics.leader_lag.set(lag as u64);
                lag
            } else {
                let lag = (vt_end - 1 - local_offset).max(0);
                self.metrics.follower_lag.set(lag as u64);
                lag
            };

            if lag <= self.config.ready_to_serve_lag_budget && !completed {
                let mut state = pcs.lock();
                if !state.completed_reported {
                    state.completed_reported = true;
                    drop(state);
                    self.status.completed(partition);
                }
            }
        }
    }
}
