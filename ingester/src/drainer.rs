//! Drainer workers: apply queued records to storage, advance the partition's
//! offset record, and complete persist signals.
//!
//! Records are routed to a worker by partition hash so per-partition order is
//! preserved end to end: consumer order == drainer order == storage-apply
//! order == offset-record order.

use crate::completion::CompletionSignal;
use crate::div::{DivError, DivTransform};
use crate::error::{ErrorSink, IngestError};
use crate::metrics::IngesterMetrics;
use crate::offsets::OffsetMetadataStore;
use crate::pcs::{PartitionConsumptionState, SharedPcs};
use crate::queue::MemoryBoundedQueue;
use crate::rewind::{classify_rewind, ProducerIdentity, RewindClassification, RewindPayload};
use crate::status::StatusReporter;
use bytes::Bytes;
use data_types::{PartitionId, ProducerGuid};
use parking_lot::Mutex;
use pubsub::{ControlMessage, Payload, PolledRecord};
use std::sync::Arc;
use storage::StorageEngine;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Encode a value the way storage holds it: 4-byte big-endian schema id,
/// then the value bytes.
pub fn encode_stored_value(schema_id: i32, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + value.len());
    buf.extend_from_slice(&schema_id.to_be_bytes());
    buf.extend_from_slice(value);
    buf
}

/// Payload of a leader-produced record as it reaches the drainer.
#[derive(Debug, Clone, PartialEq)]
pub enum ProducedPayload {
    /// Full value write (including chunks and chunk manifests).
    Put {
        /// Writer schema id.
        schema_id: i32,
        /// Serialized value.
        value: Bytes,
    },
    /// Tombstone.
    Delete,
    /// Control message the leader re-produced.
    Control(ControlMessage),
}

/// What the producer completion hands to the drainer for one leader-produced
/// record. Chunks carry `-1` for both offsets and must not move offsets; only
/// the manifest record does.
#[derive(Debug)]
pub struct LeaderProducedRecordContext {
    /// Record key.
    pub key: Bytes,
    /// What to apply.
    pub payload: ProducedPayload,
    /// Upstream offset this record was consumed at, `-1` for chunks.
    pub consumed_offset: i64,
    /// Version-topic offset the produce landed at, `-1` for chunks.
    pub produced_offset: i64,
    /// Completed once the record is durably applied.
    pub persisted: CompletionSignal,
    /// Validator position to checkpoint with this record.
    pub div_transform: Option<DivTransform>,
    /// Identity of the upstream producer, for rewind classification.
    pub source_identity: Option<ProducerIdentity>,
    /// Identity the record was produced to the version topic under.
    pub produced_by_guid: ProducerGuid,
    /// Host the record was produced from.
    pub produced_by_host: String,
}

impl LeaderProducedRecordContext {
    /// Approximate in-memory footprint for queue accounting.
    pub fn serialized_size(&self) -> usize {
        let payload = match &self.payload {
            ProducedPayload::Put { value, .. } => value.len() + 4,
            ProducedPayload::Delete => 0,
            ProducedPayload::Control(_) => 16,
        };
        self.key.len() + payload + 96
    }
}

/// One unit of drainer work.
#[derive(Debug)]
pub enum DrainItem {
    /// A record consumed from a topic this partition does not re-produce.
    Consumed {
        /// The polled record.
        record: PolledRecord,
        /// The partition it belongs to.
        pcs: SharedPcs,
        /// Completed once applied.
        persisted: CompletionSignal,
    },
    /// A record the leader produced into the version topic.
    Produced {
        /// Completion context from the produce.
        ctx: LeaderProducedRecordContext,
        /// The partition it belongs to.
        pcs: SharedPcs,
    },
}

impl DrainItem {
    fn partition(&self) -> PartitionId {
        match self {
            Self::Consumed { record, .. } => record.partition,
            Self::Produced { pcs, .. } => pcs.lock().partition,
        }
    }

    fn serialized_size(&self) -> usize {
        match self {
            Self::Consumed { record, .. } => record.serialized_size(),
            Self::Produced { ctx, .. } => ctx.serialized_size(),
        }
    }
}

/// Shared collaborators of every drainer worker.
#[derive(Debug)]
pub struct DrainerDeps {
    /// The storage engine records apply to.
    pub storage: Arc<dyn StorageEngine>,
    /// Offset checkpoint store.
    pub meta: Arc<OffsetMetadataStore>,
    /// Status reporting seam.
    pub status: Arc<dyn StatusReporter>,
    /// Where fatal errors are staged for the ingestion loop.
    pub errors: Arc<ErrorSink>,
    /// Instruments.
    pub metrics: IngesterMetrics,
}

/// Pool of drainer workers behind memory-bounded queues.
#[derive(Debug)]
pub struct DrainerPool {
    queues: Vec<Arc<MemoryBoundedQueue<DrainItem>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl DrainerPool {
    /// Spawn `workers` drainers sharing `capacity` bytes of queue budget.
    pub fn new(workers: usize, capacity: usize, notify_delta: usize, deps: Arc<DrainerDeps>) -> Self {
        assert!(workers > 0, "drainer pool must not be empty");
        let per_queue_capacity = (capacity / workers).max(notify_delta + 1);
        let shutdown = CancellationToken::new();

        let queues: Vec<_> = (0..workers)
            .map(|_| Arc::new(MemoryBoundedQueue::new(per_queue_capacity, notify_delta)))
            .collect();
        let handles = queues
            .iter()
            .map(|queue| {
                let queue = Arc::clone(queue);
                let deps = Arc::clone(&deps);
                let shutdown = shutdown.clone();
                tokio::spawn(drain_loop(queue, deps, shutdown))
            })
            .collect();

        Self {
            queues,
            handles: Mutex::new(handles),
            shutdown,
        }
    }

    /// Enqueue `item` on the worker owning its partition, blocking while the
    /// queue is over its memory budget.
    pub async fn enqueue(&self, item: DrainItem) {
        let partition = item.partition();
        let queue = &self.queues[partition.get() as usize % self.queues.len()];
        let bytes = item.serialized_size();
        queue.push(item, bytes).await;
    }

    /// Items currently queued across all workers.
    pub fn queued_items(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    /// Stop all workers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "drainer worker did not shut down cleanly");
            }
        }
    }
}

async fn drain_loop(
    queue: Arc<MemoryBoundedQueue<DrainItem>>,
    deps: Arc<DrainerDeps>,
    shutdown: CancellationToken,
) {
    info!("drainer worker started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            (item, _) = queue.pop() => apply_item(&deps, item),
        }
    }
    info!("drainer worker stopped");
}

fn apply_item(deps: &DrainerDeps, item: DrainItem) {
    match item {
        DrainItem::Consumed {
            record,
            pcs,
            persisted,
        } => apply_consumed(deps, record, &pcs, persisted),
        DrainItem::Produced { ctx, pcs } => apply_produced(deps, ctx, &pcs),
    }
}

fn fail_partition(
    deps: &DrainerDeps,
    state: &mut PartitionConsumptionState,
    persisted: &CompletionSignal,
    error: IngestError,
) {
    state.failed = true;
    persisted.fail(error.to_string());
    deps.status.error(state.partition, &error.to_string());
    error!(partition = %state.partition, %error, "drainer failed partition");
    deps.errors.offer(error);
}

/// Outcome of running validation inside the drainer.
enum ValidationOutcome {
    Apply(Option<DivTransform>),
    SkipApply,
    Fail(DivError),
}

fn validate_consumed(
    deps: &DrainerDeps,
    state: &mut PartitionConsumptionState,
    record: &PolledRecord,
) -> ValidationOutcome {
    match state.div.validate(&record.envelope.producer, &record.envelope.payload) {
        Ok(transform) => ValidationOutcome::Apply(Some(transform)),
        Err(e @ DivError::Duplicate { .. }) => {
            deps.metrics.div_duplicate.inc(1);
            debug!(partition = %state.partition, error = %e, "skipping duplicate record");
            ValidationOutcome::SkipApply
        }
        Err(e) => {
            deps.metrics.div_fatal.inc(1);
            if state.end_of_push_received {
                // tolerated after the bulk load: log, count, keep serving
                error!(
                    partition = %state.partition,
                    error = %e,
                    "data validation failed after end-of-push; continuing"
                );
                ValidationOutcome::Apply(None)
            } else {
                ValidationOutcome::Fail(e)
            }
        }
    }
}

/// Check an upstream-offset rewind, if this record constitutes one. Returns
/// an error when the rewind is lossy and the partition must fail.
fn check_rewind(
    deps: &DrainerDeps,
    state: &mut PartitionConsumptionState,
    new_upstream_offset: i64,
    incoming_identity: ProducerIdentity,
    key: &[u8],
    payload: RewindPayload<'_>,
) -> Result<(), IngestError> {
    let Some(previous) = state.offset_record.upstream_offset() else {
        return Ok(());
    };
    if new_upstream_offset >= previous {
        return Ok(());
    }

    let recorded_identity = ProducerIdentity {
        guid: state
            .offset_record
            .leader_producer_guid
            .as_deref()
            .and_then(|b| ProducerGuid::from_bytes(b).ok()),
        host_id: state.offset_record.leader_host_id.clone(),
    };

    if !incoming_identity.differs_from(&recorded_identity) {
        // same leader re-delivering; nothing can diverge
        deps.metrics.benign_rewind.inc(1);
        return Ok(());
    }

    match classify_rewind(&deps.storage, state.partition, key, payload) {
        RewindClassification::Benign => {
            deps.metrics.benign_rewind.inc(1);
            info!(
                partition = %state.partition,
                new_upstream_offset,
                previous,
                "benign upstream rewind from a different leader"
            );
            Ok(())
        }
        RewindClassification::Lossy { reason } => {
            deps.metrics.lossy_rewind.inc(1);
            if state.end_of_push_received {
                warn!(
                    partition = %state.partition,
                    new_upstream_offset,
                    previous,
                    reason,
                    "lossy upstream rewind after end-of-push; continuing"
                );
                Ok(())
            } else {
                Err(IngestError::LossyRewind {
                    partition: state.partition,
                    reason,
                })
            }
        }
    }
}

fn handle_control_effects(
    deps: &DrainerDeps,
    state: &mut PartitionConsumptionState,
    control: &ControlMessage,
) -> Result<(), IngestError> {
    let partition = state.partition;
    let storage_err = |source| IngestError::Storage { partition, source };

    match control {
        ControlMessage::StartOfPush { .. } => {
            deps.storage.begin_batch_write(partition).map_err(storage_err)?;
        }
        ControlMessage::EndOfPush => {
            deps.storage.end_batch_write(partition).map_err(storage_err)?;
            let checkpoint = deps.storage.sync(partition).map_err(storage_err)?;
            debug!(%partition, ?checkpoint, "synced storage at end-of-push");
            state.end_of_push_received = true;
            state.offset_record.end_of_push_received = true;
        }
        ControlMessage::StartOfIncrementalPush { version } => {
            deps.status.start_of_incremental_push(partition, version);
        }
        ControlMessage::EndOfIncrementalPush { version } => {
            deps.status.end_of_incremental_push(partition, version);
        }
        ControlMessage::StartOfSegment
        | ControlMessage::EndOfSegment { .. }
        | ControlMessage::TopicSwitch(_)
        | ControlMessage::StartOfBufferReplay => {}
    }
    Ok(())
}

fn update_local_offset(state: &mut PartitionConsumptionState, offset: i64) {
    if offset < state.offset_record.local_version_topic_offset {
        warn!(
            partition = %state.partition,
            offset,
            current = state.offset_record.local_version_topic_offset,
            "refusing to move version-topic offset backwards"
        );
        return;
    }
    state.offset_record.local_version_topic_offset = offset;
}

fn apply_consumed(
    deps: &DrainerDeps,
    record: PolledRecord,
    pcs: &SharedPcs,
    persisted: CompletionSignal,
) {
    let mut state = pcs.lock();
    if state.failed {
        persisted.cancel();
        return;
    }
    let partition = record.partition;

    let (apply, transform) = match validate_consumed(deps, &mut state, &record) {
        ValidationOutcome::Apply(transform) => (true, transform),
        ValidationOutcome::SkipApply => (false, None),
        ValidationOutcome::Fail(source) => {
            let error = IngestError::DataValidation { partition, source };
            fail_partition(deps, &mut state, &persisted, error);
            return;
        }
    };

    if let Some(new_upstream_offset) = record.envelope.upstream_offset() {
        let incoming = ProducerIdentity {
            guid: Some(record.envelope.producer.guid),
            host_id: record.envelope.leader_footer.as_ref().map(|f| f.host_id.clone()),
        };
        let payload = match &record.envelope.payload {
            Payload::Put { schema_id, value } => RewindPayload::Put {
                schema_id: *schema_id,
                value,
            },
            Payload::Delete => RewindPayload::Delete,
            Payload::Update { .. } | Payload::Control(_) => RewindPayload::Other,
        };
        if let Err(error) = check_rewind(
            deps,
            &mut state,
            new_upstream_offset,
            incoming,
            &record.key,
            payload,
        ) {
            fail_partition(deps, &mut state, &persisted, error);
            return;
        }
    }

    // duplicates skip application but still advance offsets so they are not
    // re-consumed after a restart
    if apply {
        let result = match &record.envelope.payload {
            Payload::Put { schema_id, value } => deps
                .storage
                .put(partition, &record.key, &encode_stored_value(*schema_id, value))
                .map_err(|source| IngestError::Storage { partition, source }),
            Payload::Delete => deps
                .storage
                .delete(partition, &record.key)
                .map_err(|source| IngestError::Storage { partition, source }),
            Payload::Update { .. } => Err(IngestError::ProtocolViolation {
                partition,
                reason: "partial update reached storage application without a leader".to_string(),
            }),
            Payload::Control(control) => handle_control_effects(deps, &mut state, control),
        };
        if let Err(error) = result {
            fail_partition(deps, &mut state, &persisted, error);
            return;
        }

        if let Some(transform) = &transform {
            state
                .offset_record
                .record_producer_position(&transform.guid, transform.position);
        }
    }

    update_local_offset(&mut state, record.offset);
    if let Some(upstream_offset) = record.envelope.upstream_offset() {
        // rewinds are propagated so followers track the true leader
        state.offset_record.set_upstream_offset(upstream_offset);
    }
    state.offset_record.leader_producer_guid =
        Some(record.envelope.producer.guid.as_bytes().to_vec());
    if let Some(footer) = &record.envelope.leader_footer {
        state.offset_record.leader_host_id = Some(footer.host_id.clone());
    }

    if let Err(source) = deps.meta.save_offset_record(partition, &state.offset_record) {
        let error = IngestError::Metadata { partition, source };
        fail_partition(deps, &mut state, &persisted, error);
        return;
    }

    deps.metrics.records_applied.inc(1);
    persisted.complete(record.offset);
}

fn apply_produced(deps: &DrainerDeps, ctx: LeaderProducedRecordContext, pcs: &SharedPcs) {
    let mut state = pcs.lock();
    if state.failed {
        ctx.persisted.cancel();
        return;
    }
    let partition = state.partition;
    let is_chunk = ctx.consumed_offset < 0 && ctx.produced_offset < 0;

    if ctx.consumed_offset >= 0 {
        if let Some(incoming) = ctx.source_identity.clone() {
            let payload = match &ctx.payload {
                ProducedPayload::Put { schema_id, value } => RewindPayload::Put {
                    schema_id: *schema_id,
                    value,
                },
                ProducedPayload::Delete => RewindPayload::Delete,
                ProducedPayload::Control(_) => RewindPayload::Other,
            };
            if let Err(error) = check_rewind(
                deps,
                &mut state,
                ctx.consumed_offset,
                incoming,
                &ctx.key,
                payload,
            ) {
                fail_partition(deps, &mut state, &ctx.persisted, error);
                return;
            }
        }
    }

    let result = match &ctx.payload {
        ProducedPayload::Put { schema_id, value } => deps
            .storage
            .put(partition, &ctx.key, &encode_stored_value(*schema_id, value))
            .map_err(|source| IngestError::Storage { partition, source }),
        ProducedPayload::Delete => deps
            .storage
            .delete(partition, &ctx.key)
            .map_err(|source| IngestError::Storage { partition, source }),
        ProducedPayload::Control(control) => handle_control_effects(deps, &mut state, control),
    };
    if let Err(error) = result {
        fail_partition(deps, &mut state, &ctx.persisted, error);
        return;
    }

    if !is_chunk {
        if ctx.produced_offset >= 0 {
            update_local_offset(&mut state, ctx.produced_offset);
        }
        if ctx.consumed_offset >= 0 {
            state.offset_record.set_upstream_offset(ctx.consumed_offset);
            state.prune_transient_record(&ctx.key, ctx.consumed_offset);
        }
        state.offset_record.leader_producer_guid = Some(ctx.produced_by_guid.as_bytes().to_vec());
        state.offset_record.leader_host_id = Some(ctx.produced_by_host.clone());
        if let Some(transform) = &ctx.div_transform {
            state
                .offset_record
                .record_producer_position(&transform.guid, transform.position);
        }

        if let Err(source) = deps.meta.save_offset_record(partition, &state.offset_record) {
            let error = IngestError::Metadata { partition, source };
            fail_partition(deps, &mut state, &ctx.persisted, error);
            return;
        }
    }

    deps.metrics.records_applied.inc(1);
    ctx.persisted.complete(ctx.produced_offset);
}
