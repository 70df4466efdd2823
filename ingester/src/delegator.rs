//! Record delegation: for every polled record, decide whether this partition
//! re-produces it into the version topic or hands it straight to a drainer,
//! and do so.

use crate::completion::CompletionSignal;
use crate::div::DivError;
use crate::drainer::{DrainItem, LeaderProducedRecordContext, ProducedPayload};
use crate::error::IngestError;
use crate::gateway::ProduceMode;
use crate::pcs::SharedPcs;
use crate::rewind::ProducerIdentity;
use crate::task::IngestionTask;
use bytes::Bytes;
use data_types::{PartitionId, ProducerGuid};
use pubsub::{ControlMessage, Payload, PolledRecord, ProduceResult};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Merge function of the partial-update path. Schema mechanics live outside
/// the engine; this is the seam they plug into.
pub trait UpdateApplier: Debug + Send + Sync + 'static {
    /// Apply `update` to the current value (`None` when the key is absent),
    /// both serialized with `schema_id`. A `None` result deletes the key.
    fn apply(&self, schema_id: i32, current: Option<&[u8]>, update: &[u8]) -> Option<Bytes>;
}

impl IngestionTask {
    pub(crate) fn fail_partition_now(&self, partition: PartitionId, pcs: &SharedPcs, error: IngestError) {
        let mut state = pcs.lock();
        if !state.failed {
            state.failed = true;
            drop(state);
            error!(%partition, %error, "failing partition");
            self.status.error(partition, &error.to_string());
        }
    }

    /// Route one polled record.
    pub(crate) async fn delegate_record(self: &Arc<Self>, record: PolledRecord) {
        let partition = record.partition;
        let Some(pcs) = self.pcs(partition) else {
            debug!(%partition, topic = %record.topic, "record for unknown partition");
            return;
        };

        let (failed, is_leader, leader_topic, produces, skip_upstream, upstream_checkpoint, eop) = {
            let state = pcs.lock();
            (
                state.failed,
                state.is_leader(),
                state.leader_topic_or(&self.version_topic),
                state.should_produce_to_version_topic(&self.version_topic),
                state.skip_upstream_records,
                state.offset_record.upstream_offset(),
                state.end_of_push_received,
            )
        };
        if failed {
            return;
        }

        // drop records of a previous subscription that were already in flight
        let expected_topic = if is_leader {
            leader_topic.clone()
        } else {
            self.version_topic.clone()
        };
        if record.topic != expected_topic {
            debug!(
                %partition,
                topic = %record.topic,
                expected = %expected_topic,
                "skipping record from stale subscription"
            );
            return;
        }

        pcs.lock().latest_message_consumption_ts = self.time.now();

        if skip_upstream {
            if let Some(checkpoint) = upstream_checkpoint {
                if record.offset <= checkpoint {
                    debug!(%partition, offset = record.offset, "skipping already-consumed upstream record");
                    return;
                }
            }
        }

        enum ControlRouting {
            BufferReplay,
            Switch(data_types::TopicSwitch),
            StartOfPush(bool),
            Other,
        }

        let routing = match &record.envelope.payload {
            Payload::Control(ControlMessage::StartOfBufferReplay) => ControlRouting::BufferReplay,
            Payload::Control(ControlMessage::TopicSwitch(switch)) => {
                ControlRouting::Switch(switch.clone())
            }
            Payload::Control(ControlMessage::StartOfPush { chunked }) => {
                ControlRouting::StartOfPush(*chunked)
            }
            _ => ControlRouting::Other,
        };

        match routing {
            ControlRouting::BufferReplay => {
                self.fail_partition_now(
                    partition,
                    &pcs,
                    IngestError::ProtocolViolation {
                        partition,
                        reason: "received StartOfBufferReplay".to_string(),
                    },
                );
                return;
            }
            ControlRouting::Switch(switch) => {
                self.handle_topic_switch(record, &pcs, produces, switch).await;
                return;
            }
            ControlRouting::StartOfPush(chunked) => {
                // version state is created on the first StartOfPush, in any
                // role
                if let Err(source) = self.meta.update_version_state(|s| {
                    s.chunking_enabled = chunked;
                }) {
                    self.fail_partition_now(
                        partition,
                        &pcs,
                        IngestError::Metadata { partition, source },
                    );
                    return;
                }
                self.gateway.update_chunking(chunked);
            }
            ControlRouting::Other => {}
        }

        if !produces {
            if matches!(record.envelope.payload, Payload::Update { .. }) {
                self.fail_partition_now(
                    partition,
                    &pcs,
                    IngestError::ProtocolViolation {
                        partition,
                        reason: "partial update received while not producing to the version topic"
                            .to_string(),
                    },
                );
                return;
            }
            self.enqueue_consumed(record, &pcs).await;
            return;
        }

        self.produce_record(record, &pcs, &leader_topic, eop).await;
    }

    async fn enqueue_consumed(&self, record: PolledRecord, pcs: &SharedPcs) {
        let persisted = CompletionSignal::new();
        pcs.lock().last_queued_record_persisted_future = Some(persisted.clone());
        self.drainers
            .enqueue(DrainItem::Consumed {
                record,
                pcs: Arc::clone(pcs),
                persisted,
            })
            .await;
    }

    async fn produce_record(
        self: &Arc<Self>,
        record: PolledRecord,
        pcs: &SharedPcs,
        leader_topic: &data_types::Topic,
        end_of_push_received: bool,
    ) {
        let partition = record.partition;

        // real-time records validate inline so ordering holds across the
        // pass-through re-production
        let mut div_transform = None;
        if record.topic.is_real_time() {
            let outcome = pcs
                .lock()
                .div
                .validate(&record.envelope.producer, &record.envelope.payload);
            match outcome {
                Ok(transform) => div_transform = Some(transform),
                Err(e @ DivError::Duplicate { .. }) => {
                    self.metrics.div_duplicate.inc(1);
                    debug!(%partition, error = %e, "skipping duplicate real-time record");
                    return;
                }
                Err(e) => {
                    self.metrics.div_fatal.inc(1);
                    error!(%partition, error = %e, "real-time validation failed; continuing");
                }
            }
        }

        let source_identity = ProducerIdentity {
            guid: Some(record.envelope.producer.guid),
            host_id: record
                .envelope
                .leader_footer
                .as_ref()
                .map(|f| f.host_id.clone()),
        };
        let consumed_offset = record.offset;

        // before end-of-push the upstream producer's identity is preserved so
        // followers can validate the re-produced stream end to end
        let pass_through = !end_of_push_received;
        let produced_by_guid = if pass_through {
            record.envelope.producer.guid
        } else {
            self.gateway.guid()
        };
        let mode = || {
            if pass_through {
                ProduceMode::PassThrough(&record.envelope.producer)
            } else {
                ProduceMode::OwnMetadata
            }
        };

        let sent = match &record.envelope.payload {
            Payload::Control(control) => {
                match control {
                    ControlMessage::StartOfSegment | ControlMessage::EndOfSegment { .. } => {
                        // segment markers travel only from reprocessing or a
                        // remote version topic
                        let from_reprocessing = leader_topic.is_stream_reprocessing();
                        let from_remote_vt =
                            record.topic == self.version_topic && pcs.lock().consume_remotely;
                        if !from_reprocessing && !from_remote_vt {
                            return;
                        }
                    }
                    ControlMessage::StartOfPush { .. }
                    | ControlMessage::EndOfPush
                    | ControlMessage::StartOfIncrementalPush { .. }
                    | ControlMessage::EndOfIncrementalPush { .. } => {}
                    ControlMessage::TopicSwitch(_) | ControlMessage::StartOfBufferReplay => {
                        unreachable!("handled before produce");
                    }
                }
                self.gateway
                    .send_control(partition, control.clone(), mode(), consumed_offset)
                    .await
                    .map(|result| (result, ProducedPayload::Control(control.clone())))
            }
            Payload::Put { schema_id, value } => self
                .gateway
                .put(
                    partition,
                    record.key.clone(),
                    *schema_id,
                    value.clone(),
                    mode(),
                    consumed_offset,
                )
                .await
                .map(|result| {
                    (
                        result,
                        ProducedPayload::Put {
                            schema_id: *schema_id,
                            value: value.clone(),
                        },
                    )
                }),
            Payload::Delete => self
                .gateway
                .delete(partition, record.key.clone(), mode(), consumed_offset)
                .await
                .map(|result| (result, ProducedPayload::Delete)),
            Payload::Update { schema_id, update } => {
                self.process_update(
                    &record,
                    pcs,
                    *schema_id,
                    update.clone(),
                    end_of_push_received,
                    div_transform,
                )
                .await;
                return;
            }
        };

        match sent {
            Ok((result, applied)) => {
                self.handle_produce_result(
                    pcs,
                    partition,
                    record.key.clone(),
                    applied,
                    consumed_offset,
                    result,
                    div_transform,
                    Some(source_identity),
                    produced_by_guid,
                )
                .await;
            }
            Err(source) => {
                // retained; the next loop iteration surfaces it
                self.metrics.producer_failure.inc(1);
                warn!(%partition, error = %source, "produce to version topic failed");
                self.errors.offer(IngestError::Producer { partition, source });
            }
        }
    }

    /// Runs the completion duties of a version-topic send: fan-out skip,
    /// chunk and manifest enqueueing, persist-future wiring.
    #[allow(clippy::too_many_arguments)]
    async fn handle_produce_result(
        &self,
        pcs: &SharedPcs,
        partition: PartitionId,
        key: Bytes,
        applied: ProducedPayload,
        consumed_offset: i64,
        result: ProduceResult,
        div_transform: Option<crate::div::DivTransform>,
        source_identity: Option<ProducerIdentity>,
        produced_by_guid: ProducerGuid,
    ) {
        let persisted = CompletionSignal::new();

        // fan-out: a send that landed on some other sub-partition is not
        // drained here
        if result.metadata.partition != partition {
            persisted.complete(result.metadata.offset);
            let mut state = pcs.lock();
            state.last_leader_persist_future = Some(persisted);
            return;
        }

        {
            let mut state = pcs.lock();
            state.last_leader_persist_future = Some(persisted.clone());
            state.last_queued_record_persisted_future = Some(persisted.clone());
        }

        let host_id = self.gateway.host_id().to_string();
        if let Some(chunking) = result.chunking {
            for chunk in &chunking.chunks {
                self.drainers
                    .enqueue(DrainItem::Produced {
                        ctx: LeaderProducedRecordContext {
                            key: chunk.key.clone(),
                            payload: ProducedPayload::Put {
                                schema_id: pubsub::CHUNK_SCHEMA_ID,
                                value: chunk.value.clone(),
                            },
                            consumed_offset: -1,
                            produced_offset: -1,
                            persisted: CompletionSignal::new(),
                            div_transform: None,
                            source_identity: None,
                            produced_by_guid,
                            produced_by_host: host_id.clone(),
                        },
                        pcs: Arc::clone(pcs),
                    })
                    .await;
            }
            self.drainers
                .enqueue(DrainItem::Produced {
                    ctx: LeaderProducedRecordContext {
                        key: chunking.top_level_key.clone(),
                        payload: ProducedPayload::Put {
                            schema_id: pubsub::CHUNK_MANIFEST_SCHEMA_ID,
                            value: chunking.manifest.encode_to_bytes(),
                        },
                        consumed_offset,
                        produced_offset: result.metadata.offset,
                        persisted,
                        div_transform,
                        source_identity,
                        produced_by_guid,
                        produced_by_host: host_id,
                    },
                    pcs: Arc::clone(pcs),
                })
                .await;
        } else {
            self.drainers
                .enqueue(DrainItem::Produced {
                    ctx: LeaderProducedRecordContext {
                        key,
                        payload: applied,
                        consumed_offset,
                        produced_offset: result.metadata.offset,
                        persisted,
                        div_transform,
                        source_identity,
                        produced_by_guid,
                        produced_by_host: host_id,
                    },
                    pcs: Arc::clone(pcs),
                })
                .await;
        }
    }

    /// The partial-update path: look up the current value (transient cache
    /// first, then storage), merge, and produce the result.
    async fn process_update(
        self: &Arc<Self>,
        record: &PolledRecord,
        pcs: &SharedPcs,
        schema_id: i32,
        update: Bytes,
        end_of_push_received: bool,
        div_transform: Option<crate::div::DivTransform>,
    ) {
        let partition = record.partition;

        let applier = self.update_applier.as_ref().map(Arc::clone);
        let write_compute_on =
            self.store.write_compute_enabled && self.config.write_computation_enabled;
        let Some(applier) = applier.filter(|_| write_compute_on) else {
            self.fail_partition_now(
                partition,
                pcs,
                IngestError::ProtocolViolation {
                    partition,
                    reason: "partial update received but write compute is disabled".to_string(),
                },
            );
            return;
        };
        let chunking_enabled = self
            .meta
            .version_state()
            .ok()
            .flatten()
            .map(|s| s.chunking_enabled)
            .unwrap_or(false);
        if chunking_enabled {
            self.fail_partition_now(
                partition,
                pcs,
                IngestError::ProtocolViolation {
                    partition,
                    reason: "partial updates are incompatible with chunked values".to_string(),
                },
            );
            return;
        }
        let cached = pcs
            .lock()
            .transient_record(&record.key)
            .map(|t| t.value.clone());
        let current: Option<Bytes> = match cached {
            Some(value) => value,
            None => match self.storage.get(partition, &record.key) {
                Ok(Some(stored)) if stored.len() >= 4 => Some(stored.slice(4..)),
                Ok(_) => None,
                Err(source) => {
                    self.fail_partition_now(
                        partition,
                        pcs,
                        IngestError::Storage { partition, source },
                    );
                    return;
                }
            },
        };

        let merged = applier.apply(schema_id, current.as_deref(), &update);
        pcs.lock().set_transient_record(
            record.key.clone(),
            record.offset,
            merged.clone(),
            schema_id,
        );

        let source_identity = ProducerIdentity {
            guid: Some(record.envelope.producer.guid),
            host_id: None,
        };
        let mode = if end_of_push_received {
            ProduceMode::OwnMetadata
        } else {
            ProduceMode::PassThrough(&record.envelope.producer)
        };
        let produced_by_guid = if end_of_push_received {
            self.gateway.guid()
        } else {
            record.envelope.producer.guid
        };

        let sent = match &merged {
            Some(value) => self
                .gateway
                .put(
                    partition,
                    record.key.clone(),
                    schema_id,
                    value.clone(),
                    mode,
                    record.offset,
                )
                .await
                .map(|result| {
                    (
                        result,
                        ProducedPayload::Put {
                            schema_id,
                            value: value.clone(),
                        },
                    )
                }),
            None => self
                .gateway
                .delete(partition, record.key.clone(), mode, record.offset)
                .await
                .map(|result| (result, ProducedPayload::Delete)),
        };

        match sent {
            Ok((result, applied)) => {
                self.handle_produce_result(
                    pcs,
                    partition,
                    record.key.clone(),
                    applied,
                    record.offset,
                    result,
                    div_transform,
                    Some(source_identity),
                    produced_by_guid,
                )
                .await;
            }
            Err(source) => {
                self.metrics.producer_failure.inc(1);
                warn!(%partition, error = %source, "produce of merged update failed");
                self.errors.offer(IngestError::Producer { partition, source });
            }
        }
    }

    /// Handle a received topic switch, in any role.
    async fn handle_topic_switch(
        self: &Arc<Self>,
        record: PolledRecord,
        pcs: &SharedPcs,
        produces: bool,
        switch: data_types::TopicSwitch,
    ) {
        let partition = record.partition;

        if switch.source_fabric_urls.len() != 1 {
            self.fail_partition_now(
                partition,
                pcs,
                IngestError::ProtocolViolation {
                    partition,
                    reason: format!(
                        "topic switch must carry exactly one source fabric, got {}",
                        switch.source_fabric_urls.len()
                    ),
                },
            );
            return;
        }

        if let Err(source) = self.meta.update_version_state(|s| {
            s.last_topic_switch = Some(switch.clone());
        }) {
            self.fail_partition_now(partition, pcs, IngestError::Metadata { partition, source });
            return;
        }
        pcs.lock().pending_topic_switch = Some(switch.clone());
        self.status.topic_switch_received(partition);
        info!(
            %partition,
            source = %switch.source_topic,
            rewind = switch.rewind_start_timestamp,
            "topic switch received"
        );

        if produces {
            // the leader forwards the switch into the version topic; its own
            // execution waits for the long-running task checker
            let end_of_push_received = pcs.lock().end_of_push_received;
            let mode = if end_of_push_received {
                ProduceMode::OwnMetadata
            } else {
                ProduceMode::PassThrough(&record.envelope.producer)
            };
            let produced_by_guid = if end_of_push_received {
                self.gateway.guid()
            } else {
                record.envelope.producer.guid
            };
            let sent = self
                .gateway
                .send_control(
                    partition,
                    ControlMessage::TopicSwitch(switch.clone()),
                    mode,
                    record.offset,
                )
                .await;
            match sent {
                Ok(result) => {
                    self.handle_produce_result(
                        pcs,
                        partition,
                        record.key.clone(),
                        ProducedPayload::Control(ControlMessage::TopicSwitch(switch)),
                        record.offset,
                        result,
                        None,
                        Some(ProducerIdentity {
                            guid: Some(record.envelope.producer.guid),
                            host_id: None,
                        }),
                        produced_by_guid,
                    )
                    .await;
                }
                Err(source) => {
                    self.metrics.producer_failure.inc(1);
                    self.errors.offer(IngestError::Producer { partition, source });
                }
            }
        } else {
            // followers track the new upstream immediately so their lag can
            // be computed while the leader catches up
            let url = switch.source_fabric_urls[0].clone();
            let start_offset = self
                .upstream_start_offset(
                    partition,
                    &switch.source_topic,
                    &url,
                    None,
                    Some(switch.rewind_start_timestamp),
                )
                .await;
            {
                let mut state = pcs.lock();
                state.offset_record.leader_topic_raw =
                    Some(switch.source_topic.as_str().to_string());
                state.offset_record.set_upstream_offset(start_offset);
            }
            self.enqueue_consumed(record, pcs).await;
        }
    }
}
