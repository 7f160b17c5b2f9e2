// Copyright 2025 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! DDL and sync-point barriers: globally-ordered gates around events that
//! must apply atomically with respect to the stream.
//!
//! A dispatcher that hits a blocking event pins its checkpoint at
//! `barrier_ts - 1` and reports the event. The maintainer computes the
//! affected span set, broadcasts Prepare, collects acks (a span has acked
//! once its reported checkpoint reached `barrier_ts - 1`), has the
//! table-trigger dispatcher flush the event downstream, and finally
//! broadcasts Release. The published checkpoint is clamped below the barrier
//! until then.

use std::collections::{BTreeMap, HashSet};

use changeflow_common::protocol::{
    BarrierAction, BlockingEvent, BlockingKind, DispatcherStatus, InfluenceScope,
};
use changeflow_common::{ChangefeedId, DispatcherId, Ts};

use crate::metrics::MaintainerMetricsRef;
use crate::registry::{ReplicationState, SpanRegistry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierState {
    /// Registered; Prepare not yet broadcast.
    Pending,
    /// Prepare broadcast; collecting acks and, for DDL, the writer flush.
    Acking,
    /// Released; kept until every affected span advanced past the barrier so
    /// Release can be retransmitted to late dispatchers.
    Done,
}

#[derive(Debug)]
pub struct Barrier {
    pub barrier_ts: Ts,
    pub kind: BlockingKind,
    pub scope: InfluenceScope,
    pub state: BarrierState,
    /// Spans still owing an ack.
    pending_acks: HashSet<DispatcherId>,
    /// Every span the barrier gates, for the Done-state drain check.
    affected: HashSet<DispatcherId>,
    /// The table-trigger dispatcher that writes the event downstream.
    /// `None` for sync-points, which have nothing to write.
    writer: Option<DispatcherId>,
    writer_done: bool,
}

impl Barrier {
    fn writer_pending(&self) -> bool {
        self.writer.is_some() && !self.writer_done
    }
}

pub struct BarrierController {
    changefeed_id: ChangefeedId,
    barriers: BTreeMap<Ts, Barrier>,
    metrics: MaintainerMetricsRef,
}

impl BarrierController {
    pub fn new(changefeed_id: ChangefeedId, metrics: MaintainerMetricsRef) -> Self {
        Self {
            changefeed_id,
            barriers: BTreeMap::new(),
            metrics,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.barriers.is_empty()
    }

    pub fn get(&self, barrier_ts: Ts) -> Option<&Barrier> {
        self.barriers.get(&barrier_ts)
    }

    /// The checkpoint must stay below every unreleased barrier.
    pub fn checkpoint_ceiling(&self) -> Option<Ts> {
        self.barriers
            .values()
            .filter(|b| b.state != BarrierState::Done)
            .map(|b| b.barrier_ts.prev())
            .min()
    }

    /// A dispatcher reported a blocking event (or, for the writer, that the
    /// event is flushed downstream).
    pub fn on_blocking_event(
        &mut self,
        registry: &SpanRegistry,
        reporter: DispatcherId,
        event: &BlockingEvent,
        table_trigger: Option<DispatcherId>,
    ) {
        if let Some(barrier) = self.barriers.get_mut(&event.barrier_ts) {
            if event.done && barrier.writer == Some(reporter) {
                tracing::info!(
                    changefeed = %self.changefeed_id,
                    barrier_ts = %event.barrier_ts,
                    "barrier event flushed downstream"
                );
                barrier.writer_done = true;
            }
            return;
        }
        if event.done {
            // A flush report for a barrier we already dropped.
            return;
        }

        let affected: HashSet<DispatcherId> = match event.scope {
            InfluenceScope::Normal => [reporter].into(),
            InfluenceScope::Schema(schema_id) => registry
                .entries()
                .filter(|e| e.schema_id == schema_id)
                .filter(|e| e.state == ReplicationState::Working)
                .map(|e| e.id)
                .collect(),
            InfluenceScope::All => registry
                .entries()
                .filter(|e| e.state == ReplicationState::Working)
                .map(|e| e.id)
                .collect(),
        };
        let writer = match event.kind {
            BlockingKind::Ddl => table_trigger,
            BlockingKind::SyncPoint => None,
        };
        tracing::info!(
            changefeed = %self.changefeed_id,
            barrier_ts = %event.barrier_ts,
            kind = ?event.kind,
            scope = ?event.scope,
            affected = affected.len(),
            "barrier registered"
        );
        self.barriers.insert(
            event.barrier_ts,
            Barrier {
                barrier_ts: event.barrier_ts,
                kind: event.kind,
                scope: event.scope,
                state: BarrierState::Pending,
                pending_acks: affected.clone(),
                affected,
                writer,
                writer_done: false,
            },
        );
        self.metrics.barrier_pending_gauge.set(self.barriers.len() as i64);
    }

    /// Track a span's reported checkpoint: reaching `barrier_ts - 1` is the
    /// span's ack.
    pub fn on_span_checkpoint(&mut self, span: DispatcherId, checkpoint_ts: Ts) {
        for barrier in self.barriers.values_mut() {
            if barrier.state == BarrierState::Acking
                && checkpoint_ts >= barrier.barrier_ts.prev()
                && barrier.pending_acks.remove(&span)
            {
                tracing::debug!(
                    changefeed = %self.changefeed_id,
                    barrier_ts = %barrier.barrier_ts,
                    dispatcher = %span,
                    remaining = barrier.pending_acks.len(),
                    "barrier ack"
                );
            }
        }
    }

    /// A span lost its owner and will be re-placed; its next owner re-acks
    /// from `barrier_ts - 1`.
    pub fn on_span_demoted(&mut self, span: DispatcherId) {
        for barrier in self.barriers.values_mut() {
            if barrier.state != BarrierState::Done && barrier.affected.contains(&span) {
                barrier.pending_acks.insert(span);
            }
        }
    }

    /// A span was deleted; it owes no ack any more.
    pub fn on_span_removed(&mut self, span: DispatcherId) {
        for barrier in self.barriers.values_mut() {
            barrier.pending_acks.remove(&span);
            barrier.affected.remove(&span);
            if barrier.writer == Some(span) {
                // The writer is re-designated when its replacement reports.
                barrier.writer_done = false;
                barrier.writer = None;
            }
        }
    }

    /// Re-designate the writer after the table-trigger dispatcher was
    /// re-created.
    pub fn set_table_trigger(&mut self, writer: DispatcherId) {
        for barrier in self.barriers.values_mut() {
            if barrier.kind == BlockingKind::Ddl && barrier.writer.is_none() {
                barrier.writer = Some(writer);
            }
        }
    }

    /// Build this cycle's barrier instructions, advancing barrier states.
    /// Prepare/Ack/Release are retransmitted every cycle until acked, so a
    /// lost message only costs one heartbeat round.
    pub fn collect_statuses(&mut self, registry: &SpanRegistry) -> Vec<DispatcherStatus> {
        let mut statuses = Vec::new();
        let mut drained = Vec::new();
        for barrier in self.barriers.values_mut() {
            match barrier.state {
                BarrierState::Pending | BarrierState::Acking => {
                    barrier.state = BarrierState::Acking;
                    if !barrier.pending_acks.is_empty() {
                        statuses.push(DispatcherStatus {
                            scope: barrier.scope,
                            action: BarrierAction::Prepare,
                            barrier_ts: barrier.barrier_ts,
                            exclude: None,
                        });
                    } else if barrier.writer_pending() {
                        // All affected spans are pinned; the table-trigger
                        // dispatcher may now flush the event downstream.
                        statuses.push(DispatcherStatus {
                            scope: InfluenceScope::Normal,
                            action: BarrierAction::Ack,
                            barrier_ts: barrier.barrier_ts,
                            exclude: None,
                        });
                    } else {
                        tracing::info!(
                            changefeed = %self.changefeed_id,
                            barrier_ts = %barrier.barrier_ts,
                            "barrier released"
                        );
                        barrier.state = BarrierState::Done;
                        statuses.push(DispatcherStatus {
                            scope: barrier.scope,
                            action: BarrierAction::Release,
                            barrier_ts: barrier.barrier_ts,
                            exclude: barrier.writer,
                        });
                    }
                }
                BarrierState::Done => {
                    let still_pinned = barrier.affected.iter().any(|id| {
                        registry
                            .get(*id)
                            .is_some_and(|e| e.watermark.checkpoint_ts < barrier.barrier_ts)
                    });
                    if still_pinned {
                        statuses.push(DispatcherStatus {
                            scope: barrier.scope,
                            action: BarrierAction::Release,
                            barrier_ts: barrier.barrier_ts,
                            exclude: barrier.writer,
                        });
                    } else {
                        drained.push(barrier.barrier_ts);
                    }
                }
            }
        }
        for barrier_ts in drained {
            self.barriers.remove(&barrier_ts);
        }
        self.metrics.barrier_pending_gauge.set(self.barriers.len() as i64);
        statuses
    }
}

#[cfg(test)]
mod tests {
    use changeflow_common::{GroupId, NodeId, SchemaId, TableId, TableSpan, Watermark};

    use super::*;
    use crate::metrics::MaintainerMetrics;

    fn working_span(registry: &mut SpanRegistry, table: i64, ts: u64) -> DispatcherId {
        let id = registry.add_absent(
            TableSpan::table_record_range(TableId(table)),
            SchemaId(1),
            GroupId(table),
            Watermark::new(Ts(ts)),
        );
        let node = NodeId::from("n1");
        registry.mark_scheduling(id, node.clone());
        registry.mark_working(id, &node);
        id
    }

    fn ddl_event(barrier_ts: u64) -> BlockingEvent {
        BlockingEvent {
            barrier_ts: Ts(barrier_ts),
            kind: BlockingKind::Ddl,
            scope: InfluenceScope::All,
            affected_tables: vec![],
            done: false,
        }
    }

    fn controller(registry: &SpanRegistry) -> BarrierController {
        BarrierController::new(registry.changefeed_id().clone(), MaintainerMetrics::for_test())
    }

    #[test]
    fn test_global_ddl_barrier_flow() {
        let mut registry = SpanRegistry::new(ChangefeedId::in_default_namespace("barrier-test"));
        let writer = working_span(&mut registry, 0, 100);
        let a = working_span(&mut registry, 1, 100);
        let b = working_span(&mut registry, 2, 100);
        let mut barriers = controller(&registry);

        barriers.on_blocking_event(&registry, a, &ddl_event(200), Some(writer));
        assert_eq!(barriers.checkpoint_ceiling(), Some(Ts(199)));

        // Cycle 1: Prepare broadcast.
        let statuses = barriers.collect_statuses(&registry);
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].action, BarrierAction::Prepare);

        // Acks trickle in; Prepare is retransmitted until all are in.
        barriers.on_span_checkpoint(a, Ts(199));
        barriers.on_span_checkpoint(b, Ts(150));
        let statuses = barriers.collect_statuses(&registry);
        assert_eq!(statuses[0].action, BarrierAction::Prepare);

        barriers.on_span_checkpoint(b, Ts(199));
        barriers.on_span_checkpoint(writer, Ts(199));

        // Everyone pinned: the writer is told to flush the DDL.
        let statuses = barriers.collect_statuses(&registry);
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].action, BarrierAction::Ack);
        // The ceiling still holds until the release goes out.
        assert_eq!(barriers.checkpoint_ceiling(), Some(Ts(199)));

        // Writer reports the flush done; Release goes out, excluding it.
        let mut done = ddl_event(200);
        done.done = true;
        barriers.on_blocking_event(&registry, writer, &done, Some(writer));
        let statuses = barriers.collect_statuses(&registry);
        assert_eq!(statuses[0].action, BarrierAction::Release);
        assert_eq!(statuses[0].exclude, Some(writer));
        assert_eq!(barriers.checkpoint_ceiling(), None);

        // Release keeps going out until every span moved past the barrier.
        let statuses = barriers.collect_statuses(&registry);
        assert_eq!(statuses[0].action, BarrierAction::Release);
        for id in [writer, a, b] {
            registry.update_watermark(id, Watermark::new(Ts(210)));
        }
        assert!(barriers.collect_statuses(&registry).is_empty());
        assert!(barriers.is_empty());
    }

    #[test]
    fn test_sync_point_needs_no_writer() {
        let mut registry = SpanRegistry::new(ChangefeedId::in_default_namespace("barrier-test"));
        let a = working_span(&mut registry, 1, 100);
        let mut barriers = controller(&registry);

        let mut event = ddl_event(300);
        event.kind = BlockingKind::SyncPoint;
        event.scope = InfluenceScope::Normal;
        barriers.on_blocking_event(&registry, a, &event, None);

        assert_eq!(
            barriers.collect_statuses(&registry)[0].action,
            BarrierAction::Prepare
        );
        barriers.on_span_checkpoint(a, Ts(299));
        // No writer step: straight to release.
        assert_eq!(
            barriers.collect_statuses(&registry)[0].action,
            BarrierAction::Release
        );
    }

    #[test]
    fn test_owner_loss_rearms_ack() {
        let mut registry = SpanRegistry::new(ChangefeedId::in_default_namespace("barrier-test"));
        let a = working_span(&mut registry, 1, 100);
        let b = working_span(&mut registry, 2, 100);
        let mut barriers = controller(&registry);

        let mut event = ddl_event(200);
        event.kind = BlockingKind::SyncPoint;
        barriers.on_blocking_event(&registry, a, &event, None);
        barriers.collect_statuses(&registry);
        barriers.on_span_checkpoint(a, Ts(199));
        barriers.on_span_checkpoint(b, Ts(199));

        // `b` loses its owner before the release cycle: its next owner must
        // re-ack from barrier_ts - 1.
        barriers.on_span_demoted(b);
        let statuses = barriers.collect_statuses(&registry);
        assert_eq!(statuses[0].action, BarrierAction::Prepare);

        barriers.on_span_checkpoint(b, Ts(199));
        assert_eq!(
            barriers.collect_statuses(&registry)[0].action,
            BarrierAction::Release
        );
    }

    #[test]
    fn test_schema_scope_limits_span_set() {
        let mut registry = SpanRegistry::new(ChangefeedId::in_default_namespace("barrier-test"));
        let a = working_span(&mut registry, 1, 100);
        // A span of another schema.
        let other = registry.add_absent(
            TableSpan::table_record_range(TableId(9)),
            SchemaId(2),
            GroupId(9),
            Watermark::new(Ts(100)),
        );
        let node = NodeId::from("n1");
        registry.mark_scheduling(other, node.clone());
        registry.mark_working(other, &node);
        let mut barriers = controller(&registry);

        let mut event = ddl_event(200);
        event.scope = InfluenceScope::Schema(SchemaId(1));
        barriers.on_blocking_event(&registry, a, &event, Some(a));
        barriers.collect_statuses(&registry);

        // Only the schema's span owes an ack.
        barriers.on_span_checkpoint(other, Ts(199));
        let statuses = barriers.collect_statuses(&registry);
        assert_eq!(statuses[0].action, BarrierAction::Prepare);
        barriers.on_span_checkpoint(a, Ts(199));
        let statuses = barriers.collect_statuses(&registry);
        assert_eq!(statuses[0].action, BarrierAction::Ack);
    }
}
