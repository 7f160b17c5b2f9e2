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

//! Scheduling operators: every mutation of span ownership is reified as a
//! small state machine driven to completion by [`OperatorController`], which
//! enforces one operator per span, per-node concurrency caps, deadlines and
//! a bounded retry budget.
//!
//! An operator finishes when the heartbeat path observes the target span in
//! the expected post-state on the expected node, never merely because its
//! message was sent.

use std::collections::HashMap;
use std::time::Duration;

use changeflow_common::protocol::{
    DispatcherState, MergeDispatcherRequest, Message, ScheduleAction, ScheduleDispatcherRequest,
    SpanHeartbeat,
};
use changeflow_common::{DispatcherId, NodeId, TableSpan, Watermark};
use tokio::time::Instant;

use crate::metrics::MaintainerMetricsRef;
use crate::registry::{ReplicationState, SpanRegistry};

/// Which leg of a two-leg move is in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveLeg {
    RemovingFromOrigin,
    AddingToDest,
}

#[derive(Clone, Debug)]
pub enum OperatorKind {
    /// Place the span on `dest`.
    Add { dest: NodeId },
    /// Tear the span down on `origin` and delete its entry.
    Remove { origin: NodeId },
    /// Relocate the span, origin leg first so ownership never overlaps.
    Move {
        origin: NodeId,
        dest: NodeId,
        leg: MoveLeg,
    },
    /// Replace the span with children covering the same range. Children
    /// inherit the parent watermark and start out Absent.
    Split {
        origin: NodeId,
        children: Vec<TableSpan>,
    },
    /// Fuse co-located source spans into `merged_span` under a fresh id.
    Merge {
        node: NodeId,
        source_ids: Vec<DispatcherId>,
        merged_span: TableSpan,
    },
}

impl OperatorKind {
    fn name(&self) -> &'static str {
        match self {
            OperatorKind::Add { .. } => "add",
            OperatorKind::Remove { .. } => "remove",
            OperatorKind::Move { .. } => "move",
            OperatorKind::Split { .. } => "split",
            OperatorKind::Merge { .. } => "merge",
        }
    }

    /// The node the next message goes to.
    fn target_node(&self) -> &NodeId {
        match self {
            OperatorKind::Add { dest } => dest,
            OperatorKind::Remove { origin } => origin,
            OperatorKind::Move { origin, dest, leg } => match leg {
                MoveLeg::RemovingFromOrigin => origin,
                MoveLeg::AddingToDest => dest,
            },
            OperatorKind::Split { origin, .. } => origin,
            OperatorKind::Merge { node, .. } => node,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorPhase {
    /// Accepted but not yet sent (possibly queued on the per-node cap).
    Issued,
    /// Message handed to the transport this cycle.
    Sent,
    /// Waiting for the heartbeat path to observe the post-state.
    AwaitingAck,
    Finished,
    Failed,
}

pub struct SpanOperator {
    /// The span the operator acts on. For Merge this is the merged id, which
    /// enters the registry only on completion.
    pub id: DispatcherId,
    pub kind: OperatorKind,
    pub phase: OperatorPhase,
    deadline: Option<Instant>,
    attempts: u32,
}

impl SpanOperator {
    pub fn add(id: DispatcherId, dest: NodeId) -> Self {
        Self::new(id, OperatorKind::Add { dest })
    }

    pub fn remove(id: DispatcherId, origin: NodeId) -> Self {
        Self::new(id, OperatorKind::Remove { origin })
    }

    pub fn relocate(id: DispatcherId, origin: NodeId, dest: NodeId) -> Self {
        Self::new(
            id,
            OperatorKind::Move {
                origin,
                dest,
                leg: MoveLeg::RemovingFromOrigin,
            },
        )
    }

    pub fn split(id: DispatcherId, origin: NodeId, children: Vec<TableSpan>) -> Self {
        Self::new(id, OperatorKind::Split { origin, children })
    }

    pub fn merge(
        merged_id: DispatcherId,
        node: NodeId,
        source_ids: Vec<DispatcherId>,
        merged_span: TableSpan,
    ) -> Self {
        Self::new(
            merged_id,
            OperatorKind::Merge {
                node,
                source_ids,
                merged_span,
            },
        )
    }

    fn new(id: DispatcherId, kind: OperatorKind) -> Self {
        Self {
            id,
            kind,
            phase: OperatorPhase::Issued,
            deadline: None,
            attempts: 0,
        }
    }

    /// Every span id the operator occupies for the single-flight rule.
    fn occupied_spans(&self) -> Vec<DispatcherId> {
        match &self.kind {
            OperatorKind::Merge { source_ids, .. } => {
                let mut ids = source_ids.clone();
                ids.push(self.id);
                ids
            }
            _ => vec![self.id],
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self.phase, OperatorPhase::Finished | OperatorPhase::Failed)
    }

    fn build_message(&self, registry: &SpanRegistry) -> Option<Message> {
        let changefeed_id = registry.changefeed_id().clone();
        match &self.kind {
            OperatorKind::Add { .. }
            | OperatorKind::Move {
                leg: MoveLeg::AddingToDest,
                ..
            } => {
                let entry = registry.get(self.id)?;
                Some(Message::ScheduleDispatcher(ScheduleDispatcherRequest {
                    changefeed_id,
                    action: ScheduleAction::Create,
                    id: self.id,
                    span: entry.span.clone(),
                    start_ts: entry.watermark.checkpoint_ts,
                    schema_id: entry.schema_id,
                    group: entry.group,
                    add_seq: entry.add_seq,
                }))
            }
            OperatorKind::Remove { .. }
            | OperatorKind::Move {
                leg: MoveLeg::RemovingFromOrigin,
                ..
            }
            | OperatorKind::Split { .. } => {
                let entry = registry.get(self.id)?;
                Some(Message::ScheduleDispatcher(ScheduleDispatcherRequest {
                    changefeed_id,
                    action: ScheduleAction::Remove,
                    id: self.id,
                    span: entry.span.clone(),
                    start_ts: entry.watermark.checkpoint_ts,
                    schema_id: entry.schema_id,
                    group: entry.group,
                    add_seq: entry.add_seq,
                }))
            }
            OperatorKind::Merge {
                source_ids,
                merged_span,
                ..
            } => Some(Message::MergeDispatcher(MergeDispatcherRequest {
                changefeed_id,
                source_ids: source_ids.clone(),
                merged_id: self.id,
                merged_span: merged_span.clone(),
                add_seq: registry.current_add_seq(),
            })),
        }
    }
}

/// Outcome of feeding one heartbeat span report to the controller.
pub enum ReportOutcome {
    /// The report belonged to an operator and was consumed.
    Consumed,
    /// No operator occupies the span; the regular heartbeat path applies.
    NotMine,
}

pub struct OperatorController {
    operators: HashMap<DispatcherId, SpanOperator>,
    /// span id -> primary operator id, covering every occupied span.
    occupied: HashMap<DispatcherId, DispatcherId>,

    timeout: Duration,
    max_attempts: u32,
    max_per_node: usize,

    metrics: MaintainerMetricsRef,
}

impl OperatorController {
    pub fn new(
        timeout: Duration,
        max_attempts: u32,
        max_per_node: usize,
        metrics: MaintainerMetricsRef,
    ) -> Self {
        Self {
            operators: HashMap::new(),
            occupied: HashMap::new(),
            timeout,
            max_attempts,
            max_per_node,
            metrics,
        }
    }

    pub fn operator_size(&self) -> usize {
        self.operators.len()
    }

    pub fn has_operator(&self, span: DispatcherId) -> bool {
        self.occupied.contains_key(&span)
    }

    /// Accept an operator unless any span it touches already has one.
    /// Applies the registry transition that reserves the span.
    pub fn add_operator(&mut self, registry: &mut SpanRegistry, op: SpanOperator) -> bool {
        let occupied_spans = op.occupied_spans();
        if occupied_spans.iter().any(|id| self.occupied.contains_key(id)) {
            return false;
        }
        match &op.kind {
            OperatorKind::Add { dest } => {
                registry.mark_scheduling(op.id, dest.clone());
            }
            OperatorKind::Remove { .. } => {
                if registry
                    .get(op.id)
                    .is_some_and(|e| e.state != ReplicationState::Removing)
                {
                    registry.mark_removing(op.id);
                }
            }
            OperatorKind::Move { .. }
            | OperatorKind::Split { .. }
            | OperatorKind::Merge { .. } => {
                // Source entries stay Working until the protocol confirms
                // them gone; the occupied set alone blocks rescheduling.
            }
        }
        tracing::debug!(
            changefeed = %registry.changefeed_id(),
            dispatcher = %op.id,
            kind = op.kind.name(),
            "operator accepted"
        );
        self.metrics
            .operator_count
            .with_label_values(&[op.kind.name(), "created"])
            .inc();
        for span in occupied_spans {
            self.occupied.insert(span, op.id);
        }
        self.operators.insert(op.id, op);
        true
    }

    /// Drop the operator occupying `span`, without registry effects. Used
    /// when the span transitions to Removing out from under its operator.
    pub fn cancel(&mut self, span: DispatcherId) -> bool {
        let Some(primary) = self.occupied.get(&span).copied() else {
            return false;
        };
        let op = self.operators.remove(&primary).expect("occupied implies present");
        self.release(&op);
        self.metrics
            .operator_count
            .with_label_values(&[op.kind.name(), "cancelled"])
            .inc();
        true
    }

    fn release(&mut self, op: &SpanOperator) {
        for span in op.occupied_spans() {
            self.occupied.remove(&span);
        }
    }

    /// Drive every operator one step: send queued messages subject to the
    /// per-node cap, retransmit on deadline, and fail operators out of
    /// attempts. Returns the messages to hand to the transport.
    pub fn poll(&mut self, registry: &mut SpanRegistry, now: Instant) -> Vec<(NodeId, Message)> {
        let mut in_flight: HashMap<NodeId, usize> = HashMap::new();
        for op in self.operators.values() {
            if matches!(op.phase, OperatorPhase::Sent | OperatorPhase::AwaitingAck) {
                *in_flight.entry(op.kind.target_node().clone()).or_default() += 1;
            }
        }

        let mut messages = Vec::new();
        let mut terminal = Vec::new();
        let ids: Vec<_> = self.operators.keys().copied().collect();
        for id in ids {
            let op = self.operators.get_mut(&id).expect("iterating known ids");
            match op.phase {
                OperatorPhase::Issued => {
                    let node = op.kind.target_node().clone();
                    let slots = in_flight.entry(node.clone()).or_default();
                    if *slots >= self.max_per_node {
                        continue;
                    }
                    if let Some(message) = op.build_message(registry) {
                        *slots += 1;
                        op.phase = OperatorPhase::Sent;
                        op.attempts += 1;
                        op.deadline = Some(now + self.timeout);
                        messages.push((node, message));
                    } else {
                        // The entry vanished under the operator.
                        op.phase = OperatorPhase::Failed;
                    }
                }
                OperatorPhase::Sent | OperatorPhase::AwaitingAck => {
                    if op.phase == OperatorPhase::Sent {
                        op.phase = OperatorPhase::AwaitingAck;
                    }
                    if op.deadline.is_some_and(|d| now >= d) {
                        if op.attempts >= self.max_attempts {
                            tracing::warn!(
                                dispatcher = %op.id,
                                kind = op.kind.name(),
                                attempts = op.attempts,
                                "operator out of attempts"
                            );
                            op.phase = OperatorPhase::Failed;
                        } else if let Some(message) = op.build_message(registry) {
                            op.attempts += 1;
                            op.deadline = Some(now + self.timeout);
                            messages.push((op.kind.target_node().clone(), message));
                        } else {
                            op.phase = OperatorPhase::Failed;
                        }
                    }
                }
                OperatorPhase::Finished | OperatorPhase::Failed => {}
            }
            if op.is_terminal() {
                terminal.push(id);
            }
        }

        for id in terminal {
            let op = self.operators.remove(&id).expect("collected above");
            self.release(&op);
            match op.phase {
                OperatorPhase::Finished => self.on_finished(&op),
                OperatorPhase::Failed => self.on_failed(registry, &op),
                _ => unreachable!(),
            }
        }
        messages
    }

    fn on_finished(&mut self, op: &SpanOperator) {
        tracing::debug!(dispatcher = %op.id, kind = op.kind.name(), "operator finished");
        self.metrics
            .operator_count
            .with_label_values(&[op.kind.name(), "finished"])
            .inc();
    }

    /// Leave the registry in a state the next scheduler tick can repair.
    fn on_failed(&mut self, registry: &mut SpanRegistry, op: &SpanOperator) {
        tracing::warn!(dispatcher = %op.id, kind = op.kind.name(), "operator failed");
        self.metrics
            .operator_count
            .with_label_values(&[op.kind.name(), "failed"])
            .inc();
        match &op.kind {
            OperatorKind::Add { .. } => {
                if registry.contains(op.id) {
                    registry.demote_to_absent(op.id);
                }
            }
            OperatorKind::Move { leg, .. } => {
                // After the origin leg the span lives nowhere; before it, the
                // origin still owns it and nothing is lost.
                if *leg == MoveLeg::AddingToDest && registry.contains(op.id) {
                    registry.demote_to_absent(op.id);
                }
            }
            OperatorKind::Remove { .. } => {
                // Entry stays Removing; the maintainer re-issues removal.
            }
            OperatorKind::Split { .. } | OperatorKind::Merge { .. } => {
                // Sources are untouched until confirmation, so a failed
                // split/merge simply leaves the original layout.
            }
        }
    }

    /// Feed one heartbeat span report. Consumes it if an operator occupies
    /// the span and the report is from the node the operator watches.
    pub fn on_span_report(
        &mut self,
        registry: &mut SpanRegistry,
        node: &NodeId,
        report: &SpanHeartbeat,
    ) -> ReportOutcome {
        let Some(primary) = self.occupied.get(&report.id).copied() else {
            return ReportOutcome::NotMine;
        };
        let op = self.operators.get_mut(&primary).expect("occupied implies present");
        let working = matches!(
            report.state,
            DispatcherState::Working | DispatcherState::Blocked
        );
        match &mut op.kind {
            OperatorKind::Add { dest } => {
                if *node == *dest && working {
                    registry.update_watermark(op.id, report.watermark());
                    registry.mark_working(op.id, node);
                    op.phase = OperatorPhase::Finished;
                }
            }
            OperatorKind::Remove { origin } => {
                if *node == *origin && report.state == DispatcherState::Removed {
                    registry.delete(op.id);
                    op.phase = OperatorPhase::Finished;
                }
            }
            OperatorKind::Move { origin, dest, leg } => match leg {
                MoveLeg::RemovingFromOrigin => {
                    if *node == *origin {
                        // The origin's final watermark is the point the new
                        // owner resumes from.
                        registry.update_watermark(op.id, report.watermark());
                        if report.state == DispatcherState::Removed {
                            let dest = dest.clone();
                            *leg = MoveLeg::AddingToDest;
                            registry.mark_scheduling(op.id, dest);
                            op.phase = OperatorPhase::Issued;
                            op.deadline = None;
                            op.attempts = 0;
                        }
                    }
                }
                MoveLeg::AddingToDest => {
                    if *node == *dest && working {
                        registry.update_watermark(op.id, report.watermark());
                        registry.mark_working(op.id, node);
                        op.phase = OperatorPhase::Finished;
                    }
                }
            },
            OperatorKind::Split { origin, children } => {
                if *node == *origin {
                    registry.update_watermark(op.id, report.watermark());
                    if report.state == DispatcherState::Removed {
                        let children = std::mem::take(children);
                        let parent = registry.delete(op.id).expect("split parent present");
                        for child in children {
                            registry.add_absent(
                                child,
                                parent.schema_id,
                                parent.group,
                                parent.watermark,
                            );
                        }
                        op.phase = OperatorPhase::Finished;
                    }
                }
            }
            OperatorKind::Merge {
                node: host,
                source_ids,
                merged_span,
            } => {
                if *node == *host && report.id == op.id && working {
                    let mut watermark = Watermark::MAX;
                    let (schema_id, group) = {
                        let first = registry
                            .get(source_ids[0])
                            .expect("merge sources present until confirmation");
                        (first.schema_id, first.group)
                    };
                    for source in source_ids.clone() {
                        if let Some(entry) = registry.delete(source) {
                            watermark.fold_min(entry.watermark);
                        }
                    }
                    // Trust the node's own report if it is further along.
                    watermark.advance_to(report.watermark());
                    registry.adopt_working(
                        op.id,
                        merged_span.clone(),
                        schema_id,
                        group,
                        host.clone(),
                        watermark,
                    );
                    op.phase = OperatorPhase::Finished;
                }
            }
        }
        if op.is_terminal() {
            let op = self.operators.remove(&primary).expect("present");
            self.release(&op);
            match op.phase {
                OperatorPhase::Finished => self.on_finished(&op),
                OperatorPhase::Failed => self.on_failed(registry, &op),
                _ => unreachable!(),
            }
        }
        ReportOutcome::Consumed
    }

    /// Cascade a node loss into every operator touching it.
    pub fn on_node_removed(&mut self, registry: &mut SpanRegistry, node: &NodeId) {
        let ids: Vec<_> = self.operators.keys().copied().collect();
        for id in ids {
            let op = self.operators.get_mut(&id).expect("iterating known ids");
            let affected = match &mut op.kind {
                OperatorKind::Add { dest } => *dest == *node,
                OperatorKind::Remove { origin } => {
                    if *origin == *node {
                        // The dispatcher died with its node; removal is done.
                        registry.delete(op.id);
                        op.phase = OperatorPhase::Finished;
                    }
                    false
                }
                OperatorKind::Move { origin, dest, leg } => match leg {
                    MoveLeg::RemovingFromOrigin if *origin == *node => {
                        // Origin is gone, so the removal leg is complete.
                        let dest = dest.clone();
                        *leg = MoveLeg::AddingToDest;
                        registry.mark_scheduling(op.id, dest);
                        op.phase = OperatorPhase::Issued;
                        op.deadline = None;
                        op.attempts = 0;
                        false
                    }
                    // Losing the destination fails the move; the origin
                    // (if still up) keeps replicating.
                    MoveLeg::RemovingFromOrigin => *dest == *node,
                    MoveLeg::AddingToDest => *dest == *node,
                },
                OperatorKind::Split { origin, children } => {
                    if *origin == *node {
                        // Parent died before splitting: apply the split from
                        // the last known watermark, children start Absent.
                        let children = std::mem::take(children);
                        let parent = registry.delete(op.id).expect("split parent present");
                        for child in children {
                            registry.add_absent(
                                child,
                                parent.schema_id,
                                parent.group,
                                parent.watermark,
                            );
                        }
                        op.phase = OperatorPhase::Finished;
                    }
                    false
                }
                OperatorKind::Merge { node: host, .. } => *host == *node,
            };
            if affected {
                op.phase = OperatorPhase::Failed;
            }
        }
        self.reap(registry);
    }

    /// Fail every in-flight operator, for shutdown.
    pub fn drain_all(&mut self, registry: &mut SpanRegistry) {
        for op in self.operators.values_mut() {
            op.phase = OperatorPhase::Failed;
        }
        self.reap(registry);
    }

    fn reap(&mut self, registry: &mut SpanRegistry) {
        let terminal: Vec<_> = self
            .operators
            .iter()
            .filter(|(_, op)| op.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in terminal {
            let op = self.operators.remove(&id).expect("collected above");
            self.release(&op);
            match op.phase {
                OperatorPhase::Finished => self.on_finished(&op),
                OperatorPhase::Failed => self.on_failed(registry, &op),
                _ => unreachable!(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use changeflow_common::{ChangefeedId, GroupId, SchemaId, TableId, TableSpan, Ts};

    use super::*;
    use crate::metrics::MaintainerMetrics;

    fn setup() -> (SpanRegistry, OperatorController) {
        let registry = SpanRegistry::new(ChangefeedId::in_default_namespace("op-test"));
        let controller = OperatorController::new(
            Duration::from_secs(10),
            3,
            64,
            MaintainerMetrics::for_test(),
        );
        (registry, controller)
    }

    fn absent_span(registry: &mut SpanRegistry, table_id: i64) -> DispatcherId {
        registry.add_absent(
            TableSpan::table_record_range(TableId(table_id)),
            SchemaId(1),
            GroupId(table_id),
            Watermark::new(Ts(100)),
        )
    }

    fn report(id: DispatcherId, state: DispatcherState, ts: u64, add_seq: u64) -> SpanHeartbeat {
        SpanHeartbeat {
            id,
            state,
            checkpoint_ts: Ts(ts),
            resolved_ts: Ts(ts),
            add_seq,
            blocking: None,
        }
    }

    #[test]
    fn test_add_operator_is_single_flight() {
        let (mut registry, mut controller) = setup();
        let id = absent_span(&mut registry, 1);
        let n1 = NodeId::from("n1");

        assert!(controller.add_operator(&mut registry, SpanOperator::add(id, n1.clone())));
        // The second operator targeting the same span is rejected.
        assert!(!controller.add_operator(&mut registry, SpanOperator::add(id, n1.clone())));
        assert_eq!(controller.operator_size(), 1);
        assert_eq!(
            registry.get(id).unwrap().state,
            ReplicationState::Scheduling
        );
    }

    #[test]
    fn test_add_finishes_on_working_report() {
        let (mut registry, mut controller) = setup();
        let id = absent_span(&mut registry, 1);
        let n1 = NodeId::from("n1");
        controller.add_operator(&mut registry, SpanOperator::add(id, n1.clone()));

        let messages = controller.poll(&mut registry, Instant::now());
        assert_eq!(messages.len(), 1);
        assert_matches::assert_matches!(
            &messages[0].1,
            Message::ScheduleDispatcher(req) if req.action == ScheduleAction::Create
        );

        let seq = registry.get(id).unwrap().add_seq;
        controller.on_span_report(&mut registry, &n1, &report(id, DispatcherState::Working, 120, seq));
        assert_eq!(controller.operator_size(), 0);
        assert_eq!(registry.get(id).unwrap().state, ReplicationState::Working);
        assert_eq!(registry.get(id).unwrap().watermark.checkpoint_ts, Ts(120));
    }

    #[test]
    fn test_deadline_retries_then_fails() {
        let (mut registry, mut controller) = setup();
        let id = absent_span(&mut registry, 1);
        let n1 = NodeId::from("n1");
        controller.add_operator(&mut registry, SpanOperator::add(id, n1));

        let t0 = Instant::now();
        assert_eq!(controller.poll(&mut registry, t0).len(), 1);
        // Two deadline expiries retransmit, the third exhausts the budget.
        assert_eq!(
            controller.poll(&mut registry, t0 + Duration::from_secs(11)).len(),
            1
        );
        assert_eq!(
            controller.poll(&mut registry, t0 + Duration::from_secs(22)).len(),
            1
        );
        assert_eq!(
            controller.poll(&mut registry, t0 + Duration::from_secs(33)).len(),
            0
        );
        assert_eq!(controller.operator_size(), 0);
        assert_eq!(registry.get(id).unwrap().state, ReplicationState::Absent);
    }

    #[test]
    fn test_move_round_trip_restores_layout() {
        let (mut registry, mut controller) = setup();
        let id = absent_span(&mut registry, 1);
        let n1 = NodeId::from("n1");
        let n2 = NodeId::from("n2");
        registry.mark_scheduling(id, n1.clone());
        registry.mark_working(id, &n1);

        for (from, to) in [(n1.clone(), n2.clone()), (n2.clone(), n1.clone())] {
            assert!(controller.add_operator(
                &mut registry,
                SpanOperator::relocate(id, from.clone(), to.clone())
            ));
            let messages = controller.poll(&mut registry, Instant::now());
            assert_matches::assert_matches!(
                &messages[0].1,
                Message::ScheduleDispatcher(req) if req.action == ScheduleAction::Remove
            );
            controller.on_span_report(
                &mut registry,
                &from,
                &report(id, DispatcherState::Removed, 150, 0),
            );
            assert_eq!(
                registry.get(id).unwrap().state,
                ReplicationState::Scheduling
            );
            let messages = controller.poll(&mut registry, Instant::now());
            assert_matches::assert_matches!(
                &messages[0].1,
                Message::ScheduleDispatcher(req) if req.action == ScheduleAction::Create
            );
            let seq = registry.get(id).unwrap().add_seq;
            controller.on_span_report(
                &mut registry,
                &to,
                &report(id, DispatcherState::Working, 150, seq),
            );
            assert_eq!(controller.operator_size(), 0);
            let entry = registry.get(id).unwrap();
            assert_eq!(entry.state, ReplicationState::Working);
            assert_eq!(entry.node_id.as_ref(), Some(&to));
        }
    }

    #[test]
    fn test_remove_finishes_on_node_loss() {
        let (mut registry, mut controller) = setup();
        let id = absent_span(&mut registry, 1);
        let n1 = NodeId::from("n1");
        registry.mark_scheduling(id, n1.clone());
        registry.mark_working(id, &n1);

        controller.add_operator(&mut registry, SpanOperator::remove(id, n1.clone()));
        controller.poll(&mut registry, Instant::now());
        controller.on_node_removed(&mut registry, &n1);
        assert_eq!(controller.operator_size(), 0);
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn test_move_survives_origin_loss() {
        let (mut registry, mut controller) = setup();
        let id = absent_span(&mut registry, 1);
        let n1 = NodeId::from("n1");
        let n2 = NodeId::from("n2");
        registry.mark_scheduling(id, n1.clone());
        registry.mark_working(id, &n1);

        controller.add_operator(&mut registry, SpanOperator::relocate(id, n1.clone(), n2.clone()));
        controller.poll(&mut registry, Instant::now());
        controller.on_node_removed(&mut registry, &n1);

        // The removal leg completed implicitly; the add leg proceeds.
        assert_eq!(controller.operator_size(), 1);
        let messages = controller.poll(&mut registry, Instant::now());
        assert_matches::assert_matches!(
            &messages[0].1,
            Message::ScheduleDispatcher(req) if req.action == ScheduleAction::Create
        );
        let seq = registry.get(id).unwrap().add_seq;
        controller.on_span_report(&mut registry, &n2, &report(id, DispatcherState::Working, 150, seq));
        assert_eq!(registry.get(id).unwrap().node_id.as_ref(), Some(&n2));
    }

    #[test]
    fn test_split_replaces_parent_with_children() {
        let (mut registry, mut controller) = setup();
        let id = absent_span(&mut registry, 1);
        let n1 = NodeId::from("n1");
        registry.mark_scheduling(id, n1.clone());
        registry.mark_working(id, &n1);
        registry.update_watermark(
            id,
            Watermark {
                checkpoint_ts: Ts(200),
                resolved_ts: Ts(210),
            },
        );

        let parent = registry.get(id).unwrap().span.clone();
        let mut boundary = parent.start_key.to_vec();
        boundary.push(0x80);
        let children = parent.split_at([bytes::Bytes::from(boundary)]);
        assert_eq!(children.len(), 2);

        controller.add_operator(
            &mut registry,
            SpanOperator::split(id, n1.clone(), children.clone()),
        );
        controller.poll(&mut registry, Instant::now());
        controller.on_span_report(&mut registry, &n1, &report(id, DispatcherState::Removed, 205, 0));

        assert!(registry.get(id).is_none());
        assert_eq!(registry.absent_size(), 2);
        for child in &children {
            let entry = registry.get_by_span(child).unwrap();
            // Children inherit both components of the parent watermark.
            assert_eq!(entry.watermark.checkpoint_ts, Ts(205));
            assert_eq!(entry.watermark.resolved_ts, Ts(210));
        }
    }

    #[test]
    fn test_merge_fuses_sources() {
        let (mut registry, mut controller) = setup();
        let n1 = NodeId::from("n1");
        let parent = TableSpan::table_record_range(TableId(7));
        let mut boundary = parent.start_key.to_vec();
        boundary.push(0x80);
        let children = parent.split_at([bytes::Bytes::from(boundary)]);

        let mut source_ids = vec![];
        for (i, child) in children.iter().enumerate() {
            let id = registry.add_absent(
                child.clone(),
                SchemaId(1),
                GroupId(7),
                Watermark::new(Ts(100 + i as u64)),
            );
            registry.mark_scheduling(id, n1.clone());
            registry.mark_working(id, &n1);
            source_ids.push(id);
        }

        let merged_id = DispatcherId::new();
        controller.add_operator(
            &mut registry,
            SpanOperator::merge(merged_id, n1.clone(), source_ids.clone(), parent.clone()),
        );
        let messages = controller.poll(&mut registry, Instant::now());
        assert_matches::assert_matches!(&messages[0].1, Message::MergeDispatcher(_));

        controller.on_span_report(
            &mut registry,
            &n1,
            &report(merged_id, DispatcherState::Working, 0, 0),
        );
        assert_eq!(controller.operator_size(), 0);
        for id in source_ids {
            assert!(registry.get(id).is_none());
        }
        let merged = registry.get(merged_id).unwrap();
        assert_eq!(merged.span, parent);
        assert_eq!(merged.state, ReplicationState::Working);
        // The merged watermark is the min over the sources.
        assert_eq!(merged.watermark.checkpoint_ts, Ts(100));
    }
}
