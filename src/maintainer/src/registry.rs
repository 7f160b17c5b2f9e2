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

//! The replica set registry: the authoritative mapping from table spans to
//! their replication state, with the indexed views the schedulers and the
//! heartbeat path read.
//!
//! The registry is owned by the maintainer loop; every mutation happens on
//! that loop, so readers on the loop always observe a consistent snapshot.
//! External readers go through cloned snapshots.

use std::collections::{HashMap, HashSet};

use changeflow_common::{
    ChangefeedId, DispatcherId, GroupId, NodeId, SchemaId, TableId, TableSpan, Watermark,
};
use itertools::Itertools;

/// Maintainer-side lifecycle of one span.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ReplicationState {
    /// Known but not assigned to any node.
    Absent,
    /// An add or move operator is placing it on `node_id`.
    Scheduling,
    /// Confirmed replicating on `node_id`.
    Working,
    /// Being torn down; deleted once the owner confirms removal.
    Removing,
}

/// Registry entry for one span.
#[derive(Clone, Debug)]
pub struct SpanReplication {
    pub id: DispatcherId,
    pub span: TableSpan,
    pub schema_id: SchemaId,
    pub group: GroupId,
    pub state: ReplicationState,
    /// Current or intended owner. `None` iff Absent.
    pub node_id: Option<NodeId>,
    /// Last aggregated watermark; `checkpoint_ts` is monotonic across
    /// successful heartbeats.
    pub watermark: Watermark,
    /// Registry sequence assigned when the span was last introduced to a
    /// node. Heartbeats echo it so stale incarnations are detectable.
    pub add_seq: u64,
}

impl SpanReplication {
    pub fn table_id(&self) -> TableId {
        self.span.table_id
    }
}

pub struct SpanRegistry {
    changefeed_id: ChangefeedId,

    spans: HashMap<DispatcherId, SpanReplication>,
    span_index: HashMap<TableSpan, DispatcherId>,
    state_index: HashMap<ReplicationState, HashSet<DispatcherId>>,
    node_index: HashMap<NodeId, HashSet<DispatcherId>>,
    group_index: HashMap<GroupId, HashSet<DispatcherId>>,
    table_index: HashMap<TableId, HashSet<DispatcherId>>,

    /// Monotonic sequence bumped by every mutation that introduces a span to
    /// a node. See [`crate::watermark`] for the discipline built on it.
    add_seq: u64,
}

impl SpanRegistry {
    pub fn new(changefeed_id: ChangefeedId) -> Self {
        Self {
            changefeed_id,
            spans: HashMap::new(),
            span_index: HashMap::new(),
            state_index: HashMap::new(),
            node_index: HashMap::new(),
            group_index: HashMap::new(),
            table_index: HashMap::new(),
            add_seq: 0,
        }
    }

    pub fn changefeed_id(&self) -> &ChangefeedId {
        &self.changefeed_id
    }

    pub fn current_add_seq(&self) -> u64 {
        self.add_seq
    }

    fn next_add_seq(&mut self) -> u64 {
        self.add_seq += 1;
        self.add_seq
    }

    fn index_insert(&mut self, entry: &SpanReplication) {
        self.span_index.insert(entry.span.clone(), entry.id);
        self.state_index
            .entry(entry.state)
            .or_default()
            .insert(entry.id);
        if let Some(node) = &entry.node_id {
            self.node_index.entry(node.clone()).or_default().insert(entry.id);
        }
        self.group_index
            .entry(entry.group)
            .or_default()
            .insert(entry.id);
        self.table_index
            .entry(entry.table_id())
            .or_default()
            .insert(entry.id);
    }

    fn index_remove(&mut self, entry: &SpanReplication) {
        self.span_index.remove(&entry.span);
        if let Some(set) = self.state_index.get_mut(&entry.state) {
            set.remove(&entry.id);
        }
        if let Some(node) = &entry.node_id {
            if let Some(set) = self.node_index.get_mut(node) {
                set.remove(&entry.id);
                if set.is_empty() {
                    self.node_index.remove(node);
                }
            }
        }
        if let Some(set) = self.group_index.get_mut(&entry.group) {
            set.remove(&entry.id);
            if set.is_empty() {
                self.group_index.remove(&entry.group);
            }
        }
        if let Some(set) = self.table_index.get_mut(&entry.table_id()) {
            set.remove(&entry.id);
            if set.is_empty() {
                self.table_index.remove(&entry.table_id());
            }
        }
    }

    /// Apply `f` to the entry and rebuild every index it may have touched.
    fn mutate(&mut self, id: DispatcherId, f: impl FnOnce(&mut SpanReplication)) {
        let Some(mut entry) = self.spans.remove(&id) else {
            tracing::error!(dispatcher = %id, "mutating unknown span entry");
            return;
        };
        self.index_remove(&entry);
        f(&mut entry);
        self.index_insert(&entry);
        self.spans.insert(id, entry);
    }

    /// Register a new span with no owner, replicating from `start`.
    pub fn add_absent(
        &mut self,
        span: TableSpan,
        schema_id: SchemaId,
        group: GroupId,
        start: Watermark,
    ) -> DispatcherId {
        let id = DispatcherId::new();
        let add_seq = self.next_add_seq();
        let entry = SpanReplication {
            id,
            span,
            schema_id,
            group,
            state: ReplicationState::Absent,
            node_id: None,
            watermark: start,
            add_seq,
        };
        tracing::debug!(changefeed = %self.changefeed_id, dispatcher = %id, span = %entry.span, start_ts = %start.checkpoint_ts, "add absent span");
        self.index_insert(&entry);
        self.spans.insert(id, entry);
        id
    }

    /// Adopt a span a node already hosts (bootstrap reconciliation), keeping
    /// the node's reported identity and watermark.
    pub fn adopt_working(
        &mut self,
        id: DispatcherId,
        span: TableSpan,
        schema_id: SchemaId,
        group: GroupId,
        node: NodeId,
        watermark: Watermark,
    ) {
        let add_seq = self.next_add_seq();
        let entry = SpanReplication {
            id,
            span,
            schema_id,
            group,
            state: ReplicationState::Working,
            node_id: Some(node),
            watermark,
            add_seq,
        };
        tracing::info!(changefeed = %self.changefeed_id, dispatcher = %id, span = %entry.span, "adopt working span from bootstrap");
        self.index_insert(&entry);
        self.spans.insert(id, entry);
    }

    /// Bind the span to `node` and start scheduling it there. Allocates a
    /// fresh sequence: the node has not yet observed this incarnation.
    pub fn mark_scheduling(&mut self, id: DispatcherId, node: NodeId) {
        let add_seq = self.next_add_seq();
        self.mutate(id, |entry| {
            assert!(
                !matches!(entry.state, ReplicationState::Removing),
                "scheduling a removing span {}",
                entry.id,
            );
            entry.state = ReplicationState::Scheduling;
            entry.node_id = Some(node);
            entry.add_seq = add_seq;
        });
    }

    /// Confirm the span replicating on `node`. Only valid from Scheduling.
    pub fn mark_working(&mut self, id: DispatcherId, node: &NodeId) {
        self.mutate(id, |entry| {
            assert!(
                matches!(entry.state, ReplicationState::Scheduling),
                "span {} transitioned to working from {:?}",
                entry.id,
                entry.state,
            );
            assert_eq!(
                entry.node_id.as_ref(),
                Some(node),
                "span {} working on unexpected node",
                entry.id,
            );
            entry.state = ReplicationState::Working;
        });
    }

    /// Begin tearing the span down. Valid from any non-terminal state; the
    /// caller also cancels any in-flight operator targeting the span.
    pub fn mark_removing(&mut self, id: DispatcherId) {
        self.mutate(id, |entry| {
            entry.state = ReplicationState::Removing;
        });
    }

    /// Unbind the span from its node after an owner loss, keeping its last
    /// watermark so the changefeed checkpoint cannot advance past it.
    pub fn demote_to_absent(&mut self, id: DispatcherId) {
        self.mutate(id, |entry| {
            entry.state = ReplicationState::Absent;
            entry.node_id = None;
        });
    }

    pub fn delete(&mut self, id: DispatcherId) -> Option<SpanReplication> {
        let entry = self.spans.remove(&id)?;
        self.index_remove(&entry);
        tracing::debug!(changefeed = %self.changefeed_id, dispatcher = %id, "delete span entry");
        Some(entry)
    }

    /// Fold a reported watermark into the entry, monotonically. Returns
    /// whether the checkpoint advanced.
    pub fn update_watermark(&mut self, id: DispatcherId, watermark: Watermark) -> bool {
        let Some(entry) = self.spans.get_mut(&id) else {
            return false;
        };
        entry.watermark.advance_to(watermark)
    }

    pub fn get(&self, id: DispatcherId) -> Option<&SpanReplication> {
        self.spans.get(&id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &SpanReplication> {
        self.spans.values()
    }

    pub fn get_by_span(&self, span: &TableSpan) -> Option<&SpanReplication> {
        self.span_index.get(span).and_then(|id| self.spans.get(id))
    }

    pub fn contains(&self, id: DispatcherId) -> bool {
        self.spans.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn ids_by_state(&self, state: ReplicationState) -> Vec<DispatcherId> {
        self.state_index
            .get(&state)
            .map(|set| set.iter().copied().sorted().collect())
            .unwrap_or_default()
    }

    pub fn size_by_state(&self, state: ReplicationState) -> usize {
        self.state_index.get(&state).map_or(0, |set| set.len())
    }

    pub fn absent_size(&self) -> usize {
        self.size_by_state(ReplicationState::Absent)
    }

    pub fn ids_by_node(&self, node: &NodeId) -> Vec<DispatcherId> {
        self.node_index
            .get(node)
            .map(|set| set.iter().copied().sorted().collect())
            .unwrap_or_default()
    }

    pub fn ids_by_group(&self, group: GroupId) -> Vec<DispatcherId> {
        self.group_index
            .get(&group)
            .map(|set| set.iter().copied().sorted().collect())
            .unwrap_or_default()
    }

    pub fn ids_by_table(&self, table_id: TableId) -> Vec<DispatcherId> {
        self.table_index
            .get(&table_id)
            .map(|set| set.iter().copied().sorted().collect())
            .unwrap_or_default()
    }

    pub fn groups(&self) -> Vec<GroupId> {
        self.group_index.keys().copied().sorted().collect()
    }

    pub fn tables(&self) -> Vec<TableId> {
        self.table_index.keys().copied().sorted().collect()
    }

    /// Spans of `group` confirmed replicating, for the balance scheduler.
    pub fn working_ids_by_group(&self, group: GroupId) -> Vec<DispatcherId> {
        self.ids_by_group(group)
            .into_iter()
            .filter(|id| matches!(self.spans[id].state, ReplicationState::Working))
            .collect()
    }

    fn is_scheduled(&self, id: DispatcherId) -> bool {
        matches!(
            self.spans[&id].state,
            ReplicationState::Scheduling | ReplicationState::Working
        )
    }

    /// Scheduled (Scheduling or Working) task count per node, with an entry
    /// for every node in `nodes` even when zero.
    pub fn task_size_per_node<'a>(
        &self,
        nodes: impl IntoIterator<Item = &'a NodeId>,
    ) -> HashMap<NodeId, usize> {
        let mut sizes: HashMap<NodeId, usize> =
            nodes.into_iter().map(|n| (n.clone(), 0)).collect();
        for (node, ids) in &self.node_index {
            let scheduled = ids.iter().filter(|id| self.is_scheduled(**id)).count();
            if let Some(size) = sizes.get_mut(node) {
                *size += scheduled;
            }
        }
        sizes
    }

    /// Like [`Self::task_size_per_node`], restricted to one group.
    pub fn task_size_per_node_by_group<'a>(
        &self,
        nodes: impl IntoIterator<Item = &'a NodeId>,
        group: GroupId,
    ) -> HashMap<NodeId, usize> {
        let mut sizes: HashMap<NodeId, usize> =
            nodes.into_iter().map(|n| (n.clone(), 0)).collect();
        for id in self.group_index.get(&group).into_iter().flatten() {
            let entry = &self.spans[id];
            if !self.is_scheduled(*id) {
                continue;
            }
            if let Some(size) = entry.node_id.as_ref().and_then(|n| sizes.get_mut(n)) {
                *size += 1;
            }
        }
        sizes
    }

    /// For each group, one working span per alive node if the node hosts
    /// any. Feeds the global balance phase, which spreads group membership
    /// rather than totals.
    pub fn group_node_tasks<'a>(
        &self,
        nodes: impl IntoIterator<Item = &'a NodeId> + Clone,
    ) -> HashMap<GroupId, HashMap<NodeId, Option<DispatcherId>>> {
        let mut result = HashMap::with_capacity(self.group_index.len());
        for group in self.groups() {
            let mut node_tasks: HashMap<NodeId, Option<DispatcherId>> = nodes
                .clone()
                .into_iter()
                .map(|n| (n.clone(), None))
                .collect();
            for id in self.working_ids_by_group(group) {
                let node = self.spans[&id].node_id.clone().unwrap();
                if let Some(slot) = node_tasks.get_mut(&node) {
                    slot.get_or_insert(id);
                }
            }
            result.insert(group, node_tasks);
        }
        result
    }

    /// Copy-on-read snapshot for readers outside the maintainer loop.
    pub fn snapshot(&self) -> Vec<SpanReplication> {
        self.spans.values().cloned().sorted_by_key(|e| e.id).collect()
    }
}
