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

//! Bootstrap handshake: before scheduling against a node, the maintainer
//! asks it for its current dispatcher inventory and reconciles the answer
//! into the registry. The registry is never persisted; this handshake is how
//! a restarted maintainer recovers it.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use changeflow_common::protocol::{
    BootstrapRequest, BootstrapResponse, Message, ScheduleAction, ScheduleDispatcherRequest,
};
use changeflow_common::{ChangefeedId, Epoch, NodeId, NodeInfo, SchemaId, TableId};
use tokio::time::Instant;

use crate::registry::{ReplicationState, SpanRegistry};

#[derive(Debug)]
enum HandshakeState {
    Sent { deadline: Instant },
    Responded,
}

pub struct Bootstrapper {
    changefeed_id: ChangefeedId,
    /// The maintainer's epoch, carried in every request so nodes can discard
    /// requests from a superseded maintainer.
    epoch: Epoch,
    timeout: Duration,

    nodes: HashMap<NodeId, HandshakeState>,
}

impl Bootstrapper {
    pub fn new(changefeed_id: ChangefeedId, epoch: Epoch, timeout: Duration) -> Self {
        Self {
            changefeed_id,
            epoch,
            timeout,
            nodes: HashMap::new(),
        }
    }

    /// Start the handshake with every listed node. Returns the requests to
    /// send. Nodes already in the handshake are left alone.
    pub fn handle_new_nodes(
        &mut self,
        nodes: impl IntoIterator<Item = NodeInfo>,
        now: Instant,
    ) -> Vec<(NodeId, Message)> {
        let mut requests = Vec::new();
        for info in nodes {
            if self.nodes.contains_key(&info.id) {
                continue;
            }
            tracing::info!(changefeed = %self.changefeed_id, node = %info.id, "bootstrap node");
            self.nodes.insert(
                info.id.clone(),
                HandshakeState::Sent {
                    deadline: now + self.timeout,
                },
            );
            requests.push((
                info.id,
                Message::BootstrapRequest(BootstrapRequest {
                    changefeed_id: self.changefeed_id.clone(),
                    epoch: self.epoch,
                }),
            ));
        }
        requests
    }

    pub fn handle_node_removed(&mut self, node: &NodeId) {
        self.nodes.remove(node);
    }

    /// Mark the node responded. Returns false for a node we never asked
    /// (stale response from an old incarnation).
    pub fn handle_response(&mut self, node: &NodeId) -> bool {
        match self.nodes.get_mut(node) {
            Some(state) => {
                *state = HandshakeState::Responded;
                true
            }
            None => false,
        }
    }

    /// Nodes whose bootstrap deadline expired. The caller treats them as
    /// failed; they are dropped from the handshake here.
    pub fn take_timed_out(&mut self, now: Instant) -> Vec<NodeId> {
        let expired: Vec<_> = self
            .nodes
            .iter()
            .filter_map(|(id, state)| match state {
                HandshakeState::Sent { deadline } if now >= *deadline => Some(id.clone()),
                _ => None,
            })
            .collect();
        for id in &expired {
            tracing::warn!(changefeed = %self.changefeed_id, node = %id, "bootstrap timed out");
            self.nodes.remove(id);
        }
        expired
    }

    /// Scheduling is blocked until every node in the handshake responded.
    /// Late responses after unblocking are still reconciled by the caller.
    pub fn is_bootstrapped(&self) -> bool {
        self.nodes
            .values()
            .all(|state| matches!(state, HandshakeState::Responded))
    }
}

/// Fold one inventory into the registry:
///
/// - unknown span of a live table: adopt as Working under the reporter;
/// - known span, matching owner: fold the reported watermark;
/// - known span, different owner, or a dropped table: tell the reporter to
///   remove its copy (a later scheduler run places it correctly);
/// - a span the registry binds to the reporter but the reporter no longer
///   hosts: demote to Absent for re-placement.
///
/// The returned messages are direct removals for dispatchers the registry
/// does not own; re-running with the same inventory produces no operators
/// and no registry change.
pub fn reconcile_response(
    registry: &mut SpanRegistry,
    live_tables: &HashMap<TableId, SchemaId>,
    response: &BootstrapResponse,
) -> Vec<(NodeId, Message)> {
    let node = &response.node_id;
    let mut removals = Vec::new();
    let mut reported: HashSet<_> = HashSet::with_capacity(response.spans.len());

    for span in &response.spans {
        reported.insert(span.id);
        let remove = |id| {
            (
                node.clone(),
                Message::ScheduleDispatcher(ScheduleDispatcherRequest {
                    changefeed_id: response.changefeed_id.clone(),
                    action: ScheduleAction::Remove,
                    id,
                    span: span.span.clone(),
                    start_ts: span.watermark.checkpoint_ts,
                    schema_id: span.schema_id,
                    group: span.group,
                    add_seq: 0,
                }),
            )
        };

        if !live_tables.contains_key(&span.span.table_id) {
            // Dropped table, whatever the reported watermark says.
            tracing::info!(node = %node, span = %span.span, "bootstrap reports span of a dropped table");
            removals.push(remove(span.id));
            continue;
        }

        match registry.get(span.id) {
            None => {
                match registry.get_by_span(&span.span) {
                    Some(existing) if existing.node_id.is_some() => {
                        // The registry already tracks this range under
                        // another live incarnation; the reporter's copy is
                        // stale.
                        tracing::warn!(node = %node, span = %span.span, "bootstrap reports a superseded dispatcher");
                        removals.push(remove(span.id));
                        continue;
                    }
                    Some(existing) => {
                        // An unplaced placeholder for the same range (the
                        // table was re-announced before bootstrap finished);
                        // the node's live dispatcher wins.
                        let placeholder = existing.id;
                        registry.delete(placeholder);
                    }
                    None => {}
                }
                registry.adopt_working(
                    span.id,
                    span.span.clone(),
                    span.schema_id,
                    span.group,
                    node.clone(),
                    span.watermark,
                );
            }
            Some(entry) => {
                if entry.node_id.as_ref() == Some(node) {
                    registry.update_watermark(span.id, span.watermark);
                } else {
                    tracing::warn!(
                        node = %node,
                        owner = ?entry.node_id,
                        span = %span.span,
                        "bootstrap owner disagreement"
                    );
                    removals.push(remove(span.id));
                }
            }
        }
    }

    // Working spans the registry binds to this node but the node does not
    // host any more.
    for id in registry.ids_by_node(node) {
        if reported.contains(&id) {
            continue;
        }
        if registry.get(id).map(|e| e.state) == Some(ReplicationState::Working) {
            tracing::warn!(node = %node, dispatcher = %id, "bound span missing from bootstrap inventory");
            registry.demote_to_absent(id);
        }
    }

    removals
}
