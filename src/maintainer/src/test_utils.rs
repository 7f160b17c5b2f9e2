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

//! Helpers shared by unit tests: fabricated membership events, a scripted
//! dispatcher side that acknowledges every operator message, and mock
//! implementations of the external collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use changeflow_common::protocol::{
    BootstrapResponse, BootstrapSpan, DispatcherState, Heartbeat, Message, ScheduleAction,
    SpanHeartbeat, Transport, UpstreamClient,
};
use changeflow_common::{
    ChangefeedId, DispatcherId, Epoch, NodeChange, NodeId, NodeInfo, TableSpan, Ts, Watermark,
};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::operator::OperatorController;
use crate::registry::SpanRegistry;

pub fn make_nodes(ids: &[&str]) -> NodeChange {
    NodeChange::joined(
        ids.iter()
            .map(|id| NodeInfo::new(*id, format!("{id}:8300"), 1)),
    )
}

/// Play the dispatcher side of every in-flight operator: acknowledge creates
/// as Working, removals as Removed and merges as Working, until the
/// controller drains.
pub fn complete_all_operators(registry: &mut SpanRegistry, controller: &mut OperatorController) {
    let mut rounds = 0;
    while controller.operator_size() > 0 {
        rounds += 1;
        assert!(rounds < 100, "operators did not converge");
        let messages = controller.poll(registry, Instant::now());
        for (node, message) in messages {
            match message {
                Message::ScheduleDispatcher(req) => {
                    let state = match req.action {
                        ScheduleAction::Create => DispatcherState::Working,
                        ScheduleAction::Remove => DispatcherState::Removed,
                    };
                    controller.on_span_report(
                        registry,
                        &node,
                        &SpanHeartbeat {
                            id: req.id,
                            state,
                            checkpoint_ts: req.start_ts,
                            resolved_ts: req.start_ts,
                            add_seq: req.add_seq,
                            blocking: None,
                        },
                    );
                }
                Message::MergeDispatcher(req) => {
                    controller.on_span_report(
                        registry,
                        &node,
                        &SpanHeartbeat {
                            id: req.merged_id,
                            state: DispatcherState::Working,
                            checkpoint_ts: changeflow_common::Ts::ZERO,
                            resolved_ts: changeflow_common::Ts::ZERO,
                            add_seq: req.add_seq,
                            blocking: None,
                        },
                    );
                }
                other => panic!("unexpected operator message {other:?}"),
            }
        }
    }
}

/// Transport that captures every sent message for inspection.
#[derive(Default)]
pub struct MockTransport {
    outbox: Mutex<Vec<(NodeId, Message)>>,
}

impl MockTransport {
    pub fn take(&self) -> Vec<(NodeId, Message)> {
        std::mem::take(&mut self.outbox.lock())
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send(&self, target: &NodeId, message: Message) -> anyhow::Result<()> {
        self.outbox.lock().push((target.clone(), message));
        Ok(())
    }
}

/// Upstream whose service GC safepoint registry holds one configurable
/// cluster-min value.
pub struct MockUpstream {
    pub min_service_ts: Mutex<Ts>,
    pub current_ts: Mutex<Ts>,
    pub removed_services: Mutex<Vec<String>>,
}

impl MockUpstream {
    pub fn new(min_service_ts: u64) -> Arc<Self> {
        Arc::new(Self {
            min_service_ts: Mutex::new(Ts(min_service_ts)),
            current_ts: Mutex::new(Ts(u64::MAX >> 1)),
            removed_services: Mutex::new(vec![]),
        })
    }
}

#[async_trait::async_trait]
impl UpstreamClient for MockUpstream {
    async fn update_service_gc_safepoint(
        &self,
        _service_id: &str,
        _ttl: Duration,
        ts: Ts,
    ) -> anyhow::Result<Ts> {
        let min = *self.min_service_ts.lock();
        Ok(if ts < min { min } else { ts })
    }

    async fn remove_service_gc_safepoint(&self, service_id: &str) -> anyhow::Result<()> {
        self.removed_services.lock().push(service_id.to_owned());
        Ok(())
    }

    async fn current_ts(&self) -> anyhow::Result<Ts> {
        Ok(*self.current_ts.lock())
    }
}

struct SimDispatcher {
    span: TableSpan,
    schema_id: changeflow_common::SchemaId,
    group: changeflow_common::GroupId,
    add_seq: u64,
    checkpoint_ts: Ts,
}

/// A scripted cluster of dispatcher managers: hosts dispatchers as
/// instructed, answers bootstrap requests from its inventory and emits
/// heartbeats on demand.
pub struct DispatcherSim {
    changefeed_id: ChangefeedId,
    epoch: Epoch,
    hosted: HashMap<NodeId, HashMap<DispatcherId, SimDispatcher>>,
    /// Removal confirmations to carry in each node's next heartbeat.
    removed: HashMap<NodeId, Vec<(DispatcherId, u64, Ts)>>,
}

impl DispatcherSim {
    pub fn new(changefeed_id: ChangefeedId, nodes: &[&str]) -> Self {
        Self {
            changefeed_id,
            epoch: Epoch(1),
            hosted: nodes
                .iter()
                .map(|n| (NodeId::from(*n), HashMap::new()))
                .collect(),
            removed: HashMap::new(),
        }
    }

    pub fn kill_node(&mut self, node: &NodeId) {
        self.hosted.remove(node);
        self.removed.remove(node);
    }

    pub fn advance_all(&mut self, ts: Ts) {
        for dispatchers in self.hosted.values_mut() {
            for d in dispatchers.values_mut() {
                d.checkpoint_ts = d.checkpoint_ts.max(ts);
            }
        }
    }

    pub fn hosted_count(&self, node: &NodeId) -> usize {
        self.hosted.get(node).map_or(0, |d| d.len())
    }

    /// Process maintainer messages, producing the immediate replies
    /// (bootstrap responses). Operator acks ride the next heartbeats.
    pub fn apply(&mut self, messages: Vec<(NodeId, Message)>) -> Vec<Message> {
        let mut replies = Vec::new();
        for (node, message) in messages {
            let Some(dispatchers) = self.hosted.get_mut(&node) else {
                continue;
            };
            match message {
                Message::BootstrapRequest(_) => {
                    replies.push(Message::BootstrapResponse(BootstrapResponse {
                        changefeed_id: self.changefeed_id.clone(),
                        node_id: node.clone(),
                        epoch: self.epoch,
                        spans: dispatchers
                            .iter()
                            .map(|(id, d)| BootstrapSpan {
                                id: *id,
                                span: d.span.clone(),
                                schema_id: d.schema_id,
                                group: d.group,
                                state: DispatcherState::Working,
                                watermark: Watermark::new(d.checkpoint_ts),
                            })
                            .collect(),
                    }));
                }
                Message::ScheduleDispatcher(req) => match req.action {
                    ScheduleAction::Create => {
                        dispatchers.insert(
                            req.id,
                            SimDispatcher {
                                span: req.span,
                                schema_id: req.schema_id,
                                group: req.group,
                                add_seq: req.add_seq,
                                checkpoint_ts: req.start_ts,
                            },
                        );
                    }
                    ScheduleAction::Remove => {
                        let (add_seq, ts) = dispatchers
                            .remove(&req.id)
                            .map(|d| (d.add_seq, d.checkpoint_ts))
                            .unwrap_or((req.add_seq, req.start_ts));
                        self.removed
                            .entry(node.clone())
                            .or_default()
                            .push((req.id, add_seq, ts));
                    }
                },
                Message::HeartbeatResponse(_) => {}
                other => panic!("dispatcher sim got unexpected message {other:?}"),
            }
        }
        replies
    }

    /// One heartbeat per alive node, covering every hosted dispatcher plus
    /// pending removal confirmations.
    pub fn heartbeats(&mut self) -> Vec<Message> {
        let mut result = Vec::new();
        for (node, dispatchers) in &self.hosted {
            let mut spans: Vec<SpanHeartbeat> = dispatchers
                .iter()
                .map(|(id, d)| SpanHeartbeat {
                    id: *id,
                    state: DispatcherState::Working,
                    checkpoint_ts: d.checkpoint_ts,
                    resolved_ts: d.checkpoint_ts,
                    add_seq: d.add_seq,
                    blocking: None,
                })
                .collect();
            for (id, add_seq, ts) in self.removed.remove(node).unwrap_or_default() {
                spans.push(SpanHeartbeat {
                    id,
                    state: DispatcherState::Removed,
                    checkpoint_ts: ts,
                    resolved_ts: ts,
                    add_seq,
                    blocking: None,
                });
            }
            result.push(Message::Heartbeat(Heartbeat {
                changefeed_id: self.changefeed_id.clone(),
                node_id: node.clone(),
                epoch: self.epoch,
                watermark: None,
                spans,
            }));
        }
        result
    }
}
