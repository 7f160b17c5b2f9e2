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

//! Logical schemas of the messages exchanged between a changefeed maintainer
//! and the dispatcher managers on worker nodes, plus the traits the
//! maintainer consumes for the transport and the upstream cluster.
//!
//! Wire encoding is the transport's concern; these types only fix the
//! semantics.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::id::{ChangefeedId, DispatcherId, Epoch, GroupId, NodeId, SchemaId, TableId};
use crate::span::TableSpan;
use crate::ts::{Ts, Watermark};

/// Lifecycle state of a dispatcher as its hosting node reports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatcherState {
    /// Created but not yet pulling events.
    Initializing,
    Working,
    /// Paused at a blocking event, waiting for the maintainer.
    Blocked,
    /// Being torn down; its last watermark is final.
    Stopping,
    Removed,
}

/// What kind of event forced a dispatcher to stop and wait for global
/// coordination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockingKind {
    Ddl,
    SyncPoint,
}

/// How far a blocking event reaches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfluenceScope {
    /// Only the reporting span.
    Normal,
    /// Every span under one schema.
    Schema(SchemaId),
    /// Every span of the changefeed.
    All,
}

/// Reported by a dispatcher that reached a blocking event. The dispatcher
/// pins its checkpoint at `barrier_ts - 1` until released.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingEvent {
    pub barrier_ts: Ts,
    pub kind: BlockingKind,
    pub scope: InfluenceScope,
    pub affected_tables: Vec<TableId>,
    /// Set by the table-trigger dispatcher once the event is flushed
    /// downstream.
    pub done: bool,
}

/// Per-span section of a [`Heartbeat`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpanHeartbeat {
    pub id: DispatcherId,
    pub state: DispatcherState,
    pub checkpoint_ts: Ts,
    pub resolved_ts: Ts,
    /// The registry sequence the hosting node had observed for this span
    /// when it was last created or modified there.
    pub add_seq: u64,
    pub blocking: Option<BlockingEvent>,
}

impl SpanHeartbeat {
    pub fn watermark(&self) -> Watermark {
        Watermark {
            checkpoint_ts: self.checkpoint_ts,
            resolved_ts: self.resolved_ts,
        }
    }
}

/// Periodic status report from one node's dispatcher manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Heartbeat {
    pub changefeed_id: ChangefeedId,
    pub node_id: NodeId,
    pub epoch: Epoch,
    /// Node-level aggregate over the listed spans, if the node computed one.
    pub watermark: Option<Watermark>,
    pub spans: Vec<SpanHeartbeat>,
}

/// Barrier instruction carried back to dispatchers on the heartbeat cycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStatus {
    pub scope: InfluenceScope,
    pub action: BarrierAction,
    pub barrier_ts: Ts,
    /// Dispatcher the broadcast does not apply to (the writer already acted).
    pub exclude: Option<DispatcherId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarrierAction {
    /// Pin the local checkpoint at `barrier_ts - 1` and ack.
    Prepare,
    /// Table-trigger dispatcher only: flush the event downstream, then report
    /// it done.
    Ack,
    /// Resume past the barrier.
    Release,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub changefeed_id: ChangefeedId,
    pub statuses: Vec<DispatcherStatus>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleAction {
    Create,
    Remove,
}

/// Instruction to create or remove one dispatcher on the receiving node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleDispatcherRequest {
    pub changefeed_id: ChangefeedId,
    pub action: ScheduleAction,
    pub id: DispatcherId,
    pub span: TableSpan,
    pub start_ts: Ts,
    pub schema_id: SchemaId,
    pub group: GroupId,
    /// Registry sequence of the span entry, echoed back in heartbeats.
    pub add_seq: u64,
}

/// Instruction to fuse co-located source dispatchers into one covering the
/// merged span.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MergeDispatcherRequest {
    pub changefeed_id: ChangefeedId,
    pub source_ids: Vec<DispatcherId>,
    pub merged_id: DispatcherId,
    pub merged_span: TableSpan,
    pub add_seq: u64,
}

/// Handshake sent to every node before the maintainer schedules against it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapRequest {
    pub changefeed_id: ChangefeedId,
    /// The maintainer's own epoch, so nodes can discard requests from a
    /// superseded maintainer.
    pub epoch: Epoch,
}

/// One hosted dispatcher in a [`BootstrapResponse`] inventory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapSpan {
    pub id: DispatcherId,
    pub span: TableSpan,
    pub schema_id: SchemaId,
    pub group: GroupId,
    pub state: DispatcherState,
    pub watermark: Watermark,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapResponse {
    pub changefeed_id: ChangefeedId,
    pub node_id: NodeId,
    pub epoch: Epoch,
    pub spans: Vec<BootstrapSpan>,
}

/// Envelope over every message of the maintainer protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    BootstrapRequest(BootstrapRequest),
    BootstrapResponse(BootstrapResponse),
    Heartbeat(Heartbeat),
    HeartbeatResponse(HeartbeatResponse),
    ScheduleDispatcher(ScheduleDispatcherRequest),
    MergeDispatcher(MergeDispatcherRequest),
}

impl Message {
    pub fn changefeed_id(&self) -> &ChangefeedId {
        match self {
            Message::BootstrapRequest(m) => &m.changefeed_id,
            Message::BootstrapResponse(m) => &m.changefeed_id,
            Message::Heartbeat(m) => &m.changefeed_id,
            Message::HeartbeatResponse(m) => &m.changefeed_id,
            Message::ScheduleDispatcher(m) => &m.changefeed_id,
            Message::MergeDispatcher(m) => &m.changefeed_id,
        }
    }
}

/// Non-blocking message transport to worker nodes. `send` returns once the
/// message is enqueued; delivery is best-effort and the protocol above is
/// retransmission-tolerant.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, target: &NodeId, message: Message) -> anyhow::Result<()>;
}

/// Client to the source cluster, covering the service GC safepoint registry
/// and timestamp oracle queries.
#[async_trait::async_trait]
pub trait UpstreamClient: Send + Sync + 'static {
    /// Register `ts` as this service's GC safepoint with the given TTL.
    /// Returns the minimum service safepoint across the cluster, which may be
    /// below `ts` if another service lags behind.
    async fn update_service_gc_safepoint(
        &self,
        service_id: &str,
        ttl: Duration,
        ts: Ts,
    ) -> anyhow::Result<Ts>;

    async fn remove_service_gc_safepoint(&self, service_id: &str) -> anyhow::Result<()>;

    /// Current timestamp from the source's timestamp oracle.
    async fn current_ts(&self) -> anyhow::Result<Ts>;
}
