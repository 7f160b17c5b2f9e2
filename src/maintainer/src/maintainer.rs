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

//! The changefeed maintainer: a single-writer event loop owning the span
//! registry, the operator set and the barriers of one changefeed. Incoming
//! messages, membership events and timer ticks are serialized through one
//! mpsc channel; different changefeeds run independent loops.
//!
//! Long-running work (the GC safepoint push) is offloaded to a spawned task
//! and re-enters the loop as a completion event. External readers get
//! copy-on-read snapshots; they never touch the loop's state directly.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use changeflow_common::changefeed::ChangefeedInfo;
use changeflow_common::config::ChangeflowConfig;
use changeflow_common::protocol::{
    BootstrapResponse, DispatcherState, Heartbeat, HeartbeatResponse, Message, ScheduleAction,
    ScheduleDispatcherRequest, Transport, UpstreamClient,
};
use changeflow_common::{
    ChangefeedId, DispatcherId, Epoch, GroupId, NodeChange, NodeId, SchemaId, TableId, TableSpan,
    Ts, Watermark,
};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::barrier::BarrierController;
use crate::bootstrap::{reconcile_response, Bootstrapper};
use crate::error::{MaintainerError, MaintainerResult};
use crate::gc::{push_safepoint, GcSafepointKeeper};
use crate::metrics::MaintainerMetricsRef;
use crate::node_view::NodeView;
use crate::operator::{OperatorController, ReportOutcome, SpanOperator};
use crate::registry::{ReplicationState, SpanRegistry, SpanReplication};
use crate::scheduler::{default_pipeline, RegionCountOracle, ScheduleContext, Scheduler};
use crate::watermark::WatermarkTracker;

/// The table id reserved for the table-trigger span, whose dispatcher writes
/// DDL events downstream.
pub const TABLE_TRIGGER_TABLE_ID: TableId = TableId(0);

/// Everything the maintainer loop reacts to.
pub enum MaintainerEvent {
    /// A message from a worker node.
    Message(Message),
    /// Membership change from the external watcher.
    NodeChange(NodeChange),
    /// A table appeared upstream and joins the replicated set. `start_ts`
    /// defaults to the current published checkpoint.
    AddTable {
        table_id: TableId,
        schema_id: SchemaId,
        start_ts: Option<Ts>,
    },
    /// A table was dropped upstream; its spans are torn down.
    DropTable { table_id: TableId },
    /// Completion of an offloaded GC safepoint push.
    GcPushResult {
        checkpoint_ts: Ts,
        result: anyhow::Result<Ts>,
    },
    Shutdown,
}

/// Lightweight snapshot published by the loop for external readers.
#[derive(Clone, Debug, Default)]
pub struct MaintainerStatus {
    pub watermark: Watermark,
    pub bootstrapped: bool,
    pub span_count: usize,
    pub working_count: usize,
    pub absent_count: usize,
    pub operator_count: usize,
    pub spans: Vec<SpanReplication>,
}

pub struct Maintainer {
    changefeed_id: ChangefeedId,
    config: ChangeflowConfig,

    registry: SpanRegistry,
    node_view: NodeView,
    operators: OperatorController,
    bootstrapper: Bootstrapper,
    schedulers: Vec<Box<dyn Scheduler>>,
    barriers: BarrierController,
    gc: GcSafepointKeeper,
    watermark: WatermarkTracker,

    /// Tables currently in the replicated set, with their schemas.
    live_tables: HashMap<TableId, SchemaId>,
    table_trigger: Option<DispatcherId>,

    transport: Arc<dyn Transport>,
    upstream: Arc<dyn UpstreamClient>,

    event_tx: mpsc::UnboundedSender<MaintainerEvent>,
    watermark_tx: watch::Sender<Watermark>,
    status: Arc<RwLock<MaintainerStatus>>,

    metrics: MaintainerMetricsRef,
}

pub struct MaintainerHandle {
    changefeed_id: ChangefeedId,
    event_tx: mpsc::UnboundedSender<MaintainerEvent>,
    watermark_rx: watch::Receiver<Watermark>,
    status: Arc<RwLock<MaintainerStatus>>,
    join_handle: JoinHandle<MaintainerResult<()>>,
}

impl MaintainerHandle {
    pub fn changefeed_id(&self) -> &ChangefeedId {
        &self.changefeed_id
    }

    /// Enqueue an event for the loop. Returns false once the loop exited.
    pub fn send(&self, event: MaintainerEvent) -> bool {
        self.event_tx.send(event).is_ok()
    }

    pub fn watermark(&self) -> Watermark {
        *self.watermark_rx.borrow()
    }

    pub fn subscribe_watermark(&self) -> watch::Receiver<Watermark> {
        self.watermark_rx.clone()
    }

    /// Copy-on-read snapshot of the maintainer state.
    pub fn status(&self) -> MaintainerStatus {
        self.status.read().clone()
    }

    /// Ask the loop to stop and wait for it. The final result carries the
    /// changefeed-fatal error, if any.
    pub async fn shutdown(self) -> MaintainerResult<()> {
        let _ = self.event_tx.send(MaintainerEvent::Shutdown);
        self.join().await
    }

    pub async fn join(self) -> MaintainerResult<()> {
        match self.join_handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("maintainer task panicked: {e}").into()),
        }
    }
}

impl Maintainer {
    /// Build a maintainer without spawning its loop. Tests drive the handler
    /// methods directly; production code uses [`Maintainer::spawn`].
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        changefeed_id: ChangefeedId,
        info: &ChangefeedInfo,
        config: ChangeflowConfig,
        epoch: Epoch,
        transport: Arc<dyn Transport>,
        upstream: Arc<dyn UpstreamClient>,
        oracle: Arc<dyn RegionCountOracle>,
        metrics: MaintainerMetricsRef,
    ) -> (Self, mpsc::UnboundedReceiver<MaintainerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let start = Watermark::new(info.effective_checkpoint());
        let (watermark_tx, _) = watch::channel(start);
        let maintainer = Self {
            registry: SpanRegistry::new(changefeed_id.clone()),
            node_view: NodeView::new(),
            operators: OperatorController::new(
                config.schedule.operator_timeout(),
                config.schedule.operator_max_attempts,
                config.schedule.max_operators_per_node,
                metrics.clone(),
            ),
            bootstrapper: Bootstrapper::new(
                changefeed_id.clone(),
                epoch,
                config.heartbeat.bootstrap_timeout(),
            ),
            schedulers: default_pipeline(&config.schedule, oracle),
            barriers: BarrierController::new(changefeed_id.clone(), metrics.clone()),
            gc: GcSafepointKeeper::new(
                changefeed_id.clone(),
                config.gc.ttl(),
                config.gc.update_interval(),
                Instant::now(),
                metrics.clone(),
            ),
            watermark: WatermarkTracker::new(start),
            live_tables: HashMap::from([(TABLE_TRIGGER_TABLE_ID, SchemaId(0))]),
            table_trigger: None,
            transport,
            upstream,
            event_tx,
            watermark_tx,
            status: Arc::new(RwLock::new(MaintainerStatus {
                watermark: start,
                ..Default::default()
            })),
            changefeed_id,
            config,
            metrics,
        };
        (maintainer, event_rx)
    }

    /// Spawn the maintainer loop for one changefeed.
    #[expect(clippy::too_many_arguments)]
    pub fn spawn(
        changefeed_id: ChangefeedId,
        info: ChangefeedInfo,
        config: ChangeflowConfig,
        epoch: Epoch,
        transport: Arc<dyn Transport>,
        upstream: Arc<dyn UpstreamClient>,
        oracle: Arc<dyn RegionCountOracle>,
        metrics: MaintainerMetricsRef,
    ) -> MaintainerHandle {
        let (mut maintainer, event_rx) = Self::new(
            changefeed_id.clone(),
            &info,
            config,
            epoch,
            transport,
            upstream,
            oracle,
            metrics,
        );
        let event_tx = maintainer.event_tx.clone();
        let watermark_rx = maintainer.watermark_tx.subscribe();
        let status = maintainer.status.clone();
        let join_handle = tokio::spawn(async move {
            let result = maintainer.run(info, event_rx).await;
            if let Err(e) = &result {
                tracing::error!(
                    changefeed = %maintainer.changefeed_id,
                    error = ?e,
                    "maintainer exited with error"
                );
            }
            maintainer.teardown().await;
            result
        });
        MaintainerHandle {
            changefeed_id,
            event_tx,
            watermark_rx,
            status,
            join_handle,
        }
    }

    async fn run(
        &mut self,
        info: ChangefeedInfo,
        mut event_rx: mpsc::UnboundedReceiver<MaintainerEvent>,
    ) -> MaintainerResult<()> {
        self.validate_resume_point(&info).await?;

        let mut tick = tokio::time::interval(self.config.heartbeat.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                event = event_rx.recv() => {
                    match event {
                        // All handles dropped.
                        None => return Ok(()),
                        Some(MaintainerEvent::Shutdown) => return Ok(()),
                        Some(event) => self.handle_event(event).await?,
                    }
                }
                _ = tick.tick() => {
                    self.handle_tick(Instant::now()).await?;
                }
            }
        }
    }

    /// An overwritten resume point must not be ahead of the source.
    async fn validate_resume_point(&self, info: &ChangefeedInfo) -> MaintainerResult<()> {
        let Some(overwrite) = info.overwrite_checkpoint_ts else {
            return Ok(());
        };
        let current = self
            .upstream
            .current_ts()
            .await
            .map_err(MaintainerError::from)?;
        if overwrite > current {
            return Err(MaintainerError::invalid_checkpoint(overwrite, current));
        }
        Ok(())
    }

    async fn teardown(&mut self) {
        self.operators.drain_all(&mut self.registry);
        if let Err(e) = self
            .upstream
            .remove_service_gc_safepoint(self.gc.service_id())
            .await
        {
            tracing::warn!(
                changefeed = %self.changefeed_id,
                error = %e,
                "failed to remove gc safepoint on shutdown"
            );
        }
    }

    pub(crate) async fn handle_event(&mut self, event: MaintainerEvent) -> MaintainerResult<()> {
        match event {
            MaintainerEvent::Message(Message::Heartbeat(hb)) => self.handle_heartbeat(hb).await,
            MaintainerEvent::Message(Message::BootstrapResponse(resp)) => {
                self.handle_bootstrap_response(resp).await
            }
            MaintainerEvent::Message(other) => {
                tracing::warn!(
                    changefeed = %self.changefeed_id,
                    message = ?other,
                    "unexpected message on the maintainer path"
                );
                self.metrics.stale_message_count.inc();
                Ok(())
            }
            MaintainerEvent::NodeChange(change) => self.handle_node_change(change).await,
            MaintainerEvent::AddTable {
                table_id,
                schema_id,
                start_ts,
            } => {
                self.handle_add_table(table_id, schema_id, start_ts);
                Ok(())
            }
            MaintainerEvent::DropTable { table_id } => {
                self.handle_drop_table(table_id);
                Ok(())
            }
            MaintainerEvent::GcPushResult {
                checkpoint_ts,
                result,
            } => self
                .gc
                .on_push_result(Instant::now(), checkpoint_ts, result),
            MaintainerEvent::Shutdown => Ok(()),
        }
    }

    async fn handle_node_change(&mut self, change: NodeChange) -> MaintainerResult<()> {
        let applied = self.node_view.apply(change);
        for node in &applied.left {
            self.on_node_lost(node);
        }
        let requests = self
            .bootstrapper
            .handle_new_nodes(applied.joined, Instant::now());
        self.send_all(requests).await;
        Ok(())
    }

    /// Cancel everything targeting the node and demote its spans so the
    /// basic scheduler replaces them on the next tick.
    fn on_node_lost(&mut self, node: &NodeId) {
        tracing::info!(changefeed = %self.changefeed_id, node = %node, "node lost, demoting its spans");
        self.bootstrapper.handle_node_removed(node);
        self.operators.on_node_removed(&mut self.registry, node);
        for id in self.registry.ids_by_node(node) {
            match self.registry.get(id).map(|e| e.state) {
                Some(ReplicationState::Working) | Some(ReplicationState::Scheduling) => {
                    self.registry.demote_to_absent(id);
                    self.barriers.on_span_demoted(id);
                }
                Some(ReplicationState::Removing) => {
                    // Its dispatcher died with the node; nothing to wait for.
                    self.registry.delete(id);
                    self.barriers.on_span_removed(id);
                }
                _ => {}
            }
        }
    }

    fn handle_add_table(&mut self, table_id: TableId, schema_id: SchemaId, start_ts: Option<Ts>) {
        if self.live_tables.insert(table_id, schema_id).is_some() {
            return;
        }
        let start = start_ts.map_or(self.watermark.published(), Watermark::new);
        self.registry.add_absent(
            TableSpan::table_record_range(table_id),
            schema_id,
            GroupId::for_table(table_id),
            start,
        );
        tracing::info!(
            changefeed = %self.changefeed_id,
            table = %table_id,
            start_ts = %start.checkpoint_ts,
            "table joined the replicated set"
        );
    }

    fn handle_drop_table(&mut self, table_id: TableId) {
        if self.live_tables.remove(&table_id).is_none() {
            return;
        }
        tracing::info!(changefeed = %self.changefeed_id, table = %table_id, "table dropped");
        for id in self.registry.ids_by_table(table_id) {
            // Removing cancels any in-flight operator on the span.
            self.operators.cancel(id);
            self.barriers.on_span_removed(id);
            match self.registry.get(id).map(|e| e.node_id.clone()) {
                Some(Some(_)) => self.registry.mark_removing(id),
                // Never placed; nothing to tear down remotely.
                Some(None) => {
                    self.registry.delete(id);
                }
                None => {}
            }
        }
    }

    async fn handle_heartbeat(&mut self, hb: Heartbeat) -> MaintainerResult<()> {
        match self.node_view.epoch_of(&hb.node_id) {
            Some(epoch) if epoch == hb.epoch => {}
            _ => {
                // Unknown node or another incarnation of it.
                tracing::warn!(
                    changefeed = %self.changefeed_id,
                    node = %hb.node_id,
                    epoch = %hb.epoch,
                    "dropping stale heartbeat"
                );
                self.metrics.stale_message_count.inc();
                return Ok(());
            }
        }

        let mut removals = Vec::new();
        for report in &hb.spans {
            if let Some(blocking) = &report.blocking {
                self.barriers.on_blocking_event(
                    &self.registry,
                    report.id,
                    blocking,
                    self.table_trigger,
                );
            }
            self.barriers
                .on_span_checkpoint(report.id, report.checkpoint_ts);

            if let ReportOutcome::Consumed =
                self.operators
                    .on_span_report(&mut self.registry, &hb.node_id, report)
            {
                continue;
            }
            let Some(entry) = self.registry.get(report.id) else {
                // A dispatcher nothing tracks; tell the node to drop it.
                // Removal is keyed by id, the span is unknown here.
                self.metrics.stale_message_count.inc();
                if report.state != DispatcherState::Removed {
                    removals.push((
                        hb.node_id.clone(),
                        Message::ScheduleDispatcher(ScheduleDispatcherRequest {
                            changefeed_id: self.changefeed_id.clone(),
                            action: ScheduleAction::Remove,
                            id: report.id,
                            span: TableSpan::new(TableId(0), Bytes::new(), Bytes::new()),
                            start_ts: report.checkpoint_ts,
                            schema_id: SchemaId(0),
                            group: GroupId(0),
                            add_seq: report.add_seq,
                        }),
                    ));
                }
                continue;
            };
            if entry.node_id.as_ref() != Some(&hb.node_id) {
                // Stale owner still reporting a span that moved away.
                self.metrics.stale_message_count.inc();
                continue;
            }
            if report.add_seq < entry.add_seq {
                // A previous incarnation of the span on the same node.
                self.metrics.stale_message_count.inc();
                continue;
            }
            if report.state == DispatcherState::Removed {
                // The node dropped the dispatcher on its own; re-place it.
                tracing::warn!(
                    changefeed = %self.changefeed_id,
                    dispatcher = %report.id,
                    node = %hb.node_id,
                    "span reported removed without an operator"
                );
                self.registry.demote_to_absent(report.id);
                self.barriers.on_span_demoted(report.id);
                continue;
            }
            self.registry.update_watermark(report.id, report.watermark());
        }
        self.send_all(removals).await;
        Ok(())
    }

    async fn handle_bootstrap_response(&mut self, resp: BootstrapResponse) -> MaintainerResult<()> {
        if !self.node_view.contains(&resp.node_id)
            || self.node_view.epoch_of(&resp.node_id) != Some(resp.epoch)
        {
            self.metrics.stale_message_count.inc();
            return Ok(());
        }
        self.bootstrapper.handle_response(&resp.node_id);
        let removals = reconcile_response(&mut self.registry, &self.live_tables, &resp);
        self.send_all(removals).await;

        if self.bootstrapper.is_bootstrapped() {
            self.on_bootstrapped();
        }
        Ok(())
    }

    /// Every alive node answered: the registry is authoritative again.
    fn on_bootstrapped(&mut self) {
        let trigger = self
            .registry
            .ids_by_table(TABLE_TRIGGER_TABLE_ID)
            .into_iter()
            .next()
            .unwrap_or_else(|| {
                self.registry.add_absent(
                    TableSpan::table_record_range(TABLE_TRIGGER_TABLE_ID),
                    SchemaId(0),
                    GroupId::for_table(TABLE_TRIGGER_TABLE_ID),
                    self.watermark.published(),
                )
            });
        if self.table_trigger != Some(trigger) {
            self.table_trigger = Some(trigger);
            self.barriers.set_table_trigger(trigger);
        }
    }

    pub(crate) async fn handle_tick(&mut self, now: Instant) -> MaintainerResult<()> {
        // A node that never answered its bootstrap request is failed.
        for node in self.bootstrapper.take_timed_out(now) {
            self.node_view.apply(NodeChange::left([node.clone()]));
            self.on_node_lost(&node);
        }
        if self.bootstrapper.is_bootstrapped() && self.table_trigger.is_none() {
            self.on_bootstrapped();
        }

        // Re-issue teardown for Removing spans whose operator failed.
        for id in self.registry.ids_by_state(ReplicationState::Removing) {
            if self.operators.has_operator(id) {
                continue;
            }
            match self.registry.get(id).and_then(|e| e.node_id.clone()) {
                Some(node) => {
                    self.operators
                        .add_operator(&mut self.registry, SpanOperator::remove(id, node));
                }
                None => {
                    self.registry.delete(id);
                    self.barriers.on_span_removed(id);
                }
            }
        }

        if self.scheduling_enabled() {
            let mut ctx = ScheduleContext {
                registry: &mut self.registry,
                controller: &mut self.operators,
                node_view: &self.node_view,
                now,
            };
            for scheduler in &mut self.schedulers {
                scheduler.execute(&mut ctx);
            }
        }

        let messages = self.operators.poll(&mut self.registry, now);
        self.send_all(messages).await;

        // Barrier instructions ride the heartbeat cycle to every node.
        let statuses = self.barriers.collect_statuses(&self.registry);
        if !statuses.is_empty() {
            let response = HeartbeatResponse {
                changefeed_id: self.changefeed_id.clone(),
                statuses,
            };
            let broadcast: Vec<_> = self
                .node_view
                .alive_nodes()
                .cloned()
                .map(|node| (node, Message::HeartbeatResponse(response.clone())))
                .collect();
            self.send_all(broadcast).await;
        }

        self.publish_watermark();
        self.maybe_push_safepoint(now);
        Ok(())
    }

    fn scheduling_enabled(&self) -> bool {
        self.bootstrapper.is_bootstrapped() && self.gc.is_validated()
    }

    fn publish_watermark(&mut self) {
        let published = self
            .watermark
            .advance(&self.registry, self.barriers.checkpoint_ceiling());
        let _ = self.watermark_tx.send(published);
        self.metrics
            .checkpoint_ts_gauge
            .set(published.checkpoint_ts.physical() as i64);
        self.metrics
            .resolved_ts_gauge
            .set(published.resolved_ts.physical() as i64);

        let mut status = self.status.write();
        status.watermark = published;
        status.bootstrapped = self.bootstrapper.is_bootstrapped();
        status.span_count = self.registry.len();
        status.working_count = self.registry.size_by_state(ReplicationState::Working);
        status.absent_count = self.registry.absent_size();
        status.operator_count = self.operators.operator_size();
        status.spans = self.registry.snapshot();
    }

    fn maybe_push_safepoint(&mut self, now: Instant) {
        let checkpoint_ts = self.watermark.published().checkpoint_ts;
        if let Err(e) = self.gc.check_stale_checkpoint(checkpoint_ts) {
            // Surfaced on the next push; make the diagnostic immediate.
            tracing::error!(changefeed = %self.changefeed_id, error = %e, "checkpoint behind service gc safepoint");
        }
        if !self.gc.should_push(now, checkpoint_ts, false) {
            return;
        }
        self.gc.note_attempt(now, checkpoint_ts);
        let client = self.upstream.clone();
        let service_id = self.gc.service_id().to_owned();
        let ttl = self.gc.ttl();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = push_safepoint(client, service_id, ttl, checkpoint_ts).await;
            let _ = event_tx.send(MaintainerEvent::GcPushResult {
                checkpoint_ts,
                result,
            });
        });
    }

    async fn send_all(&self, messages: Vec<(NodeId, Message)>) {
        for (node, message) in messages {
            if let Err(e) = self.transport.send(&node, message).await {
                // Transient transport failure; the protocol retransmits.
                tracing::warn!(
                    changefeed = %self.changefeed_id,
                    node = %node,
                    error = %e,
                    "failed to send message"
                );
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &SpanRegistry {
        &self.registry
    }

    #[cfg(test)]
    pub(crate) fn published_watermark(&self) -> Watermark {
        self.watermark.published()
    }

    #[cfg(test)]
    pub(crate) fn gc_keeper_mut(&mut self) -> &mut GcSafepointKeeper {
        &mut self.gc
    }
}
