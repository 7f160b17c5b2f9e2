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

use itertools::Itertools;

use super::{ScheduleContext, Scheduler};
use crate::operator::SpanOperator;

/// Places absent spans onto alive nodes, least-loaded first with node-id
/// tiebreak. Runs even while other operators are in flight; only the
/// reshaping passes require a stable state.
pub struct BasicScheduler {
    batch_size: usize,
}

impl BasicScheduler {
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size }
    }
}

impl Scheduler for BasicScheduler {
    fn name(&self) -> &'static str {
        "basic-scheduler"
    }

    fn execute(&mut self, ctx: &mut ScheduleContext<'_>) -> usize {
        if ctx.node_view.is_empty() {
            return 0;
        }
        let absent = ctx
            .registry
            .ids_by_state(crate::registry::ReplicationState::Absent);
        if absent.is_empty() {
            return 0;
        }

        let mut sizes = ctx
            .registry
            .task_size_per_node(ctx.node_view.alive_nodes())
            .into_iter()
            .collect_vec();

        let mut scheduled = 0;
        for id in absent.into_iter().take(self.batch_size) {
            let (node, size) = sizes
                .iter_mut()
                .min_by(|(a_node, a_size), (b_node, b_size)| {
                    a_size.cmp(b_size).then_with(|| a_node.cmp(b_node))
                })
                .expect("node view not empty");
            if ctx
                .controller
                .add_operator(ctx.registry, SpanOperator::add(id, node.clone()))
            {
                *size += 1;
                scheduled += 1;
            }
        }
        if scheduled > 0 {
            tracing::info!(
                changefeed = %ctx.registry.changefeed_id(),
                scheduled,
                "placed absent spans"
            );
        }
        scheduled
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use changeflow_common::{ChangefeedId, GroupId, SchemaId, TableId, TableSpan, Ts, Watermark};
    use itertools::Itertools;
    use tokio::time::Instant;

    use super::*;
    use crate::metrics::MaintainerMetrics;
    use crate::node_view::NodeView;
    use crate::operator::OperatorController;
    use crate::registry::{ReplicationState, SpanRegistry};
    use crate::test_utils::{complete_all_operators, make_nodes};

    #[test]
    fn test_spreads_spans_evenly() {
        let mut registry = SpanRegistry::new(ChangefeedId::in_default_namespace("basic-test"));
        let mut controller = OperatorController::new(
            Duration::from_secs(10),
            3,
            64,
            MaintainerMetrics::for_test(),
        );
        let mut node_view = NodeView::new();
        node_view.apply(make_nodes(&["n1", "n2", "n3"]));

        for table in 0..100 {
            registry.add_absent(
                TableSpan::table_record_range(TableId(table)),
                SchemaId(1),
                GroupId(table),
                Watermark::new(Ts(100)),
            );
        }

        let mut scheduler = BasicScheduler::new(128);
        let mut ctx = ScheduleContext {
            registry: &mut registry,
            controller: &mut controller,
            node_view: &node_view,
            now: Instant::now(),
        };
        // One tick issues an operator for all 100 spans.
        assert_eq!(scheduler.execute(&mut ctx), 100);
        assert_eq!(controller.operator_size(), 100);
        assert_eq!(registry.absent_size(), 0);

        // Per-node load never exceeds the even share while acks are pending.
        let sizes = registry.task_size_per_node(node_view.alive_nodes());
        assert!(sizes.values().all(|&s| s <= 34));

        complete_all_operators(&mut registry, &mut controller);
        assert_eq!(
            registry.ids_by_state(ReplicationState::Working).len(),
            100
        );
        let sizes = registry.task_size_per_node(node_view.alive_nodes());
        let (min, max) = sizes.values().copied().minmax().into_option().unwrap();
        assert!(max - min <= 1, "sizes {sizes:?}");
        assert_eq!(sizes.values().sum::<usize>(), 100);
    }

    #[test]
    fn test_no_nodes_means_no_placement() {
        let mut registry = SpanRegistry::new(ChangefeedId::in_default_namespace("basic-test"));
        let mut controller = OperatorController::new(
            Duration::from_secs(10),
            3,
            64,
            MaintainerMetrics::for_test(),
        );
        let node_view = NodeView::new();
        registry.add_absent(
            TableSpan::table_record_range(TableId(1)),
            SchemaId(1),
            GroupId(1),
            Watermark::new(Ts(100)),
        );

        let mut scheduler = BasicScheduler::new(128);
        let mut ctx = ScheduleContext {
            registry: &mut registry,
            controller: &mut controller,
            node_view: &node_view,
            now: Instant::now(),
        };
        assert_eq!(scheduler.execute(&mut ctx), 0);
        assert_eq!(registry.absent_size(), 1);
    }
}
