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

//! Keeps the span assignment balanced, in two phases with a fixed order:
//! first each group is leveled on its own, then group membership is spread
//! across nodes so no node concentrates whole groups. The second phase only
//! runs when the first moved nothing.

use std::collections::HashMap;
use std::time::Duration;

use changeflow_common::{DispatcherId, NodeId};
use itertools::Itertools;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::time::Instant;

use super::{ScheduleContext, Scheduler};
use crate::operator::SpanOperator;

pub struct BalanceScheduler {
    batch_size: usize,
    check_balance_interval: Duration,
    last_rebalance_time: Option<Instant>,

    /// Tie-breaks among equally-loaded victims, seeded so tests are
    /// deterministic.
    random: StdRng,

    /// Set when the previous pass moved a full batch: the next pass skips
    /// the inter-tick wait so a large rebalance drains quickly.
    force_balance: bool,
}

impl BalanceScheduler {
    pub fn new(batch_size: usize, check_balance_interval: Duration) -> Self {
        Self::with_seed(batch_size, check_balance_interval, rand::random())
    }

    pub fn with_seed(batch_size: usize, check_balance_interval: Duration, seed: u64) -> Self {
        Self {
            batch_size,
            check_balance_interval,
            last_rebalance_time: None,
            random: StdRng::seed_from_u64(seed),
            force_balance: false,
        }
    }
}

/// Imbalanced once the heaviest and lightest node differ by two or more; a
/// difference of one is the unavoidable remainder.
fn is_imbalanced(sizes: &HashMap<NodeId, usize>) -> bool {
    match sizes.values().copied().minmax().into_option() {
        Some((min, max)) => max - min >= 2,
        None => false,
    }
}

impl Scheduler for BalanceScheduler {
    fn name(&self) -> &'static str {
        "balance-scheduler"
    }

    fn execute(&mut self, ctx: &mut ScheduleContext<'_>) -> usize {
        if !self.force_balance
            && self
                .last_rebalance_time
                .is_some_and(|last| ctx.now.duration_since(last) < self.check_balance_interval)
        {
            return 0;
        }
        if !ctx.in_stable_state() {
            // Not in a stable schedule state, skip balance.
            return 0;
        }
        let nodes: Vec<NodeId> = ctx.node_view.alive_nodes().cloned().sorted().collect();
        if nodes.is_empty() {
            return 0;
        }

        let mut moved = self.schedule_groups(ctx, &nodes);
        if moved == 0 {
            // All groups are balanced on their own, safe to spread group
            // membership globally.
            moved = self.schedule_global(ctx, &nodes);
        }

        self.force_balance = moved >= self.batch_size;
        self.last_rebalance_time = Some(ctx.now);
        moved
    }
}

impl BalanceScheduler {
    /// Level each group independently across the nodes.
    fn schedule_groups(&mut self, ctx: &mut ScheduleContext<'_>, nodes: &[NodeId]) -> usize {
        let mut moved = 0;
        for group in ctx.registry.groups() {
            let sizes = ctx.registry.task_size_per_node_by_group(nodes, group);
            if !is_imbalanced(&sizes) {
                continue;
            }
            moved += self.balance_group(ctx, nodes, group, self.batch_size - moved);
            if moved >= self.batch_size {
                break;
            }
        }
        moved
    }

    fn balance_group(
        &mut self,
        ctx: &mut ScheduleContext<'_>,
        nodes: &[NodeId],
        group: changeflow_common::GroupId,
        budget: usize,
    ) -> usize {
        let replicas = ctx.registry.working_ids_by_group(group);
        if replicas.is_empty() || nodes.is_empty() {
            return 0;
        }
        let upper_limit = replicas.len().div_ceil(nodes.len());

        let mut per_node: HashMap<NodeId, Vec<DispatcherId>> =
            nodes.iter().map(|n| (n.clone(), Vec::new())).collect();
        for id in replicas {
            let owner = ctx.registry.get(id).unwrap().node_id.clone().unwrap();
            if let Some(ids) = per_node.get_mut(&owner) {
                ids.push(id);
            }
        }

        // Victims are the spans beyond each node's even share, picked at
        // random so repeated rebalances do not always churn the same spans.
        let mut victims = Vec::new();
        for ids in per_node.values_mut() {
            if ids.len() > upper_limit {
                ids.shuffle(&mut self.random);
                victims.extend(ids.split_off(upper_limit));
            }
        }

        // Fill receivers lightest-first, node id as tiebreak.
        let mut receivers = per_node
            .iter()
            .map(|(n, ids)| (n.clone(), ids.len()))
            .collect_vec();
        let mut moved = 0;
        for id in victims.into_iter().take(budget) {
            receivers.sort_by(|(a_node, a_size), (b_node, b_size)| {
                a_size.cmp(b_size).then_with(|| a_node.cmp(b_node))
            });
            let (dest, size) = match receivers.iter_mut().find(|(_, size)| *size < upper_limit) {
                Some(receiver) => receiver,
                None => break,
            };
            let origin = ctx.registry.get(id).unwrap().node_id.clone().unwrap();
            if origin == *dest {
                continue;
            }
            if ctx.controller.add_operator(
                ctx.registry,
                SpanOperator::relocate(id, origin, dest.clone()),
            ) {
                *size += 1;
                moved += 1;
            }
        }
        if moved > 0 {
            tracing::info!(
                changefeed = %ctx.registry.changefeed_id(),
                group = %group,
                moved,
                "group balance moved spans"
            );
        }
        moved
    }

    /// Spread group membership: pair nodes above the global floor that hold
    /// a task of a group with nodes below the floor that hold none of it.
    fn schedule_global(&mut self, ctx: &mut ScheduleContext<'_>, nodes: &[NodeId]) -> usize {
        let sizes = ctx.registry.task_size_per_node(nodes);
        if !is_imbalanced(&sizes) {
            return 0;
        }
        let group_node_tasks = ctx.registry.group_node_tasks(nodes);

        // One representative task per (group, node); the floor is computed
        // over that thinned view, len(nodes) * len(groups) work in total.
        let mut total_tasks = 0;
        let mut size_per_node: HashMap<&NodeId, usize> = nodes.iter().map(|n| (n, 0)).collect();
        for node_tasks in group_node_tasks.values() {
            for (node, task) in node_tasks {
                if task.is_some() {
                    total_tasks += 1;
                    *size_per_node.get_mut(node).expect("alive node") += 1;
                }
            }
        }
        let lower_limit = total_tasks / nodes.len();
        if size_per_node.values().all(|&size| size == lower_limit) {
            // All nodes are globally balanced.
            return 0;
        }

        let mut moved = 0;
        for group in group_node_tasks.keys().copied().sorted() {
            let node_tasks = &group_node_tasks[&group];
            let mut victims = Vec::new();
            let mut available = Vec::new();
            for node in nodes {
                match node_tasks[node] {
                    Some(task) if size_per_node[node] > lower_limit => {
                        victims.push((node, task));
                    }
                    None if size_per_node[node] < lower_limit => available.push(node),
                    _ => {}
                }
            }

            let mut next = 0;
            for dest in available {
                let Some((origin, task)) = victims.get(next) else {
                    break;
                };
                if ctx.controller.add_operator(
                    ctx.registry,
                    SpanOperator::relocate(*task, (*origin).clone(), dest.clone()),
                ) {
                    *size_per_node.get_mut(*origin).expect("alive node") -= 1;
                    *size_per_node.get_mut(dest).expect("alive node") += 1;
                    next += 1;
                    moved += 1;
                }
            }
        }
        tracing::info!(
            changefeed = %ctx.registry.changefeed_id(),
            moved,
            "finish global balance"
        );
        moved
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use changeflow_common::{ChangefeedId, GroupId, SchemaId, TableId, TableSpan, Ts, Watermark};
    use itertools::Itertools;

    use super::*;
    use crate::metrics::MaintainerMetrics;
    use crate::node_view::NodeView;
    use crate::operator::OperatorController;
    use crate::registry::SpanRegistry;
    use crate::test_utils::{complete_all_operators, make_nodes};

    fn controller() -> OperatorController {
        OperatorController::new(
            Duration::from_secs(10),
            3,
            256,
            MaintainerMetrics::for_test(),
        )
    }

    fn working_span(
        registry: &mut SpanRegistry,
        table: i64,
        sub: &[u8],
        node: &NodeId,
    ) -> DispatcherId {
        // Sub-splits of one table share its group; `sub` disambiguates the
        // key range.
        let complete = TableSpan::table_record_range(TableId(table));
        let mut start = complete.start_key.to_vec();
        start.extend_from_slice(sub);
        let span = if sub.is_empty() {
            complete
        } else {
            TableSpan::new(TableId(table), start, complete.end_key.clone())
        };
        let id = registry.add_absent(span, SchemaId(1), GroupId(table), Watermark::new(Ts(100)));
        registry.mark_scheduling(id, node.clone());
        registry.mark_working(id, node);
        id
    }

    #[test]
    fn test_balance_after_join_converges_without_rework() {
        let mut registry = SpanRegistry::new(ChangefeedId::in_default_namespace("balance-test"));
        let mut controller = controller();
        let mut node_view = NodeView::new();
        node_view.apply(make_nodes(&["n1", "n2", "n3"]));
        let n1 = NodeId::from("n1");

        // 100 single-span tables, all piled on n1.
        for table in 0..100 {
            working_span(&mut registry, table, b"", &n1);
        }

        let mut scheduler = BalanceScheduler::with_seed(10, Duration::from_secs(60), 42);
        let mut moved_once: HashSet<DispatcherId> = HashSet::new();
        let mut now = Instant::now();
        for _ in 0..20 {
            let before: HashMap<_, _> = (0..100)
                .filter_map(|t| registry.ids_by_group(GroupId(t)).into_iter().next())
                .map(|id| (id, registry.get(id).unwrap().node_id.clone()))
                .collect();
            let moved = {
                let mut ctx = ScheduleContext {
                    registry: &mut registry,
                    controller: &mut controller,
                    node_view: &node_view,
                    now,
                };
                scheduler.execute(&mut ctx)
            };
            complete_all_operators(&mut registry, &mut controller);
            for (id, owner) in before {
                if registry.get(id).unwrap().node_id != owner {
                    // No span is moved more than once: each move advances
                    // the balance.
                    assert!(moved_once.insert(id), "span moved twice");
                }
            }
            now += Duration::from_secs(61);
            if moved == 0 {
                break;
            }
        }

        let sizes = registry.task_size_per_node(node_view.alive_nodes());
        let (min, max) = sizes.values().copied().minmax().into_option().unwrap();
        assert!(max - min <= 1, "sizes {sizes:?}");
        assert_eq!(sizes.values().sum::<usize>(), 100);
    }

    #[test]
    fn test_group_phase_levels_each_group() {
        let mut registry = SpanRegistry::new(ChangefeedId::in_default_namespace("balance-test"));
        let mut controller = controller();
        let mut node_view = NodeView::new();
        node_view.apply(make_nodes(&["n1", "n2"]));
        let n1 = NodeId::from("n1");

        // One table split four ways, all on n1: the group itself is
        // imbalanced (4 vs 0).
        for sub in [b"a" as &[u8], b"b", b"c", b"d"] {
            working_span(&mut registry, 1, sub, &n1);
        }

        let mut scheduler = BalanceScheduler::with_seed(10, Duration::from_secs(60), 7);
        let mut ctx = ScheduleContext {
            registry: &mut registry,
            controller: &mut controller,
            node_view: &node_view,
            now: Instant::now(),
        };
        let moved = scheduler.execute(&mut ctx);
        assert_eq!(moved, 2);
        complete_all_operators(&mut registry, &mut controller);
        let sizes = registry.task_size_per_node_by_group(node_view.alive_nodes(), GroupId(1));
        assert!(sizes.values().all(|&s| s == 2), "sizes {sizes:?}");
    }

    #[test]
    fn test_global_phase_spreads_group_membership() {
        let mut registry = SpanRegistry::new(ChangefeedId::in_default_namespace("balance-test"));
        let mut controller = controller();
        let mut node_view = NodeView::new();
        node_view.apply(make_nodes(&["n1", "n2"]));
        let n1 = NodeId::from("n1");

        // Three single-span groups, all on n1. Every group is internally
        // "balanced" (max - min = 1), so only the global phase can act.
        for table in 1..=3 {
            working_span(&mut registry, table, b"", &n1);
        }

        let mut scheduler = BalanceScheduler::with_seed(10, Duration::from_secs(60), 7);
        let moved = {
            let mut ctx = ScheduleContext {
                registry: &mut registry,
                controller: &mut controller,
                node_view: &node_view,
                now: Instant::now(),
            };
            scheduler.execute(&mut ctx)
        };
        assert!(moved >= 1, "global phase moved nothing");
        complete_all_operators(&mut registry, &mut controller);
        let sizes = registry.task_size_per_node(node_view.alive_nodes());
        let (min, max) = sizes.values().copied().minmax().into_option().unwrap();
        assert!(max - min <= 1, "sizes {sizes:?}");
    }

    #[test]
    fn test_skips_when_not_stable() {
        let mut registry = SpanRegistry::new(ChangefeedId::in_default_namespace("balance-test"));
        let mut controller = controller();
        let mut node_view = NodeView::new();
        node_view.apply(make_nodes(&["n1", "n2"]));

        // An absent span means the basic scheduler still has work to do.
        registry.add_absent(
            TableSpan::table_record_range(TableId(1)),
            SchemaId(1),
            GroupId(1),
            Watermark::new(Ts(100)),
        );
        let n1 = NodeId::from("n1");
        for table in 2..=5 {
            working_span(&mut registry, table, b"", &n1);
        }

        let mut scheduler = BalanceScheduler::with_seed(10, Duration::from_secs(60), 7);
        let mut ctx = ScheduleContext {
            registry: &mut registry,
            controller: &mut controller,
            node_view: &node_view,
            now: Instant::now(),
        };
        assert_eq!(scheduler.execute(&mut ctx), 0);
    }
}
