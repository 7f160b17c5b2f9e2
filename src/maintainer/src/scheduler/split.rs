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

//! Adjusts span granularity against the source's region layout: hot wide
//! spans are split into children covering the same range, and runs of small
//! adjacent spans hosted by one node are merged back.

use std::sync::Arc;

use bytes::Bytes;
use changeflow_common::span::start_key_cmp;
use changeflow_common::{DispatcherId, TableSpan};
use itertools::Itertools;

use super::{ScheduleContext, Scheduler};
use crate::operator::SpanOperator;
use crate::registry::ReplicationState;

/// Source-cluster region layout, consulted to decide span granularity.
pub trait RegionCountOracle: Send + Sync + 'static {
    /// Number of regions the span currently covers.
    fn region_count(&self, span: &TableSpan) -> usize;

    /// Interior boundary keys cutting the span into about `parts` pieces,
    /// strictly increasing and strictly inside the span. May return fewer
    /// (or none) when the span has no usable region boundaries.
    fn split_boundaries(&self, span: &TableSpan, parts: usize) -> Vec<Bytes>;
}

/// Oracle for deployments without region information: every span is one
/// region and never splits.
pub struct BasicRegionOracle;

impl RegionCountOracle for BasicRegionOracle {
    fn region_count(&self, _span: &TableSpan) -> usize {
        1
    }

    fn split_boundaries(&self, _span: &TableSpan, _parts: usize) -> Vec<Bytes> {
        vec![]
    }
}

pub struct SplitScheduler {
    oracle: Arc<dyn RegionCountOracle>,
    region_threshold: usize,
    split_parts: usize,
    merge_threshold: usize,
}

impl SplitScheduler {
    pub fn new(
        oracle: Arc<dyn RegionCountOracle>,
        region_threshold: usize,
        split_parts: usize,
        merge_threshold: usize,
    ) -> Self {
        Self {
            oracle,
            region_threshold,
            split_parts: split_parts.max(2),
            merge_threshold,
        }
    }
}

impl Scheduler for SplitScheduler {
    fn name(&self) -> &'static str {
        "split-scheduler"
    }

    fn execute(&mut self, ctx: &mut ScheduleContext<'_>) -> usize {
        if self.region_threshold == 0 && self.merge_threshold == 0 {
            return 0;
        }
        if !ctx.in_stable_state() {
            return 0;
        }
        let mut produced = 0;
        if self.region_threshold > 0 {
            produced += self.split_pass(ctx);
        }
        if self.merge_threshold > 0 {
            produced += self.merge_pass(ctx);
        }
        produced
    }
}

impl SplitScheduler {
    fn split_pass(&mut self, ctx: &mut ScheduleContext<'_>) -> usize {
        let mut produced = 0;
        for id in ctx.registry.ids_by_state(ReplicationState::Working) {
            let entry = ctx.registry.get(id).expect("listed id");
            if self.oracle.region_count(&entry.span) <= self.region_threshold {
                continue;
            }
            let boundaries = self.oracle.split_boundaries(&entry.span, self.split_parts);
            if boundaries.is_empty() {
                continue;
            }
            let children = entry.span.split_at(boundaries);
            if children.len() < 2 {
                continue;
            }
            let origin = entry.node_id.clone().expect("working span has an owner");
            tracing::info!(
                changefeed = %ctx.registry.changefeed_id(),
                dispatcher = %id,
                children = children.len(),
                "split hot span"
            );
            if ctx
                .controller
                .add_operator(ctx.registry, SpanOperator::split(id, origin, children))
            {
                produced += 1;
            }
        }
        produced
    }

    fn merge_pass(&mut self, ctx: &mut ScheduleContext<'_>) -> usize {
        let mut produced = 0;
        for table in ctx.registry.tables() {
            let entries = ctx
                .registry
                .ids_by_table(table)
                .into_iter()
                .filter_map(|id| ctx.registry.get(id))
                .filter(|e| e.state == ReplicationState::Working)
                .map(|e| {
                    (
                        e.id,
                        e.span.clone(),
                        e.node_id.clone().expect("working span has an owner"),
                    )
                })
                .sorted_by(|(_, a, _), (_, b, _)| start_key_cmp(&a.start_key, &b.start_key))
                .collect_vec();
            if entries.len() < 2 {
                continue;
            }

            // Maximal runs of adjacent spans on one node whose total region
            // count stays below the threshold. Cross-node merges are left to
            // the balancer, which co-locates group members first.
            let mut run: Vec<(DispatcherId, TableSpan)> = vec![];
            let mut run_node = None;
            let mut run_regions = 0;
            for (id, span, node) in entries {
                let regions = self.oracle.region_count(&span);
                let continues = run
                    .last()
                    .is_some_and(|(_, prev): &(_, TableSpan)| prev.is_adjacent_to(&span))
                    && run_node.as_ref() == Some(&node)
                    && run_regions + regions < self.merge_threshold;
                if continues {
                    run.push((id, span));
                    run_regions += regions;
                } else {
                    produced += self.emit_merge(ctx, &run, run_node.take());
                    run_regions = regions;
                    run_node = Some(node);
                    run = vec![(id, span)];
                }
            }
            produced += self.emit_merge(ctx, &run, run_node.take());
        }
        produced
    }

    fn emit_merge(
        &self,
        ctx: &mut ScheduleContext<'_>,
        run: &[(DispatcherId, TableSpan)],
        node: Option<changeflow_common::NodeId>,
    ) -> usize {
        if run.len() < 2 {
            return 0;
        }
        let spans = run.iter().map(|(_, span)| span.clone()).collect_vec();
        let Some(merged_span) = TableSpan::merge_adjacent(&spans) else {
            return 0;
        };
        let source_ids = run.iter().map(|(id, _)| *id).collect_vec();
        let merged_id = DispatcherId::new();
        tracing::info!(
            changefeed = %ctx.registry.changefeed_id(),
            sources = source_ids.len(),
            merged = %merged_id,
            "merge small adjacent spans"
        );
        usize::from(ctx.controller.add_operator(
            ctx.registry,
            SpanOperator::merge(merged_id, node.expect("run has a node"), source_ids, merged_span),
        ))
    }
}
