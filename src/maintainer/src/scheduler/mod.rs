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

//! The scheduler pipeline: a fixed sequence of policies that inspect the
//! registry and the node view and emit operators. Run on the periodic tick
//! and re-run on membership or registry events.

mod balance;
mod basic;
mod split;

pub use balance::BalanceScheduler;
pub use basic::BasicScheduler;
pub use split::{BasicRegionOracle, RegionCountOracle, SplitScheduler};
use tokio::time::Instant;

use crate::node_view::NodeView;
use crate::operator::OperatorController;
use crate::registry::SpanRegistry;

/// Everything a scheduler pass may inspect or mutate.
pub struct ScheduleContext<'a> {
    pub registry: &'a mut SpanRegistry,
    pub controller: &'a mut OperatorController,
    pub node_view: &'a NodeView,
    pub now: Instant,
}

impl ScheduleContext<'_> {
    /// No operator in flight and nothing waiting for placement: safe for the
    /// reshaping passes (balance, split, merge) to act.
    pub fn in_stable_state(&self) -> bool {
        self.controller.operator_size() == 0 && self.registry.absent_size() == 0
    }
}

pub trait Scheduler: Send + Sync {
    fn name(&self) -> &'static str;

    /// One pass. Returns the number of operators produced.
    fn execute(&mut self, ctx: &mut ScheduleContext<'_>) -> usize;
}

/// The fixed pipeline: placement before balance, balance before reshaping.
pub fn default_pipeline(
    config: &changeflow_common::config::ScheduleConfig,
    oracle: std::sync::Arc<dyn RegionCountOracle>,
) -> Vec<Box<dyn Scheduler>> {
    vec![
        Box::new(BasicScheduler::new(config.basic_batch_size)),
        Box::new(BalanceScheduler::new(
            config.balance_batch_size,
            config.check_balance_interval(),
        )),
        Box::new(SplitScheduler::new(
            oracle,
            config.split_region_threshold,
            config.split_span_count,
            config.merge_region_threshold,
        )),
    ]
}
