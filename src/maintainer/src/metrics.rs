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

use std::sync::Arc;

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};

#[derive(Clone)]
pub struct MaintainerMetrics {
    /// Messages dropped for epoch / sequence / ownership mismatch.
    pub stale_message_count: IntCounter,

    /// Operator lifecycle, labelled by operator kind and outcome.
    pub operator_count: IntCounterVec,

    /// Physical part of the published checkpoint ts.
    pub checkpoint_ts_gauge: IntGauge,
    /// Physical part of the published resolved ts.
    pub resolved_ts_gauge: IntGauge,

    /// Physical part of the last safepoint this changefeed pushed.
    pub gc_safepoint_gauge: IntGauge,
    /// Physical part of the cluster-min service safepoint.
    pub min_service_gc_safepoint_gauge: IntGauge,

    pub barrier_pending_gauge: IntGauge,
}

pub type MaintainerMetricsRef = Arc<MaintainerMetrics>;

impl MaintainerMetrics {
    pub fn new(registry: &Registry) -> Self {
        let stale_message_count = register_int_counter_with_registry!(
            "maintainer_stale_message_count",
            "Total number of messages dropped as stale or mis-owned",
            registry
        )
        .unwrap();
        let operator_count = register_int_counter_vec_with_registry!(
            "maintainer_operator_count",
            "Scheduling operators by kind and outcome",
            &["kind", "outcome"],
            registry
        )
        .unwrap();
        let checkpoint_ts_gauge = register_int_gauge_with_registry!(
            "maintainer_checkpoint_ts",
            "Physical part of the published changefeed checkpoint ts",
            registry
        )
        .unwrap();
        let resolved_ts_gauge = register_int_gauge_with_registry!(
            "maintainer_resolved_ts",
            "Physical part of the published changefeed resolved ts",
            registry
        )
        .unwrap();
        let gc_safepoint_gauge = register_int_gauge_with_registry!(
            "maintainer_gc_safepoint_ts",
            "Physical part of the service GC safepoint pushed by this changefeed",
            registry
        )
        .unwrap();
        let min_service_gc_safepoint_gauge = register_int_gauge_with_registry!(
            "maintainer_min_service_gc_safepoint_ts",
            "Physical part of the cluster-wide minimum service GC safepoint",
            registry
        )
        .unwrap();
        let barrier_pending_gauge = register_int_gauge_with_registry!(
            "maintainer_barrier_pending",
            "Number of barriers not yet released",
            registry
        )
        .unwrap();
        Self {
            stale_message_count,
            operator_count,
            checkpoint_ts_gauge,
            resolved_ts_gauge,
            gc_safepoint_gauge,
            min_service_gc_safepoint_gauge,
            barrier_pending_gauge,
        }
    }

    pub fn for_test() -> MaintainerMetricsRef {
        Arc::new(Self::new(&Registry::new()))
    }
}
