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

//! The published changefeed watermark.
//!
//! The published checkpoint is the min over every registry entry, including
//! entries whose owner has not yet acknowledged them: a just-added span
//! participates with its creation-time watermark, so the min can neither
//! skip it (publish high, then regress once it reports) nor advance on a
//! stale owner view. Together with the heartbeat path dropping span reports
//! whose `add_seq` is older than the entry's current incarnation, this is
//! what keeps the published checkpoint monotonic through membership churn
//! and span churn.

use changeflow_common::{Ts, Watermark};

use crate::registry::SpanRegistry;

pub struct WatermarkTracker {
    published: Watermark,
}

impl WatermarkTracker {
    pub fn new(start: Watermark) -> Self {
        Self { published: start }
    }

    pub fn published(&self) -> Watermark {
        self.published
    }

    /// Recompute the published watermark from the registry, clamping the
    /// checkpoint below `ceiling` (an unreleased barrier) when given.
    ///
    /// The published checkpoint never regresses: a min below the current
    /// value means an entry was created behind the published checkpoint,
    /// which is a logic bug upstream of this function.
    pub fn advance(&mut self, registry: &SpanRegistry, ceiling: Option<Ts>) -> Watermark {
        let mut min = Watermark::MAX;
        let mut any = false;
        for entry in registry.entries() {
            any = true;
            min.fold_min(entry.watermark);
        }
        if !any {
            // Nothing to replicate; hold position.
            min = self.published;
        }

        if let Some(cap) = ceiling {
            min.checkpoint_ts = min.checkpoint_ts.min(cap);
        }

        if min.checkpoint_ts < self.published.checkpoint_ts {
            if ceiling.is_none_or(|cap| self.published.checkpoint_ts <= cap) {
                tracing::error!(
                    published = %self.published.checkpoint_ts,
                    computed = %min.checkpoint_ts,
                    "checkpoint regression attempt, keeping published value"
                );
            }
            min.checkpoint_ts = self.published.checkpoint_ts;
        }
        if min.resolved_ts < self.published.resolved_ts {
            min.resolved_ts = self.published.resolved_ts;
        }

        self.published = min;
        min
    }
}
