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

use serde::{Deserialize, Serialize};

use crate::ts::Ts;

/// The desired state of a changefeed as recorded by the control plane.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangefeedTargetState {
    #[default]
    Running,
    Stopped,
}

/// The per-changefeed info record, the only state persisted in the external
/// metadata store. Everything else the maintainer needs is rebuilt from
/// bootstrap.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangefeedInfo {
    pub sink_uri: String,

    /// Table filter rules in the upstream's filter syntax.
    pub filter_rules: Vec<String>,

    pub target_state: ChangefeedTargetState,

    /// Timestamp the changefeed started replicating from.
    pub start_ts: Ts,

    /// Last checkpoint the control plane recorded before handing the
    /// changefeed to this maintainer.
    pub checkpoint_ts: Ts,

    /// Forced resume point. Must be at or below the source's current
    /// timestamp; validated before any span is scheduled.
    pub overwrite_checkpoint_ts: Option<Ts>,
}

impl ChangefeedInfo {
    pub fn new(sink_uri: impl Into<String>, start_ts: Ts) -> Self {
        Self {
            sink_uri: sink_uri.into(),
            filter_rules: vec![],
            target_state: ChangefeedTargetState::Running,
            start_ts,
            checkpoint_ts: start_ts,
            overwrite_checkpoint_ts: None,
        }
    }

    /// The timestamp replication actually resumes from.
    pub fn effective_checkpoint(&self) -> Ts {
        self.overwrite_checkpoint_ts
            .unwrap_or(self.checkpoint_ts.max(self.start_ts))
    }
}
