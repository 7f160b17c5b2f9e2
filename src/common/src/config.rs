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

//! This module defines the structure of the configuration file
//! `changeflow.toml`. [`ChangeflowConfig`] corresponds to the whole file and
//! each other config struct corresponds to a section.

use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub fn load_config(path: &str) -> ChangeflowConfig {
    let config = if path.is_empty() {
        tracing::warn!("changeflow.toml not found, using default config.");
        ChangeflowConfig::default()
    } else {
        let config_str = fs::read_to_string(path)
            .unwrap_or_else(|e| panic!("failed to open config file '{}': {}", path, e));
        toml::from_str(config_str.as_str()).unwrap_or_else(|e| panic!("parse error {}", e))
    };
    if !config.unrecognized.is_empty() {
        tracing::warn!(
            "unrecognized fields in config: {:?}",
            config.unrecognized.keys()
        );
    }
    config
}

/// [`ChangeflowConfig`] corresponds to the whole config file
/// `changeflow.toml`. Each field corresponds to a section.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ChangeflowConfig {
    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub gc: GcConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(flatten)]
    pub unrecognized: HashMap<String, Value>,
}

/// The section `[schedule]` in `changeflow.toml`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Maximum number of absent spans placed per scheduler tick.
    #[serde(default = "default::schedule::basic_batch_size")]
    pub basic_batch_size: usize,

    /// Maximum number of spans moved per balance pass.
    #[serde(default = "default::schedule::balance_batch_size")]
    pub balance_batch_size: usize,

    /// Minimum interval between balance passes, unless the previous pass
    /// moved a full batch.
    #[serde(default = "default::schedule::check_balance_interval_secs")]
    pub check_balance_interval_secs: u64,

    /// A scheduling operator is retried after this long without progress.
    #[serde(default = "default::schedule::operator_timeout_secs")]
    pub operator_timeout_secs: u64,

    /// Retry budget of a single operator before it is declared failed.
    #[serde(default = "default::schedule::operator_max_attempts")]
    pub operator_max_attempts: u32,

    /// Cap on operators concurrently targeting one node.
    #[serde(default = "default::schedule::max_operators_per_node")]
    pub max_operators_per_node: usize,

    /// A span is split once its region count exceeds this threshold.
    /// Zero disables splitting.
    #[serde(default = "default::schedule::split_region_threshold")]
    pub split_region_threshold: usize,

    /// Number of children a split produces.
    #[serde(default = "default::schedule::split_span_count")]
    pub split_span_count: usize,

    /// Adjacent co-located spans whose summed region count is below this
    /// threshold are merged. Zero disables merging.
    #[serde(default = "default::schedule::merge_region_threshold")]
    pub merge_region_threshold: usize,

    #[serde(flatten)]
    pub unrecognized: HashMap<String, Value>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

impl ScheduleConfig {
    pub fn check_balance_interval(&self) -> Duration {
        Duration::from_secs(self.check_balance_interval_secs)
    }

    pub fn operator_timeout(&self) -> Duration {
        Duration::from_secs(self.operator_timeout_secs)
    }
}

/// The section `[gc]` in `changeflow.toml`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcConfig {
    /// TTL attached to the service GC safepoint, in seconds. The source
    /// cluster discards the safepoint if it is not refreshed within the TTL.
    #[serde(default = "default::gc::ttl_secs")]
    pub ttl_secs: u64,

    /// Minimum interval between safepoint pushes.
    #[serde(default = "default::gc::update_interval_secs")]
    pub update_interval_secs: u64,

    #[serde(flatten)]
    pub unrecognized: HashMap<String, Value>,
}

impl Default for GcConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

impl GcConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }
}

/// The section `[heartbeat]` in `changeflow.toml`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Period of the maintainer's own tick (scheduling, operator deadlines,
    /// barrier resends).
    #[serde(default = "default::heartbeat::tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// A node that has not answered its bootstrap request within this
    /// deadline is treated as failed.
    #[serde(default = "default::heartbeat::bootstrap_timeout_secs")]
    pub bootstrap_timeout_secs: u64,

    #[serde(flatten)]
    pub unrecognized: HashMap<String, Value>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

impl HeartbeatConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }
}

mod default {
    pub mod schedule {
        pub fn basic_batch_size() -> usize {
            128
        }

        pub fn balance_batch_size() -> usize {
            128
        }

        pub fn check_balance_interval_secs() -> u64 {
            60
        }

        pub fn operator_timeout_secs() -> u64 {
            10
        }

        pub fn operator_max_attempts() -> u32 {
            3
        }

        pub fn max_operators_per_node() -> usize {
            64
        }

        pub fn split_region_threshold() -> usize {
            0
        }

        pub fn split_span_count() -> usize {
            2
        }

        pub fn merge_region_threshold() -> usize {
            0
        }
    }

    pub mod gc {
        pub fn ttl_secs() -> u64 {
            24 * 60 * 60
        }

        pub fn update_interval_secs() -> u64 {
            60
        }
    }

    pub mod heartbeat {
        pub fn tick_interval_ms() -> u64 {
            500
        }

        pub fn bootstrap_timeout_secs() -> u64 {
            30
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sections() {
        let config = ChangeflowConfig::default();
        assert_eq!(config.schedule.basic_batch_size, 128);
        assert_eq!(config.gc.ttl_secs, 86400);
        assert_eq!(config.heartbeat.tick_interval_ms, 500);
    }

    #[test]
    fn test_section_override_keeps_other_defaults() {
        let config: ChangeflowConfig = toml::from_str(
            r#"
            [schedule]
            balance_batch_size = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.schedule.balance_batch_size, 10);
        assert_eq!(config.schedule.basic_batch_size, 128);
        assert!(config.unrecognized.is_empty());
    }
}
