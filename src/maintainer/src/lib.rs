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

//! The changefeed maintainer: the per-changefeed control plane that
//! discovers table spans, schedules them across worker nodes, aggregates
//! their watermarks into the published checkpoint, gates DDL barriers and
//! keeps the upstream service GC safepoint pinned.
//!
//! One maintainer runs per changefeed as a single-writer event loop; see
//! [`maintainer::Maintainer`] for the wiring and the module docs of
//! [`registry`], [`operator`], [`scheduler`], [`barrier`], [`watermark`] and
//! [`gc`] for the individual pieces.

pub mod barrier;
pub mod bootstrap;
pub mod error;
pub mod gc;
pub mod maintainer;
pub mod metrics;
pub mod node_view;
pub mod operator;
pub mod registry;
pub mod scheduler;
pub mod watermark;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::{MaintainerError, MaintainerResult};
pub use maintainer::{Maintainer, MaintainerEvent, MaintainerHandle, MaintainerStatus};
