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

use std::backtrace::Backtrace;
use std::sync::Arc;
use std::time::Duration;

use changeflow_common::{NodeId, Ts};

pub type MaintainerResult<T> = std::result::Result<T, MaintainerError>;

#[derive(thiserror::Error, Debug)]
enum MaintainerErrorInner {
    /// Send failure or timeout on the transport. Absorbed by operator retry.
    #[error("transport error: {0}")]
    Transport(anyhow::Error),

    #[error("node {0} did not answer bootstrap within the deadline")]
    BootstrapTimeout(NodeId),

    /// The changefeed's resume point has already been garbage collected
    /// upstream.
    #[error("start ts {start_ts} is not above the minimum service GC safepoint {min_service_ts}")]
    StartTsBeforeGc { start_ts: Ts, min_service_ts: Ts },

    /// Another service's safepoint advanced past our checkpoint between
    /// pushes.
    #[error("snapshot lost by GC: checkpoint ts {checkpoint_ts}, service GC safepoint {min_service_ts}")]
    SnapshotLostByGc { checkpoint_ts: Ts, min_service_ts: Ts },

    #[error("no successful GC safepoint push within the ttl {ttl:?}")]
    GcTtlExceeded { ttl: Duration },

    #[error("overwritten checkpoint ts {checkpoint_ts} is above the current source ts {current_ts}")]
    InvalidCheckpoint { checkpoint_ts: Ts, current_ts: Ts },

    #[error(transparent)]
    Internal(anyhow::Error),
}

/// Error of the changefeed maintainer. Cheap to clone so it can be fanned out
/// to every waiter on the result channel.
#[derive(thiserror::Error, Clone)]
#[error("{inner}")]
pub struct MaintainerError {
    inner: Arc<MaintainerErrorInner>,
    backtrace: Arc<Backtrace>,
}

impl std::fmt::Debug for MaintainerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)?;
        writeln!(f)?;
        write!(f, "  backtrace:\n{}", self.backtrace)?;
        Ok(())
    }
}

impl From<MaintainerErrorInner> for MaintainerError {
    fn from(inner: MaintainerErrorInner) -> Self {
        Self {
            inner: Arc::new(inner),
            backtrace: Arc::new(Backtrace::capture()),
        }
    }
}

impl MaintainerError {
    pub fn transport(e: impl Into<anyhow::Error>) -> Self {
        MaintainerErrorInner::Transport(e.into()).into()
    }

    pub fn bootstrap_timeout(node: NodeId) -> Self {
        MaintainerErrorInner::BootstrapTimeout(node).into()
    }

    pub fn start_ts_before_gc(start_ts: Ts, min_service_ts: Ts) -> Self {
        MaintainerErrorInner::StartTsBeforeGc {
            start_ts,
            min_service_ts,
        }
        .into()
    }

    pub fn snapshot_lost_by_gc(checkpoint_ts: Ts, min_service_ts: Ts) -> Self {
        MaintainerErrorInner::SnapshotLostByGc {
            checkpoint_ts,
            min_service_ts,
        }
        .into()
    }

    pub fn gc_ttl_exceeded(ttl: Duration) -> Self {
        MaintainerErrorInner::GcTtlExceeded { ttl }.into()
    }

    pub fn invalid_checkpoint(checkpoint_ts: Ts, current_ts: Ts) -> Self {
        MaintainerErrorInner::InvalidCheckpoint {
            checkpoint_ts,
            current_ts,
        }
        .into()
    }

    /// Whether this error must terminate the maintainer rather than be
    /// absorbed by a local retry.
    pub fn is_changefeed_fatal(&self) -> bool {
        matches!(
            &*self.inner,
            MaintainerErrorInner::StartTsBeforeGc { .. }
                | MaintainerErrorInner::SnapshotLostByGc { .. }
                | MaintainerErrorInner::GcTtlExceeded { .. }
                | MaintainerErrorInner::InvalidCheckpoint { .. }
        )
    }

    pub fn is_start_ts_before_gc(&self) -> bool {
        matches!(&*self.inner, MaintainerErrorInner::StartTsBeforeGc { .. })
    }

    pub fn is_bootstrap_timeout(&self) -> bool {
        matches!(&*self.inner, MaintainerErrorInner::BootstrapTimeout(_))
    }
}

impl From<anyhow::Error> for MaintainerError {
    fn from(a: anyhow::Error) -> Self {
        MaintainerErrorInner::Internal(a).into()
    }
}
