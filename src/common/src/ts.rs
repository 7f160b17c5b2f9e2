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

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Number of bits reserved for the logical suffix of a [`Ts`].
pub const TS_LOGICAL_BITS: u32 = 18;

const TS_LOGICAL_MASK: u64 = (1 << TS_LOGICAL_BITS) - 1;

/// A 64-bit hybrid logical timestamp issued by the source cluster: physical
/// milliseconds in the high bits and an 18-bit logical counter in the low
/// bits. All ordering in the system uses this type.
#[derive(
    Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Ts(pub u64);

impl Ts {
    pub const MAX: Ts = Ts(u64::MAX);
    pub const ZERO: Ts = Ts(0);

    pub fn compose(physical_millis: u64, logical: u64) -> Self {
        Self(physical_millis << TS_LOGICAL_BITS | (logical & TS_LOGICAL_MASK))
    }

    /// Physical part, in unix milliseconds.
    pub fn physical(self) -> u64 {
        self.0 >> TS_LOGICAL_BITS
    }

    pub fn logical(self) -> u64 {
        self.0 & TS_LOGICAL_MASK
    }

    /// The timestamp just below `self`. Saturates at zero.
    pub fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn from_unix_millis(millis: u64) -> Self {
        Self::compose(millis, 0)
    }

    /// A timestamp composed from the current wall clock. Only suitable for
    /// TTL-style comparisons against other locally-composed timestamps.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before unix epoch")
            .as_millis() as u64;
        Self::from_unix_millis(millis)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for Ts {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Ts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The pair of timestamps a dispatcher reports for its span.
///
/// `checkpoint_ts` is the timestamp strictly below which all changes are
/// durably delivered to the sink; `resolved_ts` is the timestamp below which
/// the source promises no further events. `checkpoint_ts <= resolved_ts`
/// always holds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub checkpoint_ts: Ts,
    pub resolved_ts: Ts,
}

impl Watermark {
    pub fn new(ts: Ts) -> Self {
        Self {
            checkpoint_ts: ts,
            resolved_ts: ts,
        }
    }

    pub const MAX: Watermark = Watermark {
        checkpoint_ts: Ts::MAX,
        resolved_ts: Ts::MAX,
    };

    /// Advance both components to the max of `self` and `other`. Returns
    /// whether anything moved forward.
    pub fn advance_to(&mut self, other: Watermark) -> bool {
        let mut advanced = false;
        if other.checkpoint_ts > self.checkpoint_ts {
            self.checkpoint_ts = other.checkpoint_ts;
            advanced = true;
        }
        if other.resolved_ts > self.resolved_ts {
            self.resolved_ts = other.resolved_ts;
            advanced = true;
        }
        debug_assert!(self.checkpoint_ts <= self.resolved_ts);
        advanced
    }

    /// Lower both components to the min of `self` and `other`.
    pub fn fold_min(&mut self, other: Watermark) {
        self.checkpoint_ts = self.checkpoint_ts.min(other.checkpoint_ts);
        self.resolved_ts = self.resolved_ts.min(other.resolved_ts);
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.checkpoint_ts, self.resolved_ts)
    }
}
