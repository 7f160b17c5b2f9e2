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

//! Service GC safepoint keeper. The source cluster garbage-collects data
//! below the minimum registered service safepoint; losing that race silently
//! corrupts the changefeed, so falling behind is a changefeed-fatal error,
//! never a retried one.

use std::sync::Arc;
use std::time::Duration;

use changeflow_common::protocol::UpstreamClient;
use changeflow_common::{ChangefeedId, Ts};
use tokio::time::Instant;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;

use crate::error::{MaintainerError, MaintainerResult};
use crate::metrics::MaintainerMetricsRef;

const GC_SERVICE_ID_PREFIX: &str = "changeflow";

/// The id under which the source cluster stores this changefeed's service
/// safepoint: `<prefix><tag><namespace>_<name>`.
pub fn gc_service_id(tag: &str, changefeed_id: &ChangefeedId) -> String {
    format!(
        "{}{}{}_{}",
        GC_SERVICE_ID_PREFIX, tag, changefeed_id.namespace, changefeed_id.name
    )
}

/// One bounded-backoff push of `ts` as the service safepoint. Runs off the
/// maintainer loop; the result re-enters as a completion event.
pub async fn push_safepoint(
    client: Arc<dyn UpstreamClient>,
    service_id: String,
    ttl: Duration,
    ts: Ts,
) -> anyhow::Result<Ts> {
    let backoff = ExponentialBackoff::from_millis(100)
        .max_delay(Duration::from_secs(2))
        .take(3);
    Retry::spawn(backoff, || {
        let client = client.clone();
        let service_id = service_id.clone();
        async move {
            client
                .update_service_gc_safepoint(&service_id, ttl, ts)
                .await
        }
    })
    .await
}

pub struct GcSafepointKeeper {
    changefeed_id: ChangefeedId,
    service_id: String,
    ttl: Duration,
    update_interval: Duration,

    last_attempt: Option<Instant>,
    last_success: Instant,
    /// Checkpoint carried by the most recent push attempt.
    last_pushed_ts: Option<Ts>,
    /// Cluster-min service safepoint from the last successful push.
    last_safepoint: Option<Ts>,
    first_push_done: bool,

    metrics: MaintainerMetricsRef,
}

impl GcSafepointKeeper {
    pub fn new(
        changefeed_id: ChangefeedId,
        ttl: Duration,
        update_interval: Duration,
        now: Instant,
        metrics: MaintainerMetricsRef,
    ) -> Self {
        let service_id = gc_service_id("-", &changefeed_id);
        Self {
            changefeed_id,
            service_id,
            ttl,
            update_interval,
            last_attempt: None,
            last_success: now,
            last_pushed_ts: None,
            last_safepoint: None,
            first_push_done: false,
            metrics,
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The first push validates the resume point against the cluster-min
    /// safepoint; scheduling is held back until it succeeds.
    pub fn is_validated(&self) -> bool {
        self.first_push_done
    }

    /// Whether to push now. Pushes are rate-limited to the update interval,
    /// except for the validating first push, an explicit force, or a
    /// checkpoint jump of more than one interval's worth of physical time
    /// (the safepoint should catch up promptly after a stall clears).
    pub fn should_push(&self, now: Instant, checkpoint_ts: Ts, force: bool) -> bool {
        if force || !self.first_push_done {
            return true;
        }
        let jumped = self.last_pushed_ts.is_some_and(|last| {
            checkpoint_ts.physical().saturating_sub(last.physical())
                >= self.update_interval.as_millis() as u64
        });
        if jumped {
            return true;
        }
        self.last_attempt
            .is_none_or(|last| now.duration_since(last) >= self.update_interval)
    }

    pub fn note_attempt(&mut self, now: Instant, checkpoint_ts: Ts) {
        self.last_attempt = Some(now);
        self.last_pushed_ts = Some(checkpoint_ts);
    }

    /// Fold the completion of a push. Transient failures are absorbed until
    /// a TTL has elapsed without success; GC overruns are fatal.
    pub fn on_push_result(
        &mut self,
        now: Instant,
        checkpoint_ts: Ts,
        result: anyhow::Result<Ts>,
    ) -> MaintainerResult<()> {
        let min_service_ts = match result {
            Ok(ts) => ts,
            Err(e) => {
                tracing::warn!(
                    changefeed = %self.changefeed_id,
                    safepoint_ts = %checkpoint_ts,
                    error = %e,
                    "update gc safepoint failed"
                );
                if now.duration_since(self.last_success) >= self.ttl {
                    return Err(MaintainerError::gc_ttl_exceeded(self.ttl));
                }
                return Ok(());
            }
        };

        tracing::debug!(
            changefeed = %self.changefeed_id,
            service_id = %self.service_id,
            checkpoint_ts = %checkpoint_ts,
            actual = %min_service_ts,
            "update gc safepoint"
        );
        if min_service_ts > checkpoint_ts {
            // The source already collected data we still need.
            let err = if self.first_push_done {
                MaintainerError::snapshot_lost_by_gc(checkpoint_ts, min_service_ts)
            } else {
                MaintainerError::start_ts_before_gc(checkpoint_ts, min_service_ts)
            };
            return Err(err);
        }

        self.last_success = now;
        self.last_safepoint = Some(min_service_ts);
        self.first_push_done = true;
        self.metrics
            .gc_safepoint_gauge
            .set(checkpoint_ts.physical() as i64);
        self.metrics
            .min_service_gc_safepoint_gauge
            .set(min_service_ts.physical() as i64);
        Ok(())
    }

    /// Whether the checkpoint has fallen behind another service's safepoint
    /// between pushes.
    pub fn check_stale_checkpoint(&self, checkpoint_ts: Ts) -> MaintainerResult<()> {
        if let Some(min_service_ts) = self.last_safepoint {
            if checkpoint_ts < min_service_ts {
                return Err(MaintainerError::snapshot_lost_by_gc(
                    checkpoint_ts,
                    min_service_ts,
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;
    use crate::metrics::MaintainerMetrics;

    fn keeper(now: Instant) -> GcSafepointKeeper {
        GcSafepointKeeper::new(
            ChangefeedId::in_default_namespace("gc-test"),
            Duration::from_secs(600),
            Duration::from_secs(60),
            now,
            MaintainerMetrics::for_test(),
        )
    }

    #[test]
    fn test_service_id_layout() {
        let id = ChangefeedId::new("ns", "feed");
        assert_eq!(gc_service_id("-", &id), "changeflow-ns_feed");
    }

    #[test]
    fn test_push_rate_limit() {
        let now = Instant::now();
        let mut keeper = keeper(now);
        let ts = Ts::compose(1_000_000, 0);

        // First push is never rate-limited.
        assert!(keeper.should_push(now, ts, false));
        keeper.note_attempt(now, ts);
        keeper.on_push_result(now, ts, Ok(Ts(900))).unwrap();

        let soon = now + Duration::from_secs(30);
        assert!(!keeper.should_push(soon, ts, false));
        assert!(keeper.should_push(now + Duration::from_secs(61), ts, false));
        // An explicit force goes through the interval.
        assert!(keeper.should_push(soon, ts, true));
        // So does a checkpoint jump of more than one interval.
        let jumped = Ts::compose(1_000_000 + 61_000, 0);
        assert!(keeper.should_push(soon, jumped, false));
    }

    #[test]
    fn test_start_ts_behind_gc_is_fatal() {
        let now = Instant::now();
        let mut keeper = keeper(now);

        // The first push reports a cluster-min safepoint past our start ts.
        let err = keeper
            .on_push_result(now, Ts(1000), Ok(Ts(2000)))
            .unwrap_err();
        assert!(err.is_changefeed_fatal());
        assert!(err.is_start_ts_before_gc());
        assert!(!keeper.is_validated());
    }

    #[test]
    fn test_overrun_after_validation_is_snapshot_lost() {
        let now = Instant::now();
        let mut keeper = keeper(now);
        keeper.on_push_result(now, Ts(1000), Ok(Ts(900))).unwrap();

        let err = keeper
            .on_push_result(now, Ts(1100), Ok(Ts(5000)))
            .unwrap_err();
        assert!(err.is_changefeed_fatal());
        assert!(!err.is_start_ts_before_gc());

        assert!(keeper.check_stale_checkpoint(Ts(950)).is_ok());
        assert!(keeper.check_stale_checkpoint(Ts(100)).is_err());
    }

    #[test]
    fn test_transient_failures_absorbed_until_ttl() {
        let now = Instant::now();
        let mut keeper = keeper(now);
        keeper.on_push_result(now, Ts(1000), Ok(Ts(900))).unwrap();

        // Failures inside the TTL are absorbed.
        keeper
            .on_push_result(
                now + Duration::from_secs(30),
                Ts(1100),
                Err(anyhow!("pd unreachable")),
            )
            .unwrap();

        // One whole TTL without a successful push is fatal.
        let err = keeper
            .on_push_result(
                now + Duration::from_secs(601),
                Ts(1100),
                Err(anyhow!("pd unreachable")),
            )
            .unwrap_err();
        assert!(err.is_changefeed_fatal());
    }
}
