//! Bounded-time polling of eventually-consistent remote resources.
//!
//! [`poll_until`] observes a resource on a fixed interval until a readiness
//! predicate holds or the deadline elapses. Observation failures are logged
//! and retried without extending the deadline. Nothing is rolled back on
//! expiry: the remote resource may still converge, and a retried call simply
//! re-enters the loop, where the first observation succeeds immediately.

use std::fmt::{Debug, Display};
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

/// Interval and overall deadline for one polling loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Delay between observations.
    pub interval: Duration,
    /// Overall deadline measured from the first observation.
    pub timeout: Duration,
}

impl PollPolicy {
    /// Waiting for a created volume to settle.
    pub const CREATE_VOLUME: Self = Self::new(Duration::from_secs(5), Duration::from_secs(120));
    /// Waiting for an attachment to become visible.
    pub const ATTACH: Self = Self::new(Duration::from_secs(5), Duration::from_secs(120));
    /// Waiting for a detachment to become visible.
    pub const DETACH: Self = Self::new(Duration::from_secs(5), Duration::from_secs(120));
    /// Waiting for a snapshot to progress.
    pub const SNAPSHOT: Self = Self::new(Duration::from_secs(3), Duration::from_secs(120));
    /// Waiting for a resize to be reported.
    pub const RESIZE: Self = Self::new(Duration::from_secs(3), Duration::from_secs(120));

    /// Builds a policy from an interval and a deadline.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Raised when a polling loop exhausts its deadline.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("timed out after {waited:?} waiting for {action} on {resource}")]
pub struct PollTimeout {
    /// Operation being waited on (for example `attach`).
    pub action: String,
    /// Remote identifier of the observed resource.
    pub resource: String,
    /// Time spent polling.
    pub waited: Duration,
    /// Debug rendering of the last successful observation, if any.
    pub last_observed: Option<String>,
}

/// Polls `observe` until `is_ready` accepts the observed state.
///
/// The first observation happens immediately. Errors returned by `observe`
/// are logged and treated as "not ready yet".
///
/// # Errors
///
/// Returns [`PollTimeout`] once `policy.timeout` has elapsed without a ready
/// observation.
pub async fn poll_until<T, E, F, Fut, P>(
    policy: PollPolicy,
    action: &str,
    resource: &str,
    mut observe: F,
    is_ready: P,
) -> Result<T, PollTimeout>
where
    T: Debug,
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&T) -> bool,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut last_observed = None;
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        match observe().await {
            Ok(state) if is_ready(&state) => {
                debug!(action, resource, attempt, "remote resource ready");
                return Ok(state);
            }
            Ok(state) => {
                debug!(action, resource, attempt, ?state, "remote resource not ready");
                last_observed = Some(format!("{state:?}"));
            }
            Err(err) => {
                warn!(action, resource, attempt, error = %err, "observation failed, retrying");
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollTimeout {
                action: action.to_owned(),
                resource: resource.to_owned(),
                waited: now.saturating_duration_since(started),
                last_observed,
            });
        }
        sleep(policy.interval.min(deadline.saturating_duration_since(now))).await;
    }
}
