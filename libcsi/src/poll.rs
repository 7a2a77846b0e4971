//! Bounded poll-until-ready primitive.
//!
//! Used wherever the driver has to wait for the kernel to catch up with an
//! action it just took: the SCSI host of a fresh iSCSI session showing up in
//! sysfs, and the by-path block device appearing after login.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// How often and for how long to check a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Number of checks allowed after the initial one.
    pub fn retries(&self) -> u32 {
        if self.interval.is_zero() {
            return 0;
        }
        let retries = self.timeout.as_nanos() / self.interval.as_nanos();
        u32::try_from(retries).unwrap_or(u32::MAX)
    }
}

/// Calls `check` until it yields a value, or the retry budget of `policy` is spent.
///
/// The check runs once immediately and then after every `interval`, at most
/// `1 + policy.retries()` times in total.  Transient check errors are retried
/// like a `None`; only the error of the final attempt is returned.  `Ok(None)`
/// means the value never appeared.
pub async fn poll_until<T, E, F, Fut>(policy: PollPolicy, mut check: F) -> Result<Option<T>, E>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let retries = policy.retries();
    let mut attempt = 0;
    loop {
        match check(attempt).await {
            Ok(Some(value)) => return Ok(Some(value)),
            Ok(None) if attempt >= retries => return Ok(None),
            Err(e) if attempt >= retries => return Err(e),
            Ok(None) => debug!(attempt, "not ready yet"),
            Err(e) => debug!(attempt, error = %e, "check failed, retrying"),
        }
        attempt += 1;
        tokio::time::sleep(policy.interval).await;
    }
}
