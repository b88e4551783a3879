use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, VmError};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// How long and how often to re-read a server while waiting for it to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// Result of a single poll.
#[derive(Debug)]
pub enum Probe<T> {
    Ready(T),
    /// Not there yet; carries the status last observed.
    Pending(String),
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Call `probe` until it reports ready or the deadline passes.
    ///
    /// The probe always runs at least once. Errors from the probe end the wait.
    pub async fn wait<T, F, Fut>(&self, name: &str, target: &str, mut probe: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Probe<T>>>,
    {
        let start = tokio::time::Instant::now();
        let mut polls: u32 = 0;
        loop {
            polls += 1;
            let last = match probe().await? {
                Probe::Ready(value) => {
                    debug!(name = %name, target = %target, polls, "settled");
                    return Ok(value);
                }
                Probe::Pending(status) => status,
            };
            debug!(name = %name, target = %target, status = %last, polls, "waiting");

            if start.elapsed() >= self.timeout {
                return Err(VmError::PollTimeout {
                    name: name.to_string(),
                    target: target.to_string(),
                    last,
                    polls,
                    timeout: self.timeout,
                });
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}
