use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{
    Config, MAX_POLL_INTERVAL_SECONDS, MAX_POLL_TIMEOUT_SECONDS, MIN_POLL_INTERVAL_SECONDS,
};
use crate::painter::client::{PainterApi, PainterError, TaskHandle, TaskResult};

/// Cadence of result polling for one task.
///
/// The first query happens `interval` after submission. Each non-terminal
/// answer multiplies the wait by `backoff_factor`, capped at `max_interval`.
/// `timeout` bounds the whole loop; `None` polls until the task finishes or
/// is cancelled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub backoff_factor: f64,
    pub max_interval: Duration,
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            backoff_factor: 1.0,
            max_interval: Duration::from_secs(60),
            timeout: Some(Duration::from_secs(30 * 60)),
        }
    }
}

impl PollPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: Duration::from_secs(config.poll_interval_seconds),
            backoff_factor: config.poll_backoff_factor,
            max_interval: Duration::from_secs(config.poll_max_interval_seconds),
            timeout: match config.poll_timeout_seconds {
                0 => None,
                seconds => Some(Duration::from_secs(seconds)),
            },
        }
    }

    /// Clamps the policy so waits never spin and deadlines never overflow
    /// the clock.
    pub fn bounded(self) -> Self {
        let min_interval = Duration::from_secs(MIN_POLL_INTERVAL_SECONDS);
        let max_interval = Duration::from_secs(MAX_POLL_INTERVAL_SECONDS);
        let interval = self.interval.clamp(min_interval, max_interval);
        Self {
            interval,
            backoff_factor: if self.backoff_factor.is_finite() && self.backoff_factor >= 1.0 {
                self.backoff_factor
            } else {
                1.0
            },
            max_interval: self.max_interval.clamp(interval, max_interval),
            timeout: self
                .timeout
                .map(|timeout| timeout.min(Duration::from_secs(MAX_POLL_TIMEOUT_SECONDS))),
        }
    }

    pub fn next_interval(&self, current: Duration) -> Duration {
        let cap = self.max_interval.max(self.interval);
        if self.backoff_factor <= 1.0 {
            return current.min(cap);
        }
        Duration::try_from_secs_f64(current.as_secs_f64() * self.backoff_factor)
            .map_or(cap, |next| next.min(cap))
    }
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Service(#[from] PainterError),
    #[error("no result after {attempts} polls")]
    TimedOut { attempts: u32 },
    #[error("polling cancelled after {attempts} polls")]
    Cancelled { attempts: u32 },
}

/// Drives `get_task_result` for one task according to a `PollPolicy`.
pub struct TaskPoller<'a, A: PainterApi + ?Sized> {
    api: &'a A,
    base_url: &'a str,
    task: &'a TaskHandle,
    policy: PollPolicy,
    cancel: &'a CancellationToken,
    deadline: Option<Instant>,
    interval: Duration,
    attempts: u32,
}

impl<'a, A: PainterApi + ?Sized> TaskPoller<'a, A> {
    pub fn new(
        api: &'a A,
        base_url: &'a str,
        task: &'a TaskHandle,
        policy: PollPolicy,
        cancel: &'a CancellationToken,
    ) -> Self {
        let policy = policy.bounded();
        Self {
            api,
            base_url,
            task,
            policy,
            cancel,
            deadline: policy.timeout.map(|timeout| Instant::now() + timeout),
            interval: policy.interval,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Waits out the current interval, then asks the service once.
    ///
    /// A transport or decoding failure ends polling; there is no retry.
    pub async fn next_status(&mut self) -> Result<TaskResult, PollError> {
        let mut wake_at = Instant::now() + self.interval;
        if let Some(deadline) = self.deadline {
            wake_at = wake_at.min(deadline);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(PollError::Cancelled { attempts: self.attempts });
            }
            _ = sleep_until(wake_at) => {}
        }

        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(PollError::TimedOut {
                attempts: self.attempts,
            });
        }

        self.attempts += 1;
        let status = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(PollError::Cancelled { attempts: self.attempts });
            }
            status = self.api.get_task_result(self.base_url, self.task) => status?,
        };

        if !status.is_terminal() {
            self.interval = self.policy.next_interval(self.interval);
        }
        Ok(status)
    }
}
