// Copyright 2026 refetch Project Authors
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

use std::time::Duration;

use refetch_common::error::{Error, Result};

use crate::key::KeyFilter;

/// Retry policy of a fetch or mutation.
///
/// The count is the total number of attempts, including the first one. `Attempts(3)` runs the function at most three
/// times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Run once, never retry.
    Never,
    /// Run at most the given count of attempts.
    Attempts(u32),
}

impl Default for Retry {
    fn default() -> Self {
        Self::Attempts(3)
    }
}

impl From<u32> for Retry {
    fn from(attempts: u32) -> Self {
        Self::Attempts(attempts)
    }
}

/// `true` retries until success, `false` never retries.
impl From<bool> for Retry {
    fn from(retry: bool) -> Self {
        match retry {
            true => Self::Attempts(u32::MAX),
            false => Self::Never,
        }
    }
}

impl Retry {
    /// Total count of attempts allowed.
    pub fn attempts(&self) -> u32 {
        match self {
            Retry::Never => 1,
            Retry::Attempts(n) => *n,
        }
    }
}

/// Exponential backoff between attempts: `base * 2^(failures - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDelay {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound of any delay.
    pub max: Duration,
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl RetryDelay {
    /// Create a backoff with the given base and cap.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }

    fn validate(&self) -> Result<()> {
        if self.base > self.max {
            return Err(Error::config(
                "retry_delay",
                format!("base {:?} is greater than max {:?}", self.base, self.max),
            ));
        }
        Ok(())
    }
}

fn validate_retry(retry: &Retry) -> Result<()> {
    if let Retry::Attempts(0) = retry {
        return Err(Error::config("retry", "at least one attempt is required"));
    }
    Ok(())
}

fn validate_timeout(timeout: &Option<Duration>) -> Result<()> {
    if *timeout == Some(Duration::ZERO) {
        return Err(Error::config("timeout", "timeout must be greater than zero"));
    }
    Ok(())
}

/// Per-query options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    /// How long data stays fresh after a successful fetch. `Duration::MAX` means never stale.
    pub stale_time: Duration,
    /// How long an entry without subscribers is retained before eviction.
    pub cache_time: Duration,
    /// Retry policy.
    pub retry: Retry,
    /// Backoff between attempts.
    pub retry_delay: RetryDelay,
    /// Serve the previous key's data while the new key has none.
    pub keep_previous_data: bool,
    /// Automatic fetches are suppressed when disabled. Explicit refetches still run.
    pub enabled: bool,
    /// Per-attempt timeout. A timeout is a retryable failure.
    pub timeout: Option<Duration>,
    /// Refetch stale data when an observer attaches.
    pub refetch_on_mount: bool,
    /// Refetch stale data when the window regains focus.
    pub refetch_on_window_focus: bool,
    /// Refetch periodically while observed.
    pub refetch_interval: Option<Duration>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            cache_time: Duration::from_secs(5 * 60),
            retry: Retry::default(),
            retry_delay: RetryDelay::default(),
            keep_previous_data: false,
            enabled: true,
            timeout: None,
            refetch_on_mount: true,
            refetch_on_window_focus: true,
            refetch_interval: None,
        }
    }
}

impl QueryOptions {
    /// Set the stale time.
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    /// Set the retention window of unobserved entries.
    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: impl Into<Retry>) -> Self {
        self.retry = retry.into();
        self
    }

    /// Set the backoff between attempts.
    pub fn with_retry_delay(mut self, base: Duration, max: Duration) -> Self {
        self.retry_delay = RetryDelay::new(base, max);
        self
    }

    /// Serve the previous key's data while the new key has none.
    pub fn with_keep_previous_data(mut self, keep_previous_data: bool) -> Self {
        self.keep_previous_data = keep_previous_data;
        self
    }

    /// Enable or disable automatic fetches.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Refetch stale data on observer creation.
    pub fn with_refetch_on_mount(mut self, refetch_on_mount: bool) -> Self {
        self.refetch_on_mount = refetch_on_mount;
        self
    }

    /// Refetch stale data on window focus.
    pub fn with_refetch_on_window_focus(mut self, refetch_on_window_focus: bool) -> Self {
        self.refetch_on_window_focus = refetch_on_window_focus;
        self
    }

    /// Refetch periodically while observed.
    pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    /// Check the options for values the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        validate_retry(&self.retry)?;
        self.retry_delay.validate()?;
        validate_timeout(&self.timeout)?;
        if self.refetch_interval == Some(Duration::ZERO) {
            return Err(Error::config("refetch_interval", "interval must be greater than zero"));
        }
        Ok(())
    }
}

/// Options of a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOptions {
    /// Retry policy. Mutations are not retried by default.
    pub retry: Retry,
    /// Backoff between attempts.
    pub retry_delay: RetryDelay,
    /// Per-attempt timeout.
    pub timeout: Option<Duration>,
    /// Entries invalidated after a successful mutation.
    pub invalidates: Vec<KeyFilter>,
}

impl Default for MutationOptions {
    fn default() -> Self {
        Self {
            retry: Retry::Never,
            retry_delay: RetryDelay::default(),
            timeout: None,
            invalidates: vec![],
        }
    }
}

impl MutationOptions {
    /// Set the retry policy.
    pub fn with_retry(mut self, retry: impl Into<Retry>) -> Self {
        self.retry = retry.into();
        self
    }

    /// Set the backoff between attempts.
    pub fn with_retry_delay(mut self, base: Duration, max: Duration) -> Self {
        self.retry_delay = RetryDelay::new(base, max);
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Invalidate the entries selected by the filter after each successful mutation.
    pub fn with_invalidates(mut self, filter: impl Into<KeyFilter>) -> Self {
        self.invalidates.push(filter.into());
        self
    }

    /// Check the options for values the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        validate_retry(&self.retry)?;
        self.retry_delay.validate()?;
        validate_timeout(&self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use refetch_common::error::ErrorKind;

    use super::*;

    #[test]
    fn test_defaults() {
        let options = QueryOptions::default();
        assert_eq!(options.stale_time, Duration::ZERO);
        assert_eq!(options.cache_time, Duration::from_secs(300));
        assert_eq!(options.retry.attempts(), 3);
        assert!(!options.keep_previous_data);
        assert!(options.enabled);
        assert!(options.refetch_on_mount);
        assert!(options.refetch_on_window_focus);
        assert!(options.validate().is_ok());

        assert_eq!(MutationOptions::default().retry.attempts(), 1);
    }

    #[test]
    fn test_backoff() {
        let delay = RetryDelay::default();
        let delays = (1..=7).map(|failures| delay.delay(failures).as_secs()).collect::<Vec<_>>();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(delay.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_conversions() {
        assert_eq!(Retry::from(false).attempts(), 1);
        assert_eq!(Retry::from(true).attempts(), u32::MAX);
        assert_eq!(Retry::from(5).attempts(), 5);
    }

    #[test]
    fn test_validate() {
        let cases = [
            QueryOptions::default().with_retry(0),
            QueryOptions::default().with_retry_delay(Duration::from_secs(10), Duration::from_secs(1)),
            QueryOptions::default().with_timeout(Duration::ZERO),
            QueryOptions::default().with_refetch_interval(Duration::ZERO),
        ];
        for options in cases {
            assert_eq!(options.validate().unwrap_err().kind(), ErrorKind::Config, "{options:?}");
        }

        let err = MutationOptions::default().with_retry(0).validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
