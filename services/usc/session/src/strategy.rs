//! Retry policies for the reconnection engine.

use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Decides connect timeouts and whether and when to retry
pub trait ReconnectStrategy: Send + Sync {
    /// Time allowed for one connect attempt
    fn connect_timeout(&self) -> Duration;

    /// Delay before the next attempt after `cause`, or `None` to give up
    fn schedule_reconnect(&self, cause: &io::Error) -> Option<Duration>;

    /// A connect attempt succeeded; reset any backoff state
    fn reconnect_successful(&self);
}

/// Backoff settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Time allowed for one connect attempt
    pub connect_timeout: Duration,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on the delay
    pub max_backoff: Duration,
    /// Retries after the first attempt; `None` retries forever
    pub max_retries: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

#[derive(Debug)]
struct BackoffState {
    next_delay: Duration,
    retries: u32,
}

/// Doubling backoff with an optional retry limit
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    state: Mutex<BackoffState>,
}

impl ExponentialBackoff {
    /// Create a strategy from its settings
    pub fn new(config: BackoffConfig) -> Self {
        let next_delay = config.initial_backoff;
        Self {
            config,
            state: Mutex::new(BackoffState {
                next_delay,
                retries: 0,
            }),
        }
    }

    /// Retries scheduled since the last success
    pub fn retries(&self) -> u32 {
        self.lock().retries
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BackoffState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl ReconnectStrategy for ExponentialBackoff {
    fn connect_timeout(&self) -> Duration {
        self.config.connect_timeout
    }

    fn schedule_reconnect(&self, cause: &io::Error) -> Option<Duration> {
        let mut state = self.lock();
        if let Some(max) = self.config.max_retries {
            if state.retries >= max {
                debug!("Giving up after {} retries: {}", state.retries, cause);
                return None;
            }
        }

        let delay = state.next_delay;
        state.retries += 1;
        state.next_delay = (delay * 2).min(self.config.max_backoff);
        Some(delay)
    }

    fn reconnect_successful(&self) {
        let mut state = self.lock();
        state.retries = 0;
        state.next_delay = self.config.initial_backoff;
    }
}

/// Single attempt, never retries
#[derive(Debug, Clone)]
pub struct NoRetry {
    connect_timeout: Duration,
}

impl NoRetry {
    /// Create a single-attempt strategy
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl ReconnectStrategy for NoRetry {
    fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    fn schedule_reconnect(&self, _cause: &io::Error) -> Option<Duration> {
        None
    }

    fn reconnect_successful(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refused() -> io::Error {
        io::Error::from(io::ErrorKind::ConnectionRefused)
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let strategy = ExponentialBackoff::default();
        let delays: Vec<u64> = (0..7)
            .map(|_| strategy.schedule_reconnect(&refused()).unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_retry_limit_and_reset() {
        let strategy = ExponentialBackoff::new(BackoffConfig {
            max_retries: Some(2),
            ..BackoffConfig::default()
        });
        assert!(strategy.schedule_reconnect(&refused()).is_some());
        assert!(strategy.schedule_reconnect(&refused()).is_some());
        assert!(strategy.schedule_reconnect(&refused()).is_none());
        assert_eq!(strategy.retries(), 2);

        strategy.reconnect_successful();
        assert_eq!(strategy.retries(), 0);
        assert_eq!(
            strategy.schedule_reconnect(&refused()),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_no_retry() {
        let strategy = NoRetry::new(Duration::from_secs(3));
        assert_eq!(strategy.connect_timeout(), Duration::from_secs(3));
        assert!(strategy.schedule_reconnect(&refused()).is_none());
    }
}
