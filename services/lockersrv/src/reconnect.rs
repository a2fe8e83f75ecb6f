//! Reconnect policy
//!
//! The controller is expected to always come back eventually, so the default
//! policy retries every 2 seconds forever without growth. Bounded exponential
//! backoff with optional jitter is available for links where hammering the
//! endpoint is undesirable.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Fixed delay between reconnect attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(2000);

/// Jitter spread applied around the computed delay
const JITTER_FACTOR: f64 = 0.25;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconnectError {
    /// Policy attempt limit reached for this outage
    #[error("Gave up after {0} reconnect attempts")]
    MaxAttemptsExceeded(u32),

    #[error("Reconnect attempt failed: {0}")]
    ConnectionFailed(String),
}

/// When and how often the session retries after losing the controller
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// 0 retries forever
    pub max_attempts: u32,
    /// Wait before the first attempt of an outage
    pub initial_delay: Duration,
    /// Upper bound once backoff grows the delay
    pub max_delay: Duration,
    /// 1.0 keeps every delay equal to `initial_delay`
    pub backoff_multiplier: f64,
    /// Spread each delay by ±25%
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_DELAY)
    }
}

impl ReconnectPolicy {
    /// Same delay before every attempt, unlimited attempts
    pub fn fixed(delay: Duration) -> Self {
        Self {
            max_attempts: 0,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay growing by `multiplier` per attempt up to `max_delay`, unlimited attempts
    pub fn exponential(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: 0,
            initial_delay,
            max_delay,
            backoff_multiplier: multiplier,
            jitter: false,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_attempts == 0
    }

    /// Delay before attempt number `attempt` (0-based) of an outage, without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let grown = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !grown.is_finite() || grown >= self.max_delay.as_secs_f64() {
            return self.max_delay.max(self.initial_delay);
        }
        Duration::from_secs_f64(grown)
    }
}

/// Drives the attempts of one outage according to a [`ReconnectPolicy`]
#[derive(Debug)]
pub struct ReconnectHelper {
    policy: ReconnectPolicy,
    /// Attempts made since the link was last up
    current_attempt: u32,
}

impl ReconnectHelper {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            current_attempt: 0,
        }
    }

    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    /// Start counting a new outage
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Delay to wait before the next attempt
    pub fn calculate_next_delay(&self) -> Duration {
        let delay = self.policy.delay_for(self.current_attempt);
        if !self.policy.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(1.0 - JITTER_FACTOR..=1.0 + JITTER_FACTOR);
        delay.mul_f64(factor)
    }

    /// Sleep for the policy delay, then run `attempt` once
    ///
    /// The attempt counter resets when `attempt` succeeds.
    pub async fn execute_reconnect<F, Fut, E>(
        &mut self,
        mut attempt: F,
    ) -> Result<(), ReconnectError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        if !self.policy.is_unlimited() && self.current_attempt >= self.policy.max_attempts {
            warn!(
                "Reconnect limit of {} attempts reached",
                self.policy.max_attempts
            );
            return Err(ReconnectError::MaxAttemptsExceeded(self.current_attempt));
        }

        let delay = self.calculate_next_delay();
        self.current_attempt += 1;
        debug!("Reconnect attempt {} in {:?}", self.current_attempt, delay);
        tokio::time::sleep(delay).await;

        match attempt().await {
            Ok(()) => {
                info!(
                    "Controller link restored after {} attempt(s)",
                    self.current_attempt
                );
                self.reset();
                Ok(())
            },
            Err(e) => {
                warn!("Reconnect attempt {} failed: {}", self.current_attempt, e);
                Err(ReconnectError::ConnectionFailed(e.to_string()))
            },
        }
    }
}
