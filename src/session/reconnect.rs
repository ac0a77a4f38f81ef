//! Reconnection backoff policy
//!
//! Pure decision logic: given how many attempts have already failed, decide
//! whether to try again and how long to wait first. The session owns the
//! clock and the sleeping.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Delay of the default fixed strategy
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;

/// Keys that only make sense with an explicit `strategy`
const STRATEGY_SPECIFIC_KEYS: [&str; 4] = ["pattern_ms", "initial_ms", "max_ms", "multiplier"];

/// Delay schedule between reconnection attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay before every attempt
    Fixed { delay_ms: u64 },
    /// Walk through `pattern_ms`, then stay on its last entry
    Pattern { pattern_ms: Vec<u64> },
    /// `initial_ms * multiplier^(attempt - 1)`, capped at `max_ms`
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Fixed {
            delay_ms: DEFAULT_RECONNECT_DELAY_MS,
        }
    }
}

impl BackoffStrategy {
    /// Delay before the given attempt (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffStrategy::Pattern { pattern_ms } => {
                let index = attempt.saturating_sub(1) as usize;
                let delay = pattern_ms
                    .get(index)
                    .or_else(|| pattern_ms.last())
                    .copied()
                    .unwrap_or(0);
                Duration::from_millis(delay)
            }
            BackoffStrategy::Exponential {
                initial_ms,
                max_ms,
                multiplier,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let delay = (*initial_ms as f64) * multiplier.powi(exponent);
                if !delay.is_finite() || delay >= *max_ms as f64 {
                    Duration::from_millis(*max_ms)
                } else {
                    Duration::from_millis(delay as u64)
                }
            }
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            BackoffStrategy::Fixed { .. } => Ok(()),
            BackoffStrategy::Pattern { pattern_ms } if pattern_ms.is_empty() => {
                Err("pattern_ms must contain at least one delay".to_string())
            }
            BackoffStrategy::Pattern { .. } => Ok(()),
            BackoffStrategy::Exponential {
                initial_ms,
                max_ms,
                multiplier,
            } => {
                if !multiplier.is_finite() || *multiplier < 1.0 {
                    return Err("multiplier must be a finite number >= 1.0".to_string());
                }
                if initial_ms > max_ms {
                    return Err("initial_ms must not exceed max_ms".to_string());
                }
                Ok(())
            }
        }
    }
}

/// Backoff schedule plus an optional cap on attempts per outage.
///
/// Without a `strategy` key the policy is a fixed delay, so a table holding
/// only `max_attempts` (or `delay_ms`) is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(try_from = "Map<String, Value>")]
pub struct ReconnectPolicy {
    #[serde(flatten)]
    pub backoff: BackoffStrategy,
    /// Maximum attempts per outage (None = unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

#[derive(Deserialize)]
struct TaggedPolicy {
    #[serde(flatten)]
    backoff: BackoffStrategy,
    #[serde(default)]
    max_attempts: Option<u32>,
}

impl TryFrom<Map<String, Value>> for ReconnectPolicy {
    type Error = String;

    fn try_from(mut table: Map<String, Value>) -> Result<Self, Self::Error> {
        if !table.contains_key("strategy") {
            if let Some(key) = STRATEGY_SPECIFIC_KEYS.iter().find(|key| table.contains_key(**key)) {
                return Err(format!("`{key}` requires an explicit `strategy`"));
            }
            table.insert("strategy".to_string(), Value::from("fixed"));
            table
                .entry("delay_ms")
                .or_insert_with(|| Value::from(DEFAULT_RECONNECT_DELAY_MS));
        }

        let TaggedPolicy {
            backoff,
            max_attempts,
        } = serde_json::from_value(Value::Object(table)).map_err(|e| e.to_string())?;
        Ok(Self {
            backoff,
            max_attempts,
        })
    }
}

/// Outcome of asking the policy whether to try again
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectDecision {
    Proceed { attempt: u32, delay: Duration },
    AbortMaxAttemptsExceeded,
}

impl ReconnectPolicy {
    /// Policy that retries immediately, forever
    pub fn immediate() -> Self {
        Self {
            backoff: BackoffStrategy::Fixed { delay_ms: 0 },
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Decide on the next attempt after `failed_attempts` failures
    pub fn decide(&self, failed_attempts: u32) -> ReconnectDecision {
        if let Some(max_attempts) = self.max_attempts {
            if failed_attempts >= max_attempts {
                return ReconnectDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = failed_attempts.saturating_add(1);
        ReconnectDecision::Proceed {
            attempt,
            delay: self.backoff.delay_for_attempt(attempt),
        }
    }

    /// Total backoff time across all attempts, None when unlimited
    pub fn max_total_delay(&self) -> Option<Duration> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.backoff.delay_for_attempt(attempt))
                .sum()
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or unset for unlimited".to_string());
        }
        self.backoff.validate()
    }
}
