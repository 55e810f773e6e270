// Copyright 2024-2025 Weft Compute
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

use crate::SafeDisplay;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::fmt::Write;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Relative jitter applied to each delay; 0.2 means +/-20%.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// A single immediate retry, for hot paths that must not stall.
    pub fn one_shot() -> Self {
        Self {
            max_attempts: 1,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Delay before the given attempt (first attempt is 1; no delay).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2) as i32;
        let base = self.min_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
            capped * factor
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

impl SafeDisplay for RetryConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "max attempts: {}", self.max_attempts);
        let _ = writeln!(&mut result, "min delay: {}ms", self.min_delay.as_millis());
        let _ = writeln!(&mut result, "max delay: {}ms", self.max_delay.as_millis());
        let _ = writeln!(&mut result, "multiplier: {}", self.multiplier);
        let _ = writeln!(&mut result, "jitter: {}", self.jitter);
        result
    }
}

/// Runs `action` until it succeeds, a non-retriable error is hit, or the
/// attempt budget is exhausted. The last error is returned as-is.
pub async fn with_retries<In, F, G, T, E>(
    target_label: &'static str,
    op_label: &'static str,
    op_id: Option<String>,
    config: &RetryConfig,
    i: &In,
    action: F,
    is_retriable: G,
) -> Result<T, E>
where
    F: for<'a> Fn(&'a In) -> Pin<Box<dyn Future<Output = Result<T, E>> + 'a + Send>>,
    G: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 1;
    loop {
        let delay = config.delay_before(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match action(i).await {
            Ok(result) => {
                if attempt > 1 {
                    info!(
                        target_label,
                        op = op_label,
                        id = op_id.as_deref().unwrap_or(""),
                        attempt,
                        "succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(error) if attempt < config.max_attempts && is_retriable(&error) => {
                warn!(
                    target_label,
                    op = op_label,
                    id = op_id.as_deref().unwrap_or(""),
                    attempt,
                    error = %error,
                    "retrying after error"
                );
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn immediate_retries(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    #[test]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_retries(
            "test",
            "first-success",
            None,
            &immediate_retries(3),
            &calls,
            |calls| {
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    async fn retries_until_budget_is_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_retries(
            "test",
            "exhaust",
            None,
            &immediate_retries(3),
            &calls,
            |calls| {
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("boom".to_string())
                })
            },
            |_| true,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    async fn non_retriable_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_retries(
            "test",
            "fatal",
            None,
            &immediate_retries(5),
            &calls,
            |calls| {
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("fatal".to_string())
                })
            },
            |_| false,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delays_grow_exponentially_up_to_the_cap() {
        let config = RetryConfig {
            max_attempts: 10,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(config.delay_before(1), Duration::ZERO);
        assert_eq!(config.delay_before(2), Duration::from_secs(1));
        assert_eq!(config.delay_before(3), Duration::from_secs(2));
        assert_eq!(config.delay_before(4), Duration::from_secs(4));
        assert_eq!(config.delay_before(5), Duration::from_secs(4));
    }
}
