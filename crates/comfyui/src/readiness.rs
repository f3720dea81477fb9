//! Readiness probing of the ComfyUI HTTP server.
//!
//! [`wait_until_ready`] polls `GET /` until the engine answers `200` or
//! the [`ProbePolicy`] budget runs out. Timeouts, connection errors and
//! non-200 answers are all treated as "not yet".

use std::time::Duration;

use crate::api::ComfyUIApi;

/// How long to keep polling and how to space the attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbePolicy {
    /// A fixed number of attempts separated by a constant interval.
    Fixed {
        max_attempts: u32,
        interval: Duration,
    },
    /// Growing delays until a total wait budget is spent.
    Backoff(BackoffConfig),
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self::Fixed {
            max_attempts: 500,
            interval: Duration::from_millis(50),
        }
    }
}

/// Tunable parameters for the backoff strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Total time budget across all attempts.
    pub max_wait: Duration,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(30),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(3),
            multiplier: 1.5,
        }
    }
}

impl BackoffConfig {
    /// Sleeps between failed probes: `initial_delay`, then each one
    /// `multiplier` times the last, never above `max_delay`.
    ///
    /// The sequence is endless; [`wait_until_ready`] stops drawing from it
    /// once the next sleep would overrun `max_wait`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::successors(Some(self.initial_delay.min(self.max_delay)), move |prev| {
            let grown = (prev.as_nanos() as f64 * self.multiplier).round() as u64;
            Some(Duration::from_nanos(grown).min(self.max_delay))
        })
    }
}

/// Result of a single reachability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reachability {
    /// The server answered `200`.
    Reachable,
    /// No answer, or an answer other than `200`.
    Unreachable(String),
}

/// Errors from [`wait_until_ready`].
#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error("ComfyUI server at {url} not reachable after {attempts} attempts")]
    EngineUnreachable { url: String, attempts: u32 },
}

/// Issue one `GET /` and classify the outcome.
pub async fn probe_once(api: &ComfyUIApi) -> Reachability {
    match api.probe().await {
        Ok(status) if status == reqwest::StatusCode::OK => Reachability::Reachable,
        Ok(status) => Reachability::Unreachable(format!("status {}", status.as_u16())),
        Err(e) => Reachability::Unreachable(e.to_string()),
    }
}

/// Poll the engine until it answers `200`.
///
/// Returns the number of attempts it took.
pub async fn wait_until_ready(api: &ComfyUIApi, policy: &ProbePolicy) -> Result<u32, ReadinessError> {
    tracing::info!(url = %api.api_url(), "Checking ComfyUI API server");

    let started = tokio::time::Instant::now();
    let mut attempt = 0u32;
    let mut schedule = match policy {
        ProbePolicy::Backoff(config) => Some(config.delays()),
        ProbePolicy::Fixed { .. } => None,
    };

    loop {
        attempt += 1;
        match probe_once(api).await {
            Reachability::Reachable => {
                tracing::info!(attempt, "ComfyUI API is reachable");
                return Ok(attempt);
            }
            Reachability::Unreachable(reason) => {
                tracing::trace!(attempt, reason = %reason, "ComfyUI API not ready yet");
            }
        }

        let delay = match (policy, schedule.as_mut()) {
            (ProbePolicy::Backoff(config), Some(delays)) => {
                let delay = delays.next().unwrap_or(config.max_delay);
                if started.elapsed() + delay >= config.max_wait {
                    break;
                }
                delay
            }
            (ProbePolicy::Fixed { max_attempts, interval }, _) => {
                if attempt >= *max_attempts {
                    break;
                }
                *interval
            }
            (ProbePolicy::Backoff(_), None) => break,
        };

        tokio::time::sleep(delay).await;
    }

    tracing::error!(attempts = attempt, url = %api.api_url(), "ComfyUI API never became ready");
    Err(ReadinessError::EngineUnreachable {
        url: api.api_url().to_string(),
        attempts: attempt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_grows_by_half_up_to_three_seconds() {
        let delays: Vec<Duration> = BackoffConfig::default().delays().take(12).collect();

        assert_eq!(
            delays[..3],
            [
                Duration::from_millis(100),
                Duration::from_millis(150),
                Duration::from_millis(225),
            ]
        );
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(3)));
        assert_eq!(delays[9..], [Duration::from_secs(3); 3]);
    }

    #[test]
    fn initial_delay_above_cap_is_clamped() {
        let config = BackoffConfig {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(2),
            ..Default::default()
        };
        let delays: Vec<Duration> = config.delays().take(3).collect();
        assert_eq!(delays, [Duration::from_secs(2); 3]);
    }

    #[test]
    fn default_schedule_fits_in_wait_budget() {
        let config = BackoffConfig::default();
        let mut slept = Duration::ZERO;
        let sleeps = config
            .delays()
            .take_while(|d| {
                slept += *d;
                slept < config.max_wait
            })
            .count();
        // 9 growing sleeps (about 7.5 s), then 3 s steps up to 30 s.
        assert_eq!(sleeps, 16);
    }

    #[tokio::test]
    async fn unreachable_engine_exhausts_fixed_attempts() {
        // Nothing listens on port 9; every probe fails fast.
        let api = ComfyUIApi::new("http://127.0.0.1:9".into());
        let policy = ProbePolicy::Fixed {
            max_attempts: 3,
            interval: Duration::from_millis(1),
        };

        let err = wait_until_ready(&api, &policy).await.unwrap_err();
        match err {
            ReadinessError::EngineUnreachable { attempts, .. } => assert_eq!(attempts, 3),
        }
    }

    #[tokio::test]
    async fn backoff_policy_respects_total_budget() {
        let api = ComfyUIApi::new("http://127.0.0.1:9".into());
        let policy = ProbePolicy::Backoff(BackoffConfig {
            max_wait: Duration::from_millis(50),
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            multiplier: 1.5,
        });

        let started = std::time::Instant::now();
        assert!(wait_until_ready(&api, &policy).await.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
