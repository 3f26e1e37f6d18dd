//! Reconnection backoff with jitter

use rand::Rng;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    #[serde(with = "millis")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "millis")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Upper bound of the random extra delay, as a fraction of the backoff
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl ReconnectConfig {
    /// Reject values the backoff cannot work with
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_backoff.is_zero() {
            return Err("reconnect initial backoff must be greater than zero".to_string());
        }
        if self.initial_backoff > self.max_backoff {
            return Err(format!(
                "reconnect initial backoff ({}ms) exceeds max backoff ({}ms)",
                self.initial_backoff.as_millis(),
                self.max_backoff.as_millis()
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!(
                "reconnect multiplier must be a finite number >= 1.0, got {}",
                self.multiplier
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(format!(
                "reconnect jitter must be between 0.0 and 1.0, got {}",
                self.jitter
            ));
        }
        Ok(())
    }
}

/// Exponential backoff state
///
/// Each delay is the current backoff plus up to `jitter` of it, so agents
/// that lost the broker together do not all come back at the same instant.
#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Delay before the next attempt; advances the backoff
    ///
    /// Out-of-range multiplier or jitter values are treated as 1.0 and 0.0,
    /// and every delay is capped at `max_backoff`.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;

        let max = self.config.max_backoff;
        let jitter = if self.config.jitter.is_nan() {
            0.0
        } else {
            self.config.jitter.clamp(0.0, 1.0)
        };
        let delay = if jitter > 0.0 {
            let extra = rand::thread_rng().gen_range(0.0..=jitter);
            scale(self.current_backoff, 1.0 + extra, max)
        } else {
            self.current_backoff
        };

        debug!(
            "Reconnect attempt {} in {}ms",
            self.attempt,
            delay.as_millis()
        );

        // Increase backoff
        let multiplier = if self.config.multiplier.is_finite() && self.config.multiplier >= 1.0 {
            self.config.multiplier
        } else {
            1.0
        };
        self.current_backoff = scale(self.current_backoff, multiplier, max).min(max);

        delay
    }

    /// Reset backoff (call after successful connection)
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}

/// `duration * factor`, saturating at `ceiling` instead of panicking
fn scale(duration: Duration, factor: f64, ceiling: Duration) -> Duration {
    Duration::try_from_secs_f64(duration.as_secs_f64() * factor).unwrap_or(ceiling.max(duration))
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: f64) -> ReconnectConfig {
        ReconnectConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_reconnect_backoff() {
        let mut backoff = Backoff::new(config(0.0));

        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
        assert_eq!(backoff.next_delay(), Duration::from_millis(80));
        // Should cap at max_backoff
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        for _ in 0..100 {
            let mut backoff = Backoff::new(config(0.2));
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(10));
            assert!(delay <= Duration::from_micros(12_001));
        }
    }

    #[test]
    fn test_reconnect_reset() {
        let mut backoff = Backoff::new(config(0.0));

        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();

        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.current_backoff(), Duration::from_millis(10));
    }

    #[test]
    fn test_out_of_range_values_do_not_panic() {
        for (multiplier, jitter) in [
            (-1.0, 0.0),
            (f64::NAN, 0.0),
            (1e308, 0.0),
            (f64::INFINITY, 0.5),
            (2.0, f64::NAN),
            (2.0, -3.0),
            (2.0, 50.0),
        ] {
            let mut backoff = Backoff::new(ReconnectConfig {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(100),
                multiplier,
                jitter,
            });
            for _ in 0..5 {
                assert!(backoff.next_delay() <= Duration::from_millis(200));
            }
            assert!(backoff.current_backoff() <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_huge_max_backoff_saturates() {
        let mut backoff = Backoff::new(ReconnectConfig {
            initial_backoff: Duration::from_secs(u64::MAX / 2),
            max_backoff: Duration::MAX,
            multiplier: 4.0,
            jitter: 1.0,
        });
        backoff.next_delay();
        backoff.next_delay();
    }

    #[test]
    fn test_validate() {
        assert!(ReconnectConfig::default().validate().is_ok());
        assert!(config(1.0).validate().is_ok());

        let rejected = [
            ReconnectConfig { multiplier: -1.0, ..config(0.0) },
            ReconnectConfig { multiplier: 0.5, ..config(0.0) },
            ReconnectConfig { multiplier: f64::NAN, ..config(0.0) },
            ReconnectConfig { multiplier: f64::INFINITY, ..config(0.0) },
            config(f64::NAN),
            config(-0.1),
            config(1.5),
            ReconnectConfig { initial_backoff: Duration::ZERO, ..config(0.0) },
            ReconnectConfig { initial_backoff: Duration::from_secs(1), ..config(0.0) },
        ];
        for bad in rejected {
            assert!(bad.validate().is_err(), "{:?} should be rejected", bad);
        }
    }
}
