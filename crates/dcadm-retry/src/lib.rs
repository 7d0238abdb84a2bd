//! Bounded polling for remote state.
//!
//! Every long wait in dcadm is a loop of short requests: workflow jobs,
//! instance health, image import, DNS visibility. The [`Poller`] owns the
//! three knobs those loops share (poll period, iteration cap, and a budget
//! of consecutive transport errors) and turns exhaustion into a typed
//! error instead of a flat counter scattered through call sites.

use std::time::Duration;

use thiserror::Error;

/// One observation of the polled resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The awaited condition holds; stop polling.
    Ready(T),
    /// Not there yet; sleep one period and look again.
    Pending,
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("timed out waiting for {what} after {attempts} attempts")]
    Timeout {
        what: String,
        attempts: u32,
        period: Duration,
    },

    #[error("giving up on {what} after {consecutive} consecutive errors: {last_error}")]
    ErrorBudgetExhausted {
        what: String,
        consecutive: u32,
        last_error: String,
    },
}

/// A fixed-period poll loop with an iteration cap and an error budget.
#[derive(Debug, Clone)]
pub struct Poller {
    pub period: Duration,
    pub cap: u32,
    pub error_budget: u32,
    /// Jitter factor applied to each sleep; 0.0 disables it. A factor of
    /// 0.5 means each period is scaled by a random value in [0.5, 1.5].
    pub jitter: f64,
}

impl Poller {
    pub fn new(period: Duration, cap: u32) -> Self {
        Self {
            period,
            cap,
            error_budget: 5,
            jitter: 0.0,
        }
    }

    /// The parameters shared by job and health polls: 5-second period,
    /// 720 iterations (~1 h), five consecutive transport errors allowed.
    pub fn hourly() -> Self {
        Self::new(Duration::from_secs(5), 720)
    }

    pub fn with_error_budget(mut self, budget: u32) -> Self {
        self.error_budget = budget;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Run `f` until it reports ready, the cap is reached, or the error
    /// budget is exhausted. A successful observation (ready or pending)
    /// resets the consecutive-error count.
    pub fn run<T, F>(&self, what: &str, mut f: F) -> Result<T, PollError>
    where
        F: FnMut() -> anyhow::Result<PollOutcome<T>>,
    {
        let mut consecutive_errors: u32 = 0;
        let mut last_error = String::new();

        for attempt in 1..=self.cap {
            match f() {
                Ok(PollOutcome::Ready(value)) => return Ok(value),
                Ok(PollOutcome::Pending) => {
                    consecutive_errors = 0;
                }
                Err(err) => {
                    consecutive_errors += 1;
                    last_error = format!("{err:#}");
                    if consecutive_errors >= self.error_budget {
                        return Err(PollError::ErrorBudgetExhausted {
                            what: what.to_string(),
                            consecutive: consecutive_errors,
                            last_error,
                        });
                    }
                }
            }

            if attempt < self.cap {
                std::thread::sleep(self.sleep_period());
            }
        }

        Err(PollError::Timeout {
            what: what.to_string(),
            attempts: self.cap,
            period: self.period,
        })
    }

    fn sleep_period(&self) -> Duration {
        if self.jitter <= 0.0 {
            return self.period;
        }
        let factor = 1.0 - self.jitter + (rand::random::<f64>() * 2.0 * self.jitter);
        let millis = (self.period.as_millis() as f64 * factor).round() as u64;
        Duration::from_millis(millis)
    }
}
