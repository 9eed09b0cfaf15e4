//! The polling loop behind `eventually` and `consistently`

use std::time::Duration;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, warn};

use cellrig_core::config::{
    DEFAULT_CONSISTENTLY_DURATION, DEFAULT_EVENTUALLY_TIMEOUT, DEFAULT_POLL_INTERVAL,
};
use cellrig_core::{HarnessConfig, HarnessError, Result};

use crate::matcher::{not, Matcher, Verdict};
use crate::observe::Observe;

/// Poll `target` until a matcher accepts it
pub fn eventually<O: Observe>(target: O) -> Eventually<O> {
    Eventually {
        target,
        timeout: DEFAULT_EVENTUALLY_TIMEOUT,
        interval: DEFAULT_POLL_INTERVAL,
    }
}

/// Poll `target` and require every sample to match
pub fn consistently<O: Observe>(target: O) -> Consistently<O> {
    Consistently {
        target,
        duration: DEFAULT_CONSISTENTLY_DURATION,
        interval: DEFAULT_POLL_INTERVAL,
    }
}

/// A pending `eventually` assertion
pub struct Eventually<O> {
    target: O,
    timeout: Duration,
    interval: Duration,
}

impl<O: Observe> Eventually<O> {
    /// Take timeout and interval from the harness configuration
    pub fn with_config(mut self, config: &HarnessConfig) -> Self {
        self.timeout = config.eventually_timeout();
        self.interval = config.poll_interval();
        self
    }

    pub fn within(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn every(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Resolve with the first sample `matcher` accepts
    pub async fn should<M>(mut self, matcher: M) -> Result<O::Output>
    where
        M: Matcher<O::Output>,
    {
        let description = matcher.describe();
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut polls = 0u32;
        let mut last: Option<(String, String)> = None;

        loop {
            polls += 1;
            let observed = match timeout_at(deadline, self.target.observe()).await {
                Ok(Ok(observed)) => observed,
                Ok(Err(e)) => {
                    return Err(HarnessError::ObservationFailed {
                        reason: e.to_string(),
                        elapsed: started.elapsed(),
                    })
                }
                // The observation itself outlived the deadline
                Err(_) => break,
            };

            match matcher.evaluate(&observed.value) {
                Verdict::Match => {
                    debug!(expected = %description, polls, elapsed = ?started.elapsed(), "Eventually matched");
                    return Ok(observed.value);
                }
                Verdict::Closed(explanation) => {
                    return Err(HarnessError::DetectionClosed {
                        description,
                        last_value: format!("{:?}", observed.value),
                        explanation,
                        elapsed: started.elapsed(),
                    });
                }
                Verdict::Miss(explanation) => {
                    if let Some(reason) = observed.settled {
                        return Err(HarnessError::DetectionClosed {
                            description,
                            last_value: format!("{:?}", observed.value),
                            explanation: format!("{} ({})", explanation, reason),
                            elapsed: started.elapsed(),
                        });
                    }
                    last = Some((format!("{:?}", observed.value), explanation));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep_until((now + self.interval).min(deadline)).await;
        }

        let (last_value, explanation) =
            last.unwrap_or_else(|| ("<none>".to_string(), "no sample completed in time".to_string()));
        warn!(expected = %description, polls, last = %last_value, "Eventually timed out");
        Err(HarnessError::AssertionTimeout {
            description,
            last_value,
            explanation,
            elapsed: started.elapsed(),
        })
    }

    /// Resolve with the first sample `matcher` rejects
    pub async fn should_not<M>(self, matcher: M) -> Result<O::Output>
    where
        M: Matcher<O::Output>,
    {
        self.should(not(matcher)).await
    }
}

/// A pending `consistently` assertion
pub struct Consistently<O> {
    target: O,
    duration: Duration,
    interval: Duration,
}

impl<O: Observe> Consistently<O> {
    /// Take duration and interval from the harness configuration
    pub fn with_config(mut self, config: &HarnessConfig) -> Self {
        self.duration = config.consistently_duration();
        self.interval = config.poll_interval();
        self
    }

    pub fn during(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn every(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Succeed if every sample over the whole duration matches
    pub async fn should<M>(mut self, matcher: M) -> Result<()>
    where
        M: Matcher<O::Output>,
    {
        let description = matcher.describe();
        let started = Instant::now();
        let end = started + self.duration;
        let mut samples = 0u32;

        loop {
            let observed = match timeout_at(end, self.target.observe()).await {
                Ok(Ok(observed)) => observed,
                Ok(Err(e)) => {
                    return Err(HarnessError::ObservationFailed {
                        reason: e.to_string(),
                        elapsed: started.elapsed(),
                    })
                }
                Err(_) => break,
            };

            match matcher.evaluate(&observed.value) {
                Verdict::Match => samples += 1,
                Verdict::Miss(explanation) | Verdict::Closed(explanation) => {
                    warn!(expected = %description, samples, "Consistently violated");
                    return Err(HarnessError::AssertionViolation {
                        description,
                        value: format!("{:?}", observed.value),
                        explanation,
                        elapsed: started.elapsed(),
                    });
                }
            }

            let now = Instant::now();
            if now >= end {
                break;
            }
            sleep_until((now + self.interval).min(end)).await;
        }

        if samples == 0 {
            return Err(HarnessError::ObservationFailed {
                reason: format!("no sample completed within {:?}", self.duration),
                elapsed: started.elapsed(),
            });
        }
        debug!(expected = %description, samples, "Consistently held");
        Ok(())
    }

    /// Succeed if no sample over the whole duration matches
    pub async fn should_not<M>(self, matcher: M) -> Result<()>
    where
        M: Matcher<O::Output>,
    {
        self.should(not(matcher)).await
    }
}
