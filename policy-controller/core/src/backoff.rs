use rand::Rng;
use std::{fmt, future::Future, time::Duration};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// An exponential retry policy.
///
/// The unit of work runs at most `steps` times. Before attempt `n` (counting
/// from zero) the policy sleeps `duration * factor^(n-1)`, plus up to
/// `jitter` times that delay, capped at `cap` when one is set.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    pub duration: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub steps: u32,
    pub cap: Option<Duration>,
}

/// The outcome of one unit of work.
#[derive(Debug)]
pub enum Attempt<E> {
    Done,
    Retry(Option<E>),
    Fatal(E),
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// Every step ran without finishing the work.
    Exhausted { steps: u32, last: Option<E> },
    Fatal(E),
    /// The stop token fired before the work finished.
    Cancelled,
}

// === impl Backoff ===

impl Backoff {
    pub const fn new(duration: Duration, factor: f64, jitter: f64, steps: u32) -> Self {
        Self {
            duration,
            factor,
            jitter,
            steps,
            cap: None,
        }
    }

    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = Some(cap);
        self
    }

    /// The un-jittered delay preceding the given attempt.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let scale = self.factor.max(1.0).powi(attempt as i32 - 1);
        let delay = self.duration.mul_f64(scale);
        match self.cap {
            Some(cap) if delay > cap => cap,
            _ => delay,
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..self.jitter);
        delay + delay.mul_f64(extra)
    }

    /// Runs `work` until it reports [`Attempt::Done`], fails fatally, the step
    /// budget runs out, or `stop` is cancelled. Sleeps between attempts are
    /// interrupted by cancellation.
    pub async fn retry<F, Fut, E>(
        &self,
        stop: &CancellationToken,
        mut work: F,
    ) -> Result<(), RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Attempt<E>>,
    {
        let mut last = None;
        for attempt in 0..self.steps.max(1) {
            let delay = self.jittered(self.base_delay(attempt));
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => return Err(RetryError::Cancelled),
                    _ = time::sleep(delay) => {}
                }
            }
            if stop.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            match work().await {
                Attempt::Done => return Ok(()),
                Attempt::Fatal(error) => return Err(RetryError::Fatal(error)),
                Attempt::Retry(error) => {
                    tracing::trace!(attempt, "Retrying");
                    last = error;
                }
            }
        }

        Err(RetryError::Exhausted {
            steps: self.steps.max(1),
            last,
        })
    }
}

// === impl RetryError ===

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted {
                steps,
                last: Some(error),
            } => write!(f, "gave up after {steps} attempts: {error}"),
            Self::Exhausted { steps, last: None } => write!(f, "gave up after {steps} attempts"),
            Self::Fatal(error) => fmt::Display::fmt(error, f),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl<E> std::error::Error for RetryError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Exhausted {
                last: Some(error), ..
            } => Some(error),
            Self::Fatal(error) => Some(error),
            _ => None,
        }
    }
}
