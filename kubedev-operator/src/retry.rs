//! Backoff policy and clock abstraction.
//!
//! Both retry layers (per API call, per reconciliation request) use
//! [`BackoffPolicy`]. Sleeping always goes through a [`Clock`], so tests can
//! observe the schedule without waiting for it.

use crate::error::ClientError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::sync::Arc;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Exponential backoff with an attempt ceiling and optional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Maximum attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Apply equal jitter: half the delay is fixed, half is random.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Policy used between failed reconciliations of the same key.
    pub fn requeue() -> Self {
        Self {
            max_attempts: u32::MAX,
            base_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            jitter: true,
        }
    }

    /// Same policy without jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `retry` (0-based), before jitter.
    pub fn ceiling_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(64) as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay before retry number `retry` (0-based), drawing jitter from `rng`.
    pub fn delay_for(&self, retry: u32, rng: &mut dyn RngCore) -> Duration {
        let ceiling = self.ceiling_for(retry);
        if !self.jitter {
            return ceiling;
        }
        let millis = ceiling.as_millis() as u64;
        let half = millis / 2;
        Duration::from_millis(half + rng.gen_range(0..=millis - half))
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Runs one API call under a [`BackoffPolicy`].
///
/// Errors for which [`ClientError::is_transient`] is false are returned at
/// once. After `policy.max_attempts` the last error is wrapped in
/// [`ClientError::Exhausted`].
pub struct Retrier {
    policy: BackoffPolicy,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
}

impl Retrier {
    /// Retrier sleeping on `clock` between attempts.
    pub fn new(policy: BackoffPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Use a fixed random source for jitter.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    /// Call `op` until it succeeds, fails for good, or runs out of attempts.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ClientError>> + Send,
        T: Send,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => err,
            };

            if !self.policy.allows(attempts) {
                tracing::warn!(call = %what, attempts, error = %err, "Giving up on API call");
                return Err(ClientError::Exhausted {
                    attempts,
                    last: Box::new(err),
                });
            }

            let delay = {
                let mut rng = self.rng.lock();
                self.policy.delay_for(attempts - 1, &mut *rng)
            };
            tracing::debug!(
                call = %what,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying API call"
            );
            self.clock.sleep(delay).await;
        }
    }
}

/// Source of wall-clock time and of sleeping.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Sleep for the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Clock backed by the system time and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Virtual clock for tests.
///
/// `sleep` returns immediately, records the requested duration and advances
/// virtual time by it.
#[derive(Debug)]
pub struct MockClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl MockClock {
    /// Mock clock starting at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Move virtual time forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        let step = ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::zero());
        *self.now.lock() += step;
    }

    /// Every sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    /// Total virtual time spent sleeping.
    pub fn slept(&self) -> Duration {
        self.sleeps.lock().iter().sum()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::starting_at(DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default())
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.sleeps.lock().push(duration);
        self.advance(duration);
        Box::pin(std::future::ready(()))
    }
}
