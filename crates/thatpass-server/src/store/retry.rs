use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::{EngineError, StoreError};

const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// How long an optimistic update may keep losing races before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Retry until the write lands.
    #[default]
    Unbounded,
    /// Give up after `max_attempts`, sleeping with exponential backoff and jitter in between.
    Bounded {
        max_attempts: NonZeroU32,
        base_backoff: Duration,
    },
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32, base_backoff: Duration) -> Self {
        match NonZeroU32::new(max_attempts) {
            Some(max_attempts) => Self::Bounded {
                max_attempts,
                base_backoff,
            },
            None => Self::Unbounded,
        }
    }

    /// Run `attempt` until it breaks. `Continue` means the conditional write lost a
    /// race and the whole read-then-write should be repeated.
    pub fn run<T>(
        &self,
        mut attempt: impl FnMut() -> Result<ControlFlow<T>, StoreError>,
    ) -> Result<T, EngineError> {
        let mut attempts: u32 = 0;
        loop {
            attempts = attempts.saturating_add(1);
            if let ControlFlow::Break(value) = attempt()? {
                return Ok(value);
            }
            debug!(attempts, "optimistic write conflicted");

            match *self {
                Self::Unbounded => std::thread::yield_now(),
                Self::Bounded {
                    max_attempts,
                    base_backoff,
                } => {
                    if attempts >= max_attempts.get() {
                        return Err(EngineError::ConflictRetryExhausted { attempts });
                    }
                    std::thread::sleep(backoff(base_backoff, attempts));
                }
            }
        }
    }
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    let jitter_ceiling = base.as_micros().min(u128::from(u64::MAX)) as u64;
    let jitter = if jitter_ceiling == 0 {
        Duration::ZERO
    } else {
        Duration::from_micros(rand::thread_rng().gen_range(0..jitter_ceiling))
    };
    exp.min(MAX_BACKOFF) + jitter
}
