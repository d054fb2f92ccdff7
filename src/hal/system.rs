//! Std-backed clocks and delays.
//!
//! [`SystemClock`] reads [`std::time::Instant`]. With the `runtime` feature,
//! [`TokioClock`] and [`TokioDelay`] follow tokio's clock instead, so tests
//! running on a paused runtime see consistent time.

use std::time::Instant;

use crate::traits::Clock;

/// Monotonic clock based on [`Instant`].
///
/// ```rust
/// use rs_cmdstation::hal::SystemClock;
/// use rs_cmdstation::traits::Clock;
///
/// let clock = SystemClock::new();
/// let a = clock.now_ms();
/// assert!(clock.now_ms() >= a);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    /// Clock starting at 0 now.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

#[cfg(feature = "runtime")]
pub use self::tokio_time::{TokioClock, TokioDelay};

#[cfg(feature = "runtime")]
mod tokio_time {
    use std::time::Duration;

    use tokio::time::Instant;

    use crate::traits::{Clock, Delay};

    /// Clock following tokio's (pausable) time.
    #[derive(Debug, Clone, Copy)]
    pub struct TokioClock {
        epoch: Instant,
    }

    impl TokioClock {
        /// Clock starting at 0 now. Must be called inside a runtime.
        pub fn new() -> Self {
            Self {
                epoch: Instant::now(),
            }
        }
    }

    impl Default for TokioClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for TokioClock {
        fn now_ms(&self) -> u64 {
            self.epoch.elapsed().as_millis() as u64
        }
    }

    /// Delay backed by [`tokio::time::sleep`].
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TokioDelay;

    impl Delay for TokioDelay {
        fn delay_ms(&self, ms: u32) -> impl core::future::Future<Output = ()> + Send {
            tokio::time::sleep(Duration::from_millis(u64::from(ms)))
        }
    }
}

#[cfg(all(test, feature = "runtime"))]
mod tests {
    use super::*;
    use crate::traits::Delay;

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_time() {
        let clock = TokioClock::new();
        TokioDelay.delay_ms(1500).await;
        assert_eq!(clock.now_ms(), 1500);
    }
}
