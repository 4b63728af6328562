//! Bandwidth throttle and chunk sizing for the transfer loop.

use crate::ftp::error::{FtpError, FtpResult};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Granularity of rate control.
pub const RATE_CONTROL_RESOLUTION: Duration = Duration::from_millis(100);

/// Chunks never shrink below this.
pub const MIN_CHUNK_SIZE: usize = 64;

/// Halve `configured` until one chunk fits in one resolution interval at
/// `rate` bytes/sec (0 = unlimited).
pub fn chunk_size_for(configured: usize, rate: u64) -> usize {
    let mut chunk = configured.max(MIN_CHUNK_SIZE);
    if rate == 0 {
        return chunk;
    }
    let per_interval = rate as u128 * RATE_CONTROL_RESOLUTION.as_millis() / 1000;
    while chunk > MIN_CHUNK_SIZE && chunk as u128 > per_interval {
        chunk = (chunk / 2).max(MIN_CHUNK_SIZE);
    }
    chunk
}

/// Sleeps just long enough to keep the average at or below the rate.
pub struct Throttle {
    rate: u64,
    window_bytes: u64,
    checkpoint: Instant,
    cancel: CancellationToken,
}

impl Throttle {
    pub fn new(rate: u64, cancel: CancellationToken) -> Self {
        Self {
            rate,
            window_bytes: 0,
            checkpoint: Instant::now(),
            cancel,
        }
    }

    /// Account for `n` bytes just moved and wait if ahead of schedule.
    pub async fn consume(&mut self, n: usize) -> FtpResult<()> {
        if self.rate == 0 {
            return Ok(());
        }
        self.window_bytes += n as u64;

        let ideal = Duration::from_secs_f64(self.window_bytes as f64 / self.rate as f64);
        let elapsed = self.checkpoint.elapsed();

        if ideal > elapsed {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(FtpError::cancelled("Transfer cancelled while throttling"));
                }
                _ = tokio::time::sleep(ideal - elapsed) => {}
            }
        } else if elapsed - ideal > RATE_CONTROL_RESOLUTION {
            // Fell behind (slow link or a stall); don't burst to catch up.
            self.window_bytes = 0;
            self.checkpoint = Instant::now();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_sizing() {
        assert_eq!(chunk_size_for(65_536, 0), 65_536);
        // 128 KiB/s → 13107 bytes per 100 ms
        assert_eq!(chunk_size_for(65_536, 131_072), 8_192);
        assert_eq!(chunk_size_for(65_536, 100), MIN_CHUNK_SIZE);
        assert_eq!(chunk_size_for(10, 0), MIN_CHUNK_SIZE);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_is_a_lower_bound_on_duration() {
        let mut throttle = Throttle::new(1_000, CancellationToken::new());
        let start = Instant::now();
        for _ in 0..100 {
            throttle.consume(100).await.unwrap();
        }
        // 10_000 bytes at 1000 B/s
        assert!(start.elapsed() >= Duration::from_millis(9_900));
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_never_sleeps() {
        let mut throttle = Throttle::new(0, CancellationToken::new());
        let start = Instant::now();
        for _ in 0..1_000 {
            throttle.consume(65_536).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_sleep() {
        let cancel = CancellationToken::new();
        let mut throttle = Throttle::new(10, cancel.clone());
        cancel.cancel();
        let err = throttle.consume(1_000).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
