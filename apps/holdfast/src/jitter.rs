//! Bounded random delays, used to stagger concurrent session startup so a
//! batch of proxies is never hit in one burst.

use std::ops::Range;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::debug;

/// Stagger window applied before each proxied session starts.
pub const STARTUP_STAGGER_MS: Range<u64> = 10..6_000;

/// Draw a uniformly distributed delay from `range` (milliseconds,
/// upper bound exclusive).
pub fn jittered(range: Range<u64>) -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(range))
}

/// Sleep for a jittered delay drawn from `range`.
pub async fn stagger(range: Range<u64>) {
    let delay = jittered(range);
    debug!(delay_ms = delay.as_millis() as u64, "staggering startup");
    sleep(delay).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_stay_inside_the_window() {
        for _ in 0..1_000 {
            let delay = jittered(STARTUP_STAGGER_MS);
            assert!(delay >= Duration::from_millis(10));
            assert!(delay < Duration::from_millis(6_000));
        }
    }
}
