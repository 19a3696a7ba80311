//! Randomised waits used to pace outbound requests.

use std::time::Duration;

use rand::Rng;

/// Uniform duration in `[min, max]`. Swapped bounds are tolerated.
pub fn between(min: Duration, max: Duration) -> Duration {
    let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
    if lo == hi {
        return lo;
    }
    let ms = rand::thread_rng().gen_range(lo.as_millis() as u64..=hi.as_millis() as u64);
    Duration::from_millis(ms)
}

/// `base` plus up to `spread` of additional random delay.
pub fn jittered(base: Duration, spread: Duration) -> Duration {
    base + between(Duration::ZERO, spread)
}

/// Sleeps for a random human-looking pause and returns how long it waited.
pub async fn pause(min: Duration, max: Duration) -> Duration {
    let wait = between(min, max);
    if !wait.is_zero() {
        tokio::time::sleep(wait).await;
    }
    wait
}
