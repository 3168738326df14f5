//! Process-wide monotonic clock and cancellable sleeps.
//!
//! Receive stamps throughout the crate are seconds since process start so
//! they can be compared against `DATA_EXPIRED_DELAY` style windows without
//! being disturbed by wall-clock adjustments (the supervisor may step the
//! system clock after a GPS time sync).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Seconds elapsed since the first call in this process.
pub fn monotonic() -> f64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_secs_f64()
}

/// Reconstruct the wall-clock instant a monotonic stamp was taken at.
pub fn wall_from_monotonic(stamp: f64) -> DateTime<Utc> {
    let age = monotonic() - stamp;
    Utc::now() - chrono::Duration::from_std(Duration::from_secs_f64(age.max(0.0))).unwrap_or_default()
}

/// Sleep in short slices so a `stop()` from another thread is honored
/// promptly. Returns false if the alive flag dropped during the wait.
pub fn sleep_cancellable(alive: &AtomicBool, duration: Duration) -> bool {
    let slice = Duration::from_millis(100);
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if !alive.load(Ordering::SeqCst) {
            return false;
        }
        std::thread::sleep(slice.min(deadline.saturating_duration_since(Instant::now())));
    }
    alive.load(Ordering::SeqCst)
}
