//! Minimum poll interval gate.

use std::time::Duration;

use tokio::time::Instant;

/// Whether a device is due for a full poll.
///
/// True iff at least `min_interval` has passed since `last_poll`; reaching
/// the interval exactly counts as due. A device that was never polled is
/// always due, and a zero interval polls on every pass.
pub fn should_poll(now: Instant, last_poll: Option<Instant>, min_interval: Duration) -> bool {
    match last_poll {
        None => true,
        Some(last) => now.saturating_duration_since(last) >= min_interval,
    }
}
