//! Default retry backoff.
//!
//! Failed tasks that still have retries left are republished with a delay
//! that climbs the Fibonacci sequence: each retry waits for the smallest
//! Fibonacci number strictly greater than the previous delay, yielding
//! 1, 2, 3, 5, 8, 13, ... seconds. Handlers that want a specific delay
//! return a retriable error instead and bypass this policy.

/// Returns the smallest Fibonacci number strictly greater than `current`.
///
/// A `current` of zero yields 1, so a fresh signature's first retry waits
/// one second. The walk saturates near `u32::MAX` rather than overflowing.
#[must_use]
pub fn fibonacci_next(current: u32) -> u32 {
    let (mut previous, mut candidate) = (0_u32, 1_u32);
    while candidate <= current {
        let next = previous.saturating_add(candidate);
        previous = candidate;
        candidate = next;
        if candidate == previous {
            // saturated; nothing larger is representable
            break;
        }
    }
    candidate
}
