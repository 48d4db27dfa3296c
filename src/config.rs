//! Centralized configuration constants for peerdrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (frame header sizes, CRC
//! parameters) stay in `codec`.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// File chunk size in bytes (256 KiB). The unit of transfer, per-chunk CRC,
/// and progress accounting. The last chunk of a file may be smaller.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Consecutive chunk-send failures tolerated before a transfer is cancelled
/// and the peer notified. A single transient failure pauses and retries; a
/// run of failures this long is treated as terminal for that transfer.
pub const MAX_CONSECUTIVE_SEND_ERRORS: u32 = 5;

// ── Backpressure ─────────────────────────────────────────────────────────────

/// Low water mark for the data channel's send buffer (bytes). Once a paused
/// sender observes the buffered amount below this value it resumes streaming.
pub const BUFFER_LOW_THRESHOLD: usize = 1024 * 1024;

/// High water mark for the data channel's send buffer (bytes). Senders must
/// stop queueing chunks while the buffered amount is at or above this value.
/// Crossing it is a flow-control signal, never an error.
pub const BUFFER_MAX_THRESHOLD: usize = 2 * 1024 * 1024;

/// Polling interval while a sender waits for the send buffer to drain.
pub const BUFFER_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Upper bound on a single backpressure wait. If the buffer has not drained
/// by then the channel is re-checked; a closed channel aborts the wait.
pub const BUFFER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

// ── Reconnection ─────────────────────────────────────────────────────────────

/// Maximum reconnect attempts per peer before the session is torn down and a
/// terminal failure surfaced.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Delay before the first reconnect attempt. Subsequent attempts multiply by
/// [`RECONNECT_BACKOFF_FACTOR`] up to [`RECONNECT_MAX_DELAY`].
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Exponential backoff multiplier between reconnect attempts.
pub const RECONNECT_BACKOFF_FACTOR: f64 = 1.5;

/// Cap on the reconnect backoff delay.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Fixed delay before retrying after a negotiation reset (SDP error, ICE
/// failure, signaling-state mismatch). Partial WebRTC state is considered
/// unrecoverable, so the reset path force-closes and starts fresh.
pub const RESET_RETRY_DELAY: Duration = Duration::from_secs(2);

// ── Connection request ───────────────────────────────────────────────────────

/// Maximum random jitter a designated callee waits after sending a
/// `connection-request`, so that two peers requesting simultaneously do not
/// also time out simultaneously.
pub const CONNECTION_REQUEST_JITTER: Duration = Duration::from_millis(500);

/// How long a designated callee waits for an offer after requesting one
/// before forcing its own offer (bypassing role arbitration).
pub const CONNECTION_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

// ── Assembly policy ──────────────────────────────────────────────────────────

/// What to do when a download reaches its expected chunk count but indices
/// are missing (possible under cancellation races).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssemblyPolicy {
    /// Assemble whatever arrived, log each missing index, and surface an
    /// incompleteness warning alongside the result.
    #[default]
    BestEffort,
    /// Abort assembly and fail the download.
    Strict,
}

// ── Construction-time configuration ──────────────────────────────────────────

/// Connection and transfer parameters, consumed at construction time.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// ICE server URLs handed to the connector factory.
    pub ice_servers: Vec<String>,
    /// File chunk size in bytes.
    pub chunk_size: usize,
    /// Send-buffer low water mark (resume threshold).
    pub buffer_low: usize,
    /// Send-buffer high water mark (pause ceiling).
    pub buffer_max: usize,
    /// Maximum reconnect attempts per peer.
    pub reconnect_max_attempts: u32,
    /// Missing-chunk assembly policy for downloads.
    pub assembly: AssemblyPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".into()],
            chunk_size: CHUNK_SIZE,
            buffer_low: BUFFER_LOW_THRESHOLD,
            buffer_max: BUFFER_MAX_THRESHOLD,
            reconnect_max_attempts: RECONNECT_MAX_ATTEMPTS,
            assembly: AssemblyPolicy::default(),
        }
    }
}

/// Backoff delay before reconnect attempt `attempt` (1-based).
///
/// `base * factor^(attempt-1)`, capped at [`RECONNECT_MAX_DELAY`].
pub fn reconnect_delay(attempt: u32) -> Duration {
    let factor = RECONNECT_BACKOFF_FACTOR.powi(attempt.saturating_sub(1) as i32);
    let delay = RECONNECT_BASE_DELAY.mul_f64(factor);
    delay.min(RECONNECT_MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(reconnect_delay(1), Duration::from_secs(1));
        assert!(reconnect_delay(2) > reconnect_delay(1));
        assert!(reconnect_delay(3) > reconnect_delay(2));
        for attempt in 1..=20 {
            assert!(reconnect_delay(attempt) <= RECONNECT_MAX_DELAY);
        }
    }
}
