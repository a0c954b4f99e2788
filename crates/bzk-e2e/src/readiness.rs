//! TCP readiness probing.

use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info};

/// Interval between readiness attempts used while provisioning.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("{address} not reachable after {elapsed:?} (timeout {timeout:?})")]
    Timeout {
        address: String,
        elapsed: Duration,
        timeout: Duration,
    },
}

/// Wait until a TCP connection to `address` succeeds.
///
/// Each attempt is bounded by the remaining budget. The connection is closed
/// immediately after it is established. Returns within
/// `timeout + poll_interval`.
pub async fn wait_for_reachable(
    address: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<(), ReadinessError> {
    let start = Instant::now();
    let deadline = start + timeout;
    let mut attempts: u32 = 0;

    loop {
        attempts = attempts.saturating_add(1);
        let remaining = deadline.saturating_duration_since(Instant::now());

        match tokio::time::timeout(remaining, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                drop(stream);
                info!(address, attempts, elapsed = ?start.elapsed(), "address reachable");
                return Ok(());
            }
            Ok(Err(e)) => {
                debug!(address, attempts, error = %e, "address not reachable yet");
            }
            Err(_) => {
                debug!(address, attempts, "connection attempt timed out");
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ReadinessError::Timeout {
                address: address.to_string(),
                elapsed: start.elapsed(),
                timeout,
            });
        }

        tokio::time::sleep(poll_interval.min(remaining)).await;
    }
}
