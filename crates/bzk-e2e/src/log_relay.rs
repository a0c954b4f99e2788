//! Relays container output into the harness log.

use crate::runtime::{ContainerRuntime, LogStream};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Spawn a background task that follows the container's output and logs each
/// line with `prefix`.
///
/// The task ends silently when the stream closes or fails. Nothing awaits it;
/// the handle is only useful to tests.
pub fn spawn_log_relay(
    runtime: &Arc<dyn ContainerRuntime>,
    container_id: &str,
    prefix: impl Into<String>,
) -> JoinHandle<usize> {
    let stream = runtime.log_stream(container_id);
    tokio::spawn(relay(stream, prefix.into()))
}

/// Log every line of `stream`, returning how many were relayed.
pub(crate) async fn relay(mut stream: LogStream, prefix: String) -> usize {
    let mut buffer = LineBuffer::default();
    let mut relayed = 0;

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                for line in buffer.push(&chunk) {
                    info!(target: "bzk_e2e::container", prefix = %prefix, "{line}");
                    relayed += 1;
                }
            }
            Err(e) => {
                debug!(prefix = %prefix, error = %e, "log stream ended with an error");
                break;
            }
        }
    }

    if let Some(rest) = buffer.finish() {
        info!(target: "bzk_e2e::container", prefix = %prefix, "{rest}");
        relayed += 1;
    }

    relayed
}

/// Reassembles lines from chunks that are not aligned on line boundaries.
#[derive(Debug, Default)]
struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    /// Append a chunk and return the lines it completed.
    fn push(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);

        let mut lines = Vec::new();
        while let Some(newline) = self.partial.find('\n') {
            let rest = self.partial.split_off(newline + 1);
            let line = std::mem::replace(&mut self.partial, rest);
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    /// Whatever is left after the stream closed.
    fn finish(self) -> Option<String> {
        (!self.partial.is_empty()).then_some(self.partial)
    }
}
