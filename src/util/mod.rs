//! Common utilities

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::Poll;
use std::time::Duration;

use futures_util::Future;
use tokio::time::{Instant, Sleep};

/// Whether an event loop should keep running after handling an item
#[derive(Debug)]
pub(crate) enum Running {
    Continue,
    Stop,
}

/// Tracks the remote-inactivity deadline of a transport.
///
/// Reset whenever a frame arrives; resolving means the peer has been silent
/// for longer than its advertised idle timeout.
#[derive(Debug)]
pub(crate) struct IdleTimeout {
    delay: Pin<Box<Sleep>>,
    duration: Duration,
}

impl IdleTimeout {
    pub fn new(duration: Duration) -> Self {
        let delay = Box::pin(tokio::time::sleep(duration));
        Self { delay, duration }
    }

    pub fn reset(&mut self) {
        let next = Instant::now() + self.duration;
        self.delay.as_mut().reset(next);
    }
}

impl Future for IdleTimeout {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        self.delay.as_mut().poll(cx)
    }
}

// The only process-global state in the crate: the sequence used to compose
// connection identifiers.
static CONNECTION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Allocates the next process-unique connection sequence number
pub(crate) fn next_connection_seq() -> u64 {
    CONNECTION_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Composes a child identifier, e.g. `"3:1"` for session 1 of connection 3
pub(crate) fn child_id(parent: &str, seq: u64) -> String {
    format!("{}:{}", parent, seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_seq_is_monotonic() {
        let a = next_connection_seq();
        let b = next_connection_seq();
        assert!(b > a);
    }

    #[test]
    fn child_ids_compose() {
        assert_eq!(child_id("7", 0), "7:0");
        assert_eq!(child_id("7:0", 2), "7:0:2");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_elapses_without_reset() {
        let timeout = IdleTimeout::new(Duration::from_millis(50));
        tokio::time::timeout(Duration::from_millis(100), timeout)
            .await
            .expect("idle timeout should have elapsed");
    }
}
