//! Periodic tick driving empty-frame keep-alives

use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;

use futures_util::Stream;
use pin_project_lite::pin_project;
use tokio_stream::wrappers::IntervalStream;

pin_project! {
    /// A stream that ticks every `period`, or never when the remote peer
    /// advertised no idle timeout
    #[derive(Debug)]
    pub(crate) struct HeartBeat {
        #[pin]
        interval: Option<IntervalStream>,
    }
}

impl HeartBeat {
    /// Never yields; `StreamExt::next()` stays pending forever
    pub fn never() -> Self {
        Self { interval: None }
    }

    /// Ticks every `period`
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        // A missed tick means the loop was busy writing; bursting extra
        // empty frames would not help anyone
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Self {
            interval: Some(IntervalStream::new(interval)),
        }
    }
}

impl Stream for HeartBeat {
    type Item = ();

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.interval.as_pin_mut() {
            Some(interval) => match interval.poll_next(cx) {
                Poll::Ready(Some(_instant)) => Poll::Ready(Some(())),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn ticks_at_the_configured_period() {
        let mut heartbeat = HeartBeat::new(Duration::from_millis(500));
        tokio::time::timeout(Duration::from_secs(2), heartbeat.next())
            .await
            .expect("heartbeat should tick")
            .expect("stream should not end");
    }

    #[tokio::test(start_paused = true)]
    async fn never_variant_stays_pending() {
        let mut heartbeat = HeartBeat::never();
        let result =
            tokio::time::timeout(Duration::from_secs(5), heartbeat.next()).await;
        assert!(result.is_err());
    }
}
