use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::ready;
use tokio::time::{sleep, Sleep};
use tracing::trace;

/// A timer that expires when no pong is received in time after a ping.
///
/// A disarmed timer never completes.
#[derive(Debug, Default)]
pub struct PongTimer {
    timer: Option<Pin<Box<Sleep>>>,
}

impl PongTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts waiting for a pong. A timer that is armed already keeps its
    /// deadline.
    pub fn arm(&mut self, wait: Duration) {
        if self.timer.is_none() {
            trace!("waiting {:?} for a pong", wait);
            self.timer = Some(Box::pin(sleep(wait)));
        }
    }

    pub fn disarm(&mut self) {
        if self.timer.take().is_some() {
            trace!("pong received in time");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_some()
    }
}

impl Future for PongTimer {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match self.timer.as_mut() {
            None => Poll::Pending,
            Some(timer) => {
                ready!(timer.as_mut().poll(cx));
                trace!("pong timer expired");
                self.timer = None;
                Poll::Ready(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::{self, Instant};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_armed_timer_expires() {
        let mut timer = PongTimer::new();
        let start = Instant::now();
        timer.arm(Duration::from_secs(5));
        (&mut timer).await;
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_keeps_the_deadline() {
        let mut timer = PongTimer::new();
        let start = Instant::now();
        timer.arm(Duration::from_secs(5));
        time::sleep(Duration::from_secs(3)).await;
        timer.arm(Duration::from_secs(5));
        (&mut timer).await;
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_timer_never_expires() {
        let mut timer = PongTimer::new();
        timer.arm(Duration::from_secs(5));
        timer.disarm();
        assert!(time::timeout(Duration::from_secs(60), &mut timer)
            .await
            .is_err());
    }
}
