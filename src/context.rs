//! Single-threaded scheduling primitive.
//!
//! A [`ThreadContext`] binds timers to an actor mailbox: every scheduled
//! callback is delivered as a message into the owning actor's channel,
//! so all state transitions run on that actor's single task. Each server
//! and each client proxy owns exactly one context.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Handle to a scheduled timer. Cancels the timer when dropped.
pub struct Scheduled {
    handle: JoinHandle<()>,
}

impl Scheduled {
    /// Cancels the timer. Messages already delivered are unaffected.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for Scheduled {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Mailbox-bound scheduler for a single actor.
pub struct ThreadContext<M: Send + 'static> {
    sender: mpsc::UnboundedSender<M>,
}

impl<M: Send + 'static> Clone for ThreadContext<M> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<M: Send + 'static> ThreadContext<M> {
    /// Binds a context to the given mailbox sender.
    pub fn new(sender: mpsc::UnboundedSender<M>) -> Self {
        Self { sender }
    }

    /// Enqueues a message for immediate processing.
    pub fn submit(&self, message: M) {
        let _ = self.sender.send(message);
    }

    /// Delivers `message` into the mailbox after `delay`.
    pub fn schedule(&self, delay: Duration, message: M) -> Scheduled {
        let sender = self.sender.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(message);
        });
        Scheduled { handle }
    }

    /// Delivers a message produced by `message` into the mailbox every
    /// `interval`, starting after `initial`.
    pub fn schedule_periodic<F>(&self, initial: Duration, interval: Duration, message: F) -> Scheduled
    where
        F: Fn() -> M + Send + 'static,
    {
        let sender = self.sender.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(initial).await;
            let mut ticker = tokio::time::interval(interval);
            // The first tick of an interval completes immediately.
            ticker.tick().await;
            loop {
                if sender.send(message()).is_err() {
                    break;
                }
                ticker.tick().await;
            }
        });
        Scheduled { handle }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schedule_delivers_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let context = ThreadContext::new(tx);

        let _timer = context.schedule(Duration::from_millis(10), 42u32);
        assert_eq!(rx.recv().await, Some(42));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_prevents_delivery() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let context = ThreadContext::new(tx);

        let timer = context.schedule(Duration::from_millis(50), 1u32);
        timer.cancel();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_periodic_fires_repeatedly() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let context = ThreadContext::new(tx);

        let _timer = context.schedule_periodic(
            Duration::from_millis(1),
            Duration::from_millis(5),
            || 7u32,
        );
        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(rx.recv().await, Some(7));
    }
}
