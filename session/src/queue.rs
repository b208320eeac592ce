//! Bounded write queue with wheel-timed offers.

use crate::error::SessionError;
use parking_lot::Mutex;
use std::time::Duration;
use strand_timer::Timer;
use tokio::sync::mpsc;

/// Bounded FIFO of pending outbound messages.
///
/// Many producers (`write_message`) feed one consumer (the send loop). The
/// receiver is taken exactly once when the loops start and closed by the
/// reaper after they exit.
pub(crate) struct WriteQueue<P> {
    cap: usize,
    tx: mpsc::Sender<P>,
    rx: Mutex<Option<mpsc::Receiver<P>>>,
}

impl<P: Send + Sync + 'static> WriteQueue<P> {
    pub(crate) fn new(cap: usize) -> Self {
        let (tx, rx) = mpsc::channel(cap);
        Self {
            cap,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.cap
    }

    /// Hand the consuming side to the send loop; `None` on the second call.
    pub(crate) fn take_receiver(&self) -> Option<mpsc::Receiver<P>> {
        self.rx.lock().take()
    }

    /// Try to enqueue `pkg`, giving up after `timeout` as measured by the
    /// session timer.
    ///
    /// Messages enter the queue in the order the offers complete, so a
    /// sequence of successful offers is written in exactly that order.
    pub(crate) async fn offer(
        &self,
        pkg: P,
        timeout: Duration,
        timer: &dyn Timer,
    ) -> Result<(), SessionError> {
        tokio::select! {
            biased;

            permit = self.tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(pkg);
                    Ok(())
                }
                Err(_) => Err(SessionError::Closed),
            },

            _ = timer.after(timeout) => Err(SessionError::Blocked),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_timer::ManualTimer;

    #[tokio::test]
    async fn test_offer_fills_in_fifo_order() {
        let queue = WriteQueue::new(4);
        let timer = ManualTimer::new();
        for i in 0..4 {
            queue.offer(i, Duration::from_millis(10), &timer).await.unwrap();
        }

        let mut rx = queue.take_receiver().unwrap();
        for i in 0..4 {
            assert_eq!(rx.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_full_queue_blocks_until_timeout() {
        let queue = WriteQueue::new(1);
        let timer = ManualTimer::new();
        queue.offer(1u8, Duration::from_millis(10), &timer).await.unwrap();

        let offer = queue.offer(2u8, Duration::from_millis(10), &timer);
        tokio::pin!(offer);

        // Nothing fires until the clock moves.
        tokio::select! {
            _ = &mut offer => panic!("offer should still be pending"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }

        timer.advance(Duration::from_millis(10));
        assert!(matches!(offer.await, Err(SessionError::Blocked)));
    }

    #[tokio::test]
    async fn test_receiver_taken_once() {
        let queue = WriteQueue::<u8>::new(1);
        assert!(queue.take_receiver().is_some());
        assert!(queue.take_receiver().is_none());
    }
}
