//! A deterministic timer for tests.

use crate::{Sleep, Timer};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

struct ManualState {
    now: Duration,
    waiters: Vec<(Duration, oneshot::Sender<()>)>,
}

/// A timer whose clock only moves when [`ManualTimer::advance`] is called.
///
/// Useful for exercising offer timeouts and cron scheduling without real
/// sleeps.
#[derive(Default)]
pub struct ManualTimer {
    state: Mutex<ManualState>,
}

impl Default for ManualState {
    fn default() -> Self {
        Self {
            now: Duration::ZERO,
            waiters: Vec::new(),
        }
    }
}

impl ManualTimer {
    /// Create a timer with its clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current reading of the manual clock.
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Number of events still waiting to fire.
    pub fn pending(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Move the clock forward and fire every event that has come due.
    pub fn advance(&self, delta: Duration) {
        let due = {
            let mut state = self.state.lock();
            state.now += delta;
            let now = state.now;

            let mut due = Vec::new();
            let mut i = 0;
            while i < state.waiters.len() {
                if state.waiters[i].0 <= now {
                    let (_, tx) = state.waiters.swap_remove(i);
                    due.push(tx);
                } else {
                    i += 1;
                }
            }
            due
        };

        for tx in due {
            let _ = tx.send(());
        }
    }
}

impl Timer for ManualTimer {
    fn after(&self, duration: Duration) -> Sleep {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        if duration.is_zero() {
            let _ = tx.send(());
        } else {
            let deadline = state.now + duration;
            state.waiters.push((deadline, tx));
        }
        Sleep::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test]
    async fn test_fires_only_when_advanced() {
        let timer = ManualTimer::new();
        let mut sleep = timer.after(Duration::from_millis(100));

        assert!((&mut sleep).now_or_never().is_none());
        timer.advance(Duration::from_millis(50));
        assert!((&mut sleep).now_or_never().is_none());
        timer.advance(Duration::from_millis(50));
        assert!(sleep.now_or_never().is_some());
    }

    #[tokio::test]
    async fn test_zero_duration_fires_immediately() {
        let timer = ManualTimer::new();
        assert!(timer.after(Duration::ZERO).now_or_never().is_some());
    }

    #[tokio::test]
    async fn test_pending_count() {
        let timer = ManualTimer::new();
        let _a = timer.after(Duration::from_millis(10));
        let _b = timer.after(Duration::from_millis(20));
        assert_eq!(timer.pending(), 2);
        timer.advance(Duration::from_millis(15));
        assert_eq!(timer.pending(), 1);
    }
}
