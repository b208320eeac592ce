//! Hashed timing wheel with a dedicated ticker thread.
//!
//! The wheel trades precision for cost: every pending event lives in one of a
//! fixed number of slots and is resolved when the cursor sweeps past it, so a
//! process can carry tens of thousands of timers for the price of one thread.

use crate::{Sleep, Timer};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Default wheel tick.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Default slot count; together with [`DEFAULT_TICK`] the wheel spans two
/// minutes before waiters start carrying extra rounds.
pub const DEFAULT_SLOTS: usize = 1200;

static GLOBAL: Lazy<Arc<Wheel>> = Lazy::new(|| Wheel::new(DEFAULT_TICK, DEFAULT_SLOTS));

/// The process-wide wheel used by sessions unless another timer is injected.
pub fn global() -> Arc<Wheel> {
    GLOBAL.clone()
}

struct Waiter {
    /// Full revolutions left before this waiter fires.
    rounds: usize,
    tx: oneshot::Sender<()>,
}

struct State {
    cursor: usize,
    slots: Vec<Vec<Waiter>>,
}

/// A hashed timing wheel.
///
/// Dropping every handle to a non-global wheel stops its ticker thread on the
/// next tick.
pub struct Wheel {
    tick: Duration,
    state: Mutex<State>,
}

impl Wheel {
    /// Create a wheel and start its ticker thread.
    ///
    /// # Panics
    ///
    /// Panics if `tick` is zero or `slots < 2`.
    pub fn new(tick: Duration, slots: usize) -> Arc<Self> {
        assert!(!tick.is_zero(), "wheel tick must be non-zero");
        assert!(slots >= 2, "wheel needs at least two slots");

        let wheel = Arc::new(Self {
            tick,
            state: Mutex::new(State {
                cursor: 0,
                slots: (0..slots).map(|_| Vec::new()).collect(),
            }),
        });

        let weak: Weak<Wheel> = Arc::downgrade(&wheel);
        thread::Builder::new()
            .name("strand-wheel".to_string())
            .spawn(move || {
                loop {
                    thread::sleep(tick);
                    match weak.upgrade() {
                        Some(wheel) => wheel.advance(),
                        None => break,
                    }
                }
                debug!("timer wheel dropped, ticker exiting");
            })
            .expect("spawning the wheel ticker thread should never fail");

        wheel
    }

    /// The wheel tick, i.e. its scheduling granularity.
    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// The longest delay the wheel covers in a single revolution.
    pub fn span(&self) -> Duration {
        self.tick * self.state.lock().slots.len() as u32
    }

    /// Move the cursor one slot forward and fire everything due.
    fn advance(&self) {
        let due = {
            let mut state = self.state.lock();
            let len = state.slots.len();
            state.cursor = (state.cursor + 1) % len;
            let cursor = state.cursor;

            let slot = &mut state.slots[cursor];
            let mut due = Vec::new();
            let mut keep = Vec::with_capacity(slot.len());
            for mut waiter in slot.drain(..) {
                if waiter.rounds == 0 {
                    due.push(waiter.tx);
                } else {
                    waiter.rounds -= 1;
                    keep.push(waiter);
                }
            }
            *slot = keep;
            due
        };

        for tx in due {
            // The receiver may have been dropped (caller lost interest).
            let _ = tx.send(());
        }
    }
}

impl Timer for Wheel {
    fn after(&self, duration: Duration) -> Sleep {
        let (tx, rx) = oneshot::channel();

        // Round up to whole ticks; anything below one tick still waits a tick.
        let ticks = duration.as_nanos().div_ceil(self.tick.as_nanos()).max(1) as usize;

        let mut state = self.state.lock();
        let len = state.slots.len();
        let slot = (state.cursor + ticks) % len;
        let rounds = (ticks - 1) / len;
        state.slots[slot].push(Waiter { rounds, tx });

        Sleep::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_after_fires_at_or_after_duration() {
        let wheel = Wheel::new(Duration::from_millis(5), 64);
        let start = Instant::now();
        wheel.after(Duration::from_millis(40)).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(35), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "fired far too late: {elapsed:?}");
    }

    #[tokio::test]
    async fn test_sub_tick_durations_round_up() {
        let wheel = Wheel::new(Duration::from_millis(20), 16);
        let start = Instant::now();
        wheel.after(Duration::from_millis(1)).await;
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_durations_beyond_one_revolution() {
        let wheel = Wheel::new(Duration::from_millis(1), 8);
        let start = Instant::now();
        // 25 ticks = three full revolutions plus one slot.
        wheel.after(Duration::from_millis(25)).await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_global_is_shared() {
        let a = global();
        let b = global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
