//! Coarse-grained timers for strand sessions.
//!
//! This crate provides the shared timing wheel that sessions use for
//! queue-offer deadlines and cron scheduling, behind a small [`Timer`] trait
//! so tests can substitute a deterministic clock.
//!
//! ## Features
//!
//! - **Hashed Wheel**: fixed tick, fixed slot count, one ticker thread for
//!   the whole process
//! - **One-Shot Events**: [`Timer::after`] returns a [`Sleep`] future firing
//!   at or after the requested duration (granularity is one tick)
//! - **Process-Wide Handle**: [`global`] returns the singleton wheel used by
//!   default
//! - **Deterministic Testing**: [`ManualTimer`] is advanced by hand
//!
//! ## Example
//!
//! ```rust,no_run
//! use strand_timer::{global, Timer};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let wheel = global();
//! wheel.after(Duration::from_millis(250)).await;
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod manual;
pub mod wheel;

// Re-export main types
pub use manual::ManualTimer;
pub use wheel::{global, Wheel, DEFAULT_SLOTS, DEFAULT_TICK};

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

/// One-shot timer event sources.
///
/// Implementations must guarantee that the returned [`Sleep`] completes at or
/// after `duration`; completing late (up to one tick of slack) is expected.
pub trait Timer: Send + Sync {
    /// Return a future that completes once `duration` has elapsed.
    fn after(&self, duration: Duration) -> Sleep;
}

/// A pending timer event handed out by [`Timer::after`].
pub struct Sleep {
    rx: oneshot::Receiver<()>,
}

impl Sleep {
    pub(crate) fn new(rx: oneshot::Receiver<()>) -> Self {
        Self { rx }
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the driving wheel went away; treat that as
        // fired so waiters are never stranded.
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}
