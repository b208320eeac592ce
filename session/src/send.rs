//! The send loop: queue consumption, cron ticks, and graceful drain.

use crate::session::Session;
use crate::transport::TransportKind;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Drive the send side until shutdown, then deliver `on_close` and reap.
///
/// The loop only ever exits through the shutdown path, which waits for the
/// receive loop first; that ordering is what makes `on_close` the last
/// callback a session delivers.
pub(crate) async fn run<P: Send + Sync + 'static>(
    session: Arc<Session<P>>,
    mut queue_rx: mpsc::Receiver<P>,
) {
    if let Err(panic) = AssertUnwindSafe(send_loop(&session, &mut queue_rx))
        .catch_unwind()
        .await
    {
        error!(
            "{} send loop panicked: {}",
            session.stat(),
            crate::panic_message(&panic)
        );
        session.stop();
        // Keep the shutdown order intact even on the panic path.
        session.rdone_wait().await;
    }

    if let Some(listener) = session.listener() {
        listener.on_close(&session).await;
    }
    info!("{} send loop exiting", session.stat());
    session.reap(queue_rx).await;
}

async fn send_loop<P: Send + Sync + 'static>(session: &Arc<Session<P>>, queue_rx: &mut mpsc::Receiver<P>) {
    // Cleared on the first write failure; queued messages are then consumed
    // but never reach the wire.
    let mut healthy = true;
    let timer = session.timer_handle();
    let mut cron = timer.after(session.cron_period());

    loop {
        // Fair select: under sustained outbound load the queue arm is ready
        // on every iteration, and a fixed priority would starve the cron arm
        // and its heartbeats.
        tokio::select! {
            _ = session.done_wait() => {
                debug!("{} got done signal", session.stat());
                // The receive loop must be gone before draining starts.
                session.rdone_wait().await;
                drain(session, queue_rx, &mut healthy).await;
                return;
            }

            message = queue_rx.recv() => match message {
                Some(message) => write_outbound(session, &message, &mut healthy).await,
                // The queue is only closed by the reaper, which runs after
                // this loop; still honor the shutdown order if it happens.
                None => {
                    session.stop();
                    session.rdone_wait().await;
                    return;
                }
            },

            _ = &mut cron => {
                if healthy {
                    if session.kind() == TransportKind::Ws {
                        if let Err(e) = session.transport().write_ping().await {
                            warn!("{} ping: {e}", session.stat());
                        }
                    }
                    if let Some(listener) = session.listener() {
                        listener.on_cron(session).await;
                    }
                }
                cron = timer.after(session.cron_period());
            }
        }
    }
}

async fn write_outbound<P: Send + Sync + 'static>(
    session: &Arc<Session<P>>,
    message: &P,
    healthy: &mut bool,
) {
    if !*healthy {
        debug!("{} dropping queued message after write failure", session.stat());
        return;
    }
    if let Err(e) = session.encode_and_write(message).await {
        error!("{} write: {e}", session.stat());
        session.stop();
        *healthy = false;
    }
}

/// Keep writing queued messages until the queue is empty or the close window
/// runs out.
async fn drain<P: Send + Sync + 'static>(
    session: &Arc<Session<P>>,
    queue_rx: &mut mpsc::Receiver<P>,
    healthy: &mut bool,
) {
    let started = Instant::now();
    let wait = session.wait_on_close();
    loop {
        if started.elapsed() >= wait {
            info!("{} drain window expired", session.stat());
            return;
        }
        match queue_rx.try_recv() {
            Ok(message) => write_outbound(session, &message, healthy).await,
            // Empty or closed either way: nothing left to drain.
            Err(_) => return,
        }
    }
}
