//! The receive loop: transport reads, incremental decoding, and dispatch.

use crate::error::{Result, SessionError};
use crate::listener::Inbound;
use crate::pool::buffer_pool;
use crate::session::{frame_into_message, Session, CONNECT_PING, DEFAULT_READ_BUF_LEN};
use crate::transport::TransportKind;
use bytes::{Buf, BytesMut};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use strand_codec::{CodecError, DecodeOutcome, Decoder};
use tracing::{debug, error, info, warn};

/// Drive the receive side until it stops, then latch `rDone`, request
/// shutdown, and report any carried error.
pub(crate) async fn run<P: Send + Sync + 'static>(session: Arc<Session<P>>) {
    let outcome = AssertUnwindSafe(recv_loop(&session)).catch_unwind().await;
    let error = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(panic) => Some(SessionError::Panicked(crate::panic_message(&panic))),
    };

    session.latch_rdone();
    session.stop();
    if let Some(error) = error {
        error!("{} receive loop: {error}", session.stat());
        if let Some(listener) = session.listener() {
            listener.on_error(&session, &error).await;
        }
    }
    info!("{} receive loop exiting", session.stat());
}

async fn recv_loop<P: Send + Sync + 'static>(session: &Arc<Session<P>>) -> Result<()> {
    match session.kind() {
        TransportKind::Tcp => {
            let decoder = session
                .decoder()
                .unwrap_or_else(|| panic!("{} stream session started without a decoder", session.stat()));
            recv_stream(session, decoder).await
        }
        TransportKind::Udp => {
            let decoder = session
                .decoder()
                .unwrap_or_else(|| panic!("{} datagram session started without a decoder", session.stat()));
            recv_datagrams(session, decoder).await
        }
        TransportKind::Ws => recv_frames(session, session.decoder()).await,
    }
}

/// Stream path: accumulate bytes and run the incremental decode contract.
async fn recv_stream<P: Send + Sync + 'static>(
    session: &Arc<Session<P>>,
    decoder: Arc<dyn Decoder<Item = P>>,
) -> Result<()> {
    let pool = buffer_pool();
    let mut chunk = pool.acquire(DEFAULT_READ_BUF_LEN);
    chunk.resize(DEFAULT_READ_BUF_LEN, 0);
    let mut pending = pool.acquire(DEFAULT_READ_BUF_LEN);

    let result = 'read: loop {
        if session.is_closed() {
            // A partial frame left in the accumulation buffer cannot become
            // a message anymore; abandon it.
            break 'read Ok(());
        }

        let n = match session.transport().read_stream(&mut chunk[..]).await {
            Ok(n) => n,
            Err(e) if e.is_timeout() => continue,
            Err(e) => break 'read Err(SessionError::Transport(e)),
        };
        if n == 0 {
            continue;
        }
        pending.extend_from_slice(&chunk[..n]);

        if let Err(e) = decode_buffered(session, decoder.as_ref(), &mut pending).await {
            break 'read Err(e);
        }
    };

    pool.release(chunk);
    pool.release(pending);
    result
}

/// Reinvoke the decoder until it stops making progress.
async fn decode_buffered<P: Send + Sync + 'static>(
    session: &Arc<Session<P>>,
    decoder: &dyn Decoder<Item = P>,
    pending: &mut BytesMut,
) -> Result<()> {
    loop {
        if pending.is_empty() {
            return Ok(());
        }
        match decoder.decode(&pending[..]) {
            Ok(DecodeOutcome::Complete { item, consumed }) => {
                check_message_length(session, consumed)?;
                session.stats().touch();
                session.dispatch(Inbound { payload: item, peer: None }).await;
                pending.advance(consumed.min(pending.len()));
            }
            Ok(DecodeOutcome::Skip(n)) if n > 0 => {
                check_message_length(session, n)?;
                pending.advance(n.min(pending.len()));
            }
            // Incomplete (or a zero skip): wait for more bytes.
            Ok(_) => return Ok(()),
            Err(e) => return Err(SessionError::Framing(e)),
        }
    }
}

/// Datagram path: one decoder invocation per datagram; bad datagrams are
/// dropped, not fatal.
async fn recv_datagrams<P: Send + Sync + 'static>(
    session: &Arc<Session<P>>,
    decoder: Arc<dyn Decoder<Item = P>>,
) -> Result<()> {
    let limit = session.max_message_length();
    let buf_len = if limit > 0 {
        (limit + DEFAULT_READ_BUF_LEN).min(2 * limit)
    } else {
        DEFAULT_READ_BUF_LEN
    };

    let pool = buffer_pool();
    let mut buf = pool.acquire(buf_len);
    buf.resize(buf_len, 0);

    let result = loop {
        if session.is_closed() {
            break Ok(());
        }

        let (n, peer) = match session.transport().read_datagram(&mut buf[..]).await {
            Ok(read) => read,
            Err(e) if e.is_timeout() => continue,
            Err(e) => break Err(SessionError::Transport(e)),
        };
        if n == 0 {
            continue;
        }
        if &buf[..n] == CONNECT_PING {
            debug!("{} connect ping from {peer}", session.stat());
            continue;
        }
        if limit > 0 && n > limit {
            warn!("{} datagram from {peer} too long: {n} > {limit}", session.stat());
            continue;
        }

        match decoder.decode(&buf[..n]) {
            Ok(DecodeOutcome::Complete { item, .. }) => {
                session.stats().touch();
                session
                    .dispatch(Inbound { payload: item, peer: Some(peer) })
                    .await;
            }
            Ok(_) => debug!("{} datagram from {peer} produced no message", session.stat()),
            Err(e) => warn!("{} datagram decode: {e}", session.stat()),
        }
    };

    pool.release(buf);
    result
}

/// Frame path: decode each frame when a decoder is installed, otherwise
/// deliver the raw frame bytes.
async fn recv_frames<P: Send + Sync + 'static>(
    session: &Arc<Session<P>>,
    decoder: Option<Arc<dyn Decoder<Item = P>>>,
) -> Result<()> {
    loop {
        if session.is_closed() {
            return Ok(());
        }

        let frame = match session.transport().read_frame().await {
            Ok(frame) => frame,
            Err(e) if e.is_timeout() => continue,
            Err(e) => return Err(SessionError::Transport(e)),
        };
        session.stats().touch();

        match &decoder {
            Some(decoder) => match decoder.decode(&frame) {
                Ok(DecodeOutcome::Complete { item, consumed }) => {
                    let limit = session.max_message_length();
                    if limit > 0 && consumed > limit {
                        warn!("{} frame too long: {consumed} > {limit}", session.stat());
                        continue;
                    }
                    session.dispatch(Inbound { payload: item, peer: None }).await;
                }
                Ok(_) => debug!("{} frame produced no message", session.stat()),
                Err(e) => warn!("{} frame decode: {e}", session.stat()),
            },
            None => match frame_into_message::<P>(frame) {
                Some(payload) => session.dispatch(Inbound { payload, peer: None }).await,
                // run() refuses this configuration; reaching it means the
                // message type changed out from under us.
                None => {
                    return Err(SessionError::Configuration(
                        "raw websocket delivery requires Bytes messages",
                    ))
                }
            },
        }
    }
}

/// Enforce the session message length cap; exceeding it is a framing error
/// on the stream path.
fn check_message_length<P: Send + Sync + 'static>(session: &Session<P>, length: usize) -> Result<()> {
    let limit = session.max_message_length();
    if limit > 0 && length > limit {
        return Err(SessionError::Framing(CodecError::TooLong { length, limit }));
    }
    Ok(())
}
