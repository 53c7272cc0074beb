//! Bounded reply reads.
//!
//! The device answers only when it finds something, so every read is a race
//! between the link, the tick budget and the host's restart signal. All three
//! are awaited together; nothing spins.

use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tokio::time::{self, Instant};

use crate::config::TICK;
use crate::tracing::prelude::*;

/// Raised by the host when the job in flight has become stale.
///
/// A raise with nobody waiting is remembered until the next wait or
/// [`clear`](Self::clear).
#[derive(Debug, Clone, Default)]
pub struct RestartSignal(Arc<Notify>);

impl RestartSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.notify_one();
    }

    pub async fn notified(&self) {
        self.0.notified().await;
    }

    /// Drop a pending raise, if any.
    pub fn clear(&self) {
        let _ = self.0.notified().now_or_never();
    }
}

#[derive(Debug)]
pub enum ReadOutcome {
    /// A whole reply arrived.
    Reply { frame: Bytes, first_byte_at: Instant },
    /// The tick budget ran out.
    Timeout { at: Instant },
    /// The link failed or was closed from the far end.
    LinkError(io::Error),
    /// The restart signal fired first.
    Restarted { at: Instant },
}

enum Event {
    Read(io::Result<usize>),
    Restart,
    Tick,
}

/// Accumulates reply bytes across waits.
///
/// Bytes of a partial reply stay buffered when a wait ends early, and are
/// completed by the next wait. [`reset`](Self::reset) drops them; the session
/// calls it whenever the link is reopened.
#[derive(Debug, Default)]
pub struct ReplyReader {
    pending: BytesMut,
    first_byte_at: Option<Instant>,
}

impl ReplyReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.first_byte_at = None;
    }

    /// Bytes of an incomplete reply currently held.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// The job the device is working on changed at `at`. A reply still being
    /// assembled cannot have started before then.
    pub fn job_started(&mut self, at: Instant) {
        if let Some(first) = self.first_byte_at.as_mut() {
            *first = (*first).max(at);
        }
    }

    /// Wait up to `read_count` ticks for a `frame_len`-byte reply.
    ///
    /// Never reads past the end of the frame, so a following reply stays in
    /// the link for the next call.
    pub async fn read_reply<R>(
        &mut self,
        link: &mut R,
        frame_len: usize,
        read_count: u32,
        restart: Option<&RestartSignal>,
    ) -> ReadOutcome
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let deadline = Instant::now() + TICK * read_count;
        self.read_until(link, frame_len, deadline, restart).await
    }

    /// Like [`read_reply`](Self::read_reply), but against a fixed deadline,
    /// so a window can be shared by several reads without losing time to
    /// rounding. A reply already buffered is returned even when the deadline
    /// has passed.
    pub async fn read_until<R>(
        &mut self,
        link: &mut R,
        frame_len: usize,
        deadline: Instant,
        restart: Option<&RestartSignal>,
    ) -> ReadOutcome
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut tick_end = (Instant::now() + TICK).min(deadline);
        let mut chunk = [0u8; 64];

        loop {
            if self.pending.len() >= frame_len {
                let frame = self.pending.split_to(frame_len).freeze();
                let first_byte_at = self.first_byte_at.take().unwrap_or_else(Instant::now);
                trace!(reply = %hex::encode(&frame), "Reply.");
                return ReadOutcome::Reply {
                    frame,
                    first_byte_at,
                };
            }

            let want = (frame_len - self.pending.len()).min(chunk.len());
            let event = tokio::select! {
                biased;
                result = link.read(&mut chunk[..want]) => Event::Read(result),
                _ = wait_for(restart) => Event::Restart,
                _ = time::sleep_until(tick_end) => Event::Tick,
            };

            match event {
                Event::Read(Ok(0)) => {
                    return ReadOutcome::LinkError(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "link closed",
                    ));
                }
                Event::Read(Ok(n)) => {
                    if self.first_byte_at.is_none() {
                        self.first_byte_at = Some(Instant::now());
                    }
                    self.pending.extend_from_slice(&chunk[..n]);
                }
                Event::Read(Err(e)) => return ReadOutcome::LinkError(e),
                Event::Restart => {
                    return ReadOutcome::Restarted { at: Instant::now() };
                }
                Event::Tick => {
                    if tick_end >= deadline {
                        return ReadOutcome::Timeout { at: Instant::now() };
                    }
                    tick_end = (tick_end + TICK).min(deadline);
                }
            }
        }
    }
}

async fn wait_for(restart: Option<&RestartSignal>) {
    match restart {
        Some(signal) => signal.notified().await,
        None => std::future::pending().await,
    }
}
