// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! In-Progress Stream Tracker
//!
//! Process-wide registry of streams that are currently being drained. A
//! supervisor calls [`InProgressStreams::block_until_empty`] before any
//! maintenance so that no stream is mid-drain when it starts.
//!
//! The registry is a reusable barrier: it has no terminal state and re-arms
//! on the next registration after becoming empty.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::envelope::StreamKey;

/// How often a blocked waiter re-checks its cancellation token.
const CANCEL_POLL: Duration = Duration::from_millis(25);

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Opaque handle for one stream's pending work. Tokens compare by identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StreamToken {
    id: u64,
    stream: StreamKey,
}

impl StreamToken {
    pub fn new(stream: StreamKey) -> Self {
        Self {
            id: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
            stream,
        }
    }

    pub fn stream(&self) -> &StreamKey {
        &self.stream
    }
}

/// How a blocking wait ended. Only `Drained` means the registry is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Drained,
    Cancelled,
    TimedOut,
}

#[derive(Default)]
pub struct InProgressStreams {
    streams: Mutex<Vec<StreamToken>>,
    emptied: Condvar,
}

impl InProgressStreams {
    pub fn new() -> Self {
        Self::default()
    }

    // Registration and removal are single Vec operations; a poisoned lock
    // still holds a valid list.
    fn streams(&self) -> MutexGuard<'_, Vec<StreamToken>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, token: StreamToken) {
        let mut streams = self.streams();
        tracing::trace!("Stream {} in progress", token.stream);
        streams.push(token);
        self.emptied.notify_all();
    }

    /// Removes one registration of `token`. Returns `false` if it was not registered.
    pub fn deregister(&self, token: &StreamToken) -> bool {
        let mut streams = self.streams();
        let Some(index) = streams.iter().position(|t| t == token) else {
            return false;
        };
        streams.remove(index);
        tracing::trace!("Stream {} finished", token.stream);

        if streams.is_empty() {
            self.emptied.notify_all();
        }
        true
    }

    pub fn contains(&self, token: &StreamToken) -> bool {
        self.streams().contains(token)
    }

    pub fn is_empty(&self) -> bool {
        self.streams().is_empty()
    }

    pub fn len(&self) -> usize {
        self.streams().len()
    }

    /// Register `token` for the lifetime of the returned guard.
    pub fn enter(self: &Arc<Self>, token: StreamToken) -> InProgressGuard {
        self.register(token.clone());
        InProgressGuard {
            streams: Arc::clone(self),
            token,
        }
    }

    /// Block until no stream is in progress, or until `cancel` fires.
    ///
    /// Cancellation is a normal return and leaves the registry untouched.
    pub fn block_until_empty(&self, cancel: &CancellationToken) -> WaitOutcome {
        let mut streams = self.streams();
        while !streams.is_empty() {
            if cancel.is_cancelled() {
                tracing::debug!("Drain wait cancelled with {} streams in progress", streams.len());
                return WaitOutcome::Cancelled;
            }
            let (guard, _) = self
                .emptied
                .wait_timeout(streams, CANCEL_POLL)
                .unwrap_or_else(PoisonError::into_inner);
            streams = guard;
        }
        WaitOutcome::Drained
    }

    /// Block until no stream is in progress, or until `timeout` elapses.
    pub fn block_until_empty_timeout(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut streams = self.streams();
        while !streams.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!("Drain wait timed out with {} streams in progress", streams.len());
                return WaitOutcome::TimedOut;
            }
            let (guard, _) = self
                .emptied
                .wait_timeout(streams, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            streams = guard;
        }
        WaitOutcome::Drained
    }
}

/// Deregisters its token when dropped.
pub struct InProgressGuard {
    streams: Arc<InProgressStreams>,
    token: StreamToken,
}

impl InProgressGuard {
    pub fn token(&self) -> &StreamToken {
        &self.token
    }
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        self.streams.deregister(&self.token);
    }
}
