// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Fan-out of incoming events to one worker per stream.
//!
//! # Guarantees
//! - Events for one stream key are processed one at a time, in arrival order.
//!   Different keys run concurrently.
//! - A key's token sits in the [`InProgressStreams`] tracker from the moment its
//!   first job is queued until its queue is empty, so [`StreamDispatcher::drain`]
//!   returns only once every accepted event has been through the engine.
//! - Released events reach the handler in version order with no gaps. When the
//!   handler fails, that event and every later release of its stream are parked
//!   in the store. Parked events are redelivered, in order, before the stream's
//!   next event and by [`StreamDispatcher::retry_parked`]. Delivery is at least once.

use crate::errors::NodeError;
use crate::handler::EventHandler;
use crate::telemetry::{
    DRAIN_WAIT_SECONDS, EVENTS_PARKED, EVENTS_RECEIVED, EVENTS_REJECTED, EVENTS_RELEASED,
    HANDLER_FAILURES, STREAMS_IN_PROGRESS,
};
use event_buffer::store::{
    EventBufferStore, ParkedEvent, ParkedEventStore, ProcessedEvent, ProcessedEventStore,
};
use event_buffer::{
    ConsecutiveEventBuffer, EventEnvelope, InProgressStreams, StreamKey, StreamToken, WaitOutcome,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Work queued on a stream's worker.
enum Job {
    Event(EventEnvelope),
    /// Redeliver parked events only.
    Retry,
}

struct Shared<S> {
    engine: ConsecutiveEventBuffer<S>,
    handler: Arc<dyn EventHandler>,
    tracker: Arc<InProgressStreams>,
    workers: Mutex<HashMap<StreamKey, UnboundedSender<Job>>>,
    accepting: AtomicBool,
}

impl<S> Shared<S>
where
    S: EventBufferStore + ProcessedEventStore + ParkedEventStore + 'static,
{
    fn workers(&self) -> MutexGuard<'_, HashMap<StreamKey, UnboundedSender<Job>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report_in_progress(&self) {
        metrics::gauge!(STREAMS_IN_PROGRESS, self.tracker.len() as f64);
    }

    fn process(&self, key: &StreamKey, job: Job) {
        let blocked = !self.redeliver_parked(key);
        if let Job::Event(event) = job {
            self.release(key, event, blocked);
        }
    }

    /// Runs one event through the engine and hands everything it releases to
    /// the handler. Once the stream is blocked, releases are parked instead.
    fn release(&self, key: &StreamKey, event: EventEnvelope, mut blocked: bool) {
        let name = event.name.clone();
        let released = match self.engine.accept_event(event) {
            Ok(released) => released,
            Err(e) => {
                metrics::counter!(EVENTS_REJECTED, 1);
                error!("Failed to accept {}: {}", name, e);
                return;
            }
        };
        debug!("{} -> {:?}", name, released.disposition());

        for item in released {
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    error!("Failed to release buffered event after {}: {}", name, e);
                    break;
                }
            };
            metrics::counter!(EVENTS_RELEASED, 1);

            if blocked {
                if !self.park(key, &event, 0, None) {
                    break;
                }
                continue;
            }

            if let Err(e) = self.handler.handle(&event) {
                metrics::counter!(HANDLER_FAILURES, 1);
                error!(
                    "Handler failed for {} v{:?} of {}: {}",
                    event.name, event.version, key, e
                );
                if !self.park(key, &event, 1, Some(e.to_string())) {
                    break;
                }
                blocked = true;
                continue;
            }
            self.record_processed(&event);
        }
    }

    /// Stores a released event for redelivery. Returns false if it could not be stored.
    fn park(
        &self,
        key: &StreamKey,
        event: &EventEnvelope,
        attempts: u32,
        last_error: Option<String>,
    ) -> bool {
        let version = event.version.unwrap_or_default();
        let payload = match self.engine.serializer().serialize(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Cannot park {} v{} of {}: {}", event.name, version, key, e);
                return false;
            }
        };
        let row = ParkedEvent {
            key: key.clone(),
            version,
            payload,
            attempts,
            last_error,
        };
        match self.engine.store().park(&row) {
            Ok(()) => {
                metrics::counter!(EVENTS_PARKED, 1);
                warn!("Parked {} v{} of {}", event.name, version, key);
                true
            }
            Err(e) => {
                error!("Failed to park {} v{} of {}: {}", event.name, version, key, e);
                false
            }
        }
    }

    /// Hands parked events back to the handler in version order. Returns true
    /// once nothing is parked for `key`.
    fn redeliver_parked(&self, key: &StreamKey) -> bool {
        let store = self.engine.store();
        let parked = match store.parked(key) {
            Ok(parked) => parked,
            Err(e) => {
                error!("Failed to read parked events of {}: {}", key, e);
                return false;
            }
        };

        for mut row in parked {
            let event = match self.engine.serializer().deserialize(&row.payload) {
                Ok(event) => event,
                Err(e) => {
                    error!("Parked v{} of {} is unreadable: {}", row.version, key, e);
                    return false;
                }
            };

            if let Err(e) = self.handler.handle(&event) {
                metrics::counter!(HANDLER_FAILURES, 1);
                row.attempts = row.attempts.saturating_add(1);
                row.last_error = Some(e.to_string());
                warn!(
                    "Redelivery of {} v{} of {} failed (attempt {}): {}",
                    event.name, row.version, key, row.attempts, e
                );
                if let Err(e) = store.park(&row) {
                    error!("Failed to update parked v{} of {}: {}", row.version, key, e);
                }
                return false;
            }

            self.record_processed(&event);
            if let Err(e) = store.unpark(key, row.version) {
                error!("Failed to unpark v{} of {}: {}", row.version, key, e);
                return false;
            }
            info!("Redelivered parked {} v{} of {}", event.name, row.version, key);
        }
        true
    }

    fn record_processed(&self, event: &EventEnvelope) {
        let Some(event_number) = event.event_number else {
            return;
        };
        let item = ProcessedEvent {
            previous_event_number: event.previous_event_number.unwrap_or(0),
            event_number,
            source: event.resolved_source().to_string(),
            component: self.engine.component().to_string(),
        };
        if let Err(e) = self.engine.store().save(&item) {
            warn!("Failed to record processed event {}: {}", event_number, e);
        }
    }
}

/// Routes events to per-stream workers in front of a [`ConsecutiveEventBuffer`].
pub struct StreamDispatcher<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for StreamDispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S> StreamDispatcher<S>
where
    S: EventBufferStore + ProcessedEventStore + ParkedEventStore + 'static,
{
    pub fn new(engine: ConsecutiveEventBuffer<S>, handler: Arc<dyn EventHandler>) -> Self {
        Self::with_tracker(engine, handler, Arc::new(InProgressStreams::new()))
    }

    pub fn with_tracker(
        engine: ConsecutiveEventBuffer<S>,
        handler: Arc<dyn EventHandler>,
        tracker: Arc<InProgressStreams>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine,
                handler,
                tracker,
                workers: Mutex::new(HashMap::new()),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    pub fn engine(&self) -> &ConsecutiveEventBuffer<S> {
        &self.shared.engine
    }

    pub fn tracker(&self) -> &Arc<InProgressStreams> {
        &self.shared.tracker
    }

    /// Streams with queued or running work.
    pub fn in_progress(&self) -> usize {
        self.shared.tracker.len()
    }

    /// Validates `event` and queues it on its stream's worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn dispatch(&self, event: EventEnvelope) -> Result<(), NodeError> {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            metrics::counter!(EVENTS_REJECTED, 1);
            return Err(NodeError::ShuttingDown);
        }
        let (key, _) = match event.ordering_key(self.shared.engine.component()) {
            Ok(key) => key,
            Err(e) => {
                metrics::counter!(EVENTS_REJECTED, 1);
                warn!("Rejected {}: {}", event.name, e);
                return Err(e.into());
            }
        };
        metrics::counter!(EVENTS_RECEIVED, 1);
        self.enqueue(key, Job::Event(event))
    }

    /// Queues a redelivery pass on every stream of this component with parked
    /// events. Returns the number of streams queued.
    pub fn retry_parked(&self) -> Result<usize, NodeError> {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(NodeError::ShuttingDown);
        }
        let component = self.shared.engine.component();
        let keys: Vec<_> = self
            .shared
            .engine
            .store()
            .parked_keys()?
            .into_iter()
            .filter(|key| key.component == component)
            .collect();

        for key in &keys {
            self.enqueue(key.clone(), Job::Retry)?;
        }
        if !keys.is_empty() {
            info!("Retrying parked events on {} stream(s)", keys.len());
        }
        Ok(keys.len())
    }

    fn enqueue(&self, key: StreamKey, job: Job) -> Result<(), NodeError> {
        let mut workers = self.shared.workers();
        if let Some(tx) = workers.get(&key) {
            // The worker removes its sender under this lock before exiting.
            if tx.send(job).is_ok() {
                return Ok(());
            }
            return Err(NodeError::Internal(format!("worker for {} is gone", key)));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(job).is_err() {
            return Err(NodeError::Internal(format!("worker for {} is gone", key)));
        }
        let token = StreamToken::new(key.clone());
        self.shared.tracker.register(token.clone());
        self.shared.report_in_progress();
        workers.insert(key.clone(), tx);
        drop(workers);

        debug!("Starting worker for {}", key);
        tokio::spawn(run_worker(self.shared.clone(), key, token, rx));
        Ok(())
    }

    /// Waits until no stream is in progress, `timeout` passes, or `cancel` fires.
    pub async fn drain(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, NodeError> {
        let start = Instant::now();
        let waiter = cancel.child_token();
        let tracker = self.shared.tracker.clone();
        let blocking = waiter.clone();
        let wait = tokio::task::spawn_blocking(move || tracker.block_until_empty(&blocking));

        let outcome = match tokio::time::timeout(timeout, wait).await {
            Ok(joined) => joined.map_err(|e| NodeError::Internal(e.to_string()))?,
            Err(_) => {
                waiter.cancel();
                WaitOutcome::TimedOut
            }
        };

        metrics::histogram!(DRAIN_WAIT_SECONDS, start.elapsed().as_secs_f64());
        match outcome {
            WaitOutcome::Drained => debug!("Drained in {:?}", start.elapsed()),
            other => warn!(
                "Drain ended {:?} with {} stream(s) in progress",
                other,
                self.in_progress()
            ),
        }
        Ok(outcome)
    }

    /// Stops accepting events and waits for queued work to finish.
    pub async fn shutdown(&self, timeout: Duration) -> Result<WaitOutcome, NodeError> {
        self.shared.accepting.store(false, Ordering::SeqCst);
        info!("Dispatcher shutting down, {} stream(s) in progress", self.in_progress());
        self.drain(timeout, &CancellationToken::new()).await
    }
}

async fn run_worker<S>(
    shared: Arc<Shared<S>>,
    key: StreamKey,
    token: StreamToken,
    mut rx: UnboundedReceiver<Job>,
) where
    S: EventBufferStore + ProcessedEventStore + ParkedEventStore + 'static,
{
    loop {
        let next = {
            let mut workers = shared.workers();
            match rx.try_recv() {
                Ok(job) => Some(job),
                Err(_) => {
                    workers.remove(&key);
                    shared.tracker.deregister(&token);
                    None
                }
            }
        };
        let Some(job) = next else {
            break;
        };

        let worker = shared.clone();
        let job_key = key.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || worker.process(&job_key, job)).await {
            error!("Worker for {} failed: {}", key, e);
        }
    }

    shared.report_in_progress();
    debug!("Worker for {} finished", key);
}
