use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, warn};

use super::record::EventRecord;
use crate::core::settings::SessionHandle;

pub const MAX_EVENTS_TO_SEND: usize = 1000;

pub type SendCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Delivers one batch and reports the outcome through `done`, from any thread.
pub trait BatchSender: Send + Sync {
    fn send_batch(&self, events: Vec<EventRecord>, done: SendCallback);
}

/// Anything that accepts telemetry events.
pub trait EventSink: Send + Sync {
    fn track(&self, event: EventRecord);
}

struct QueueInner {
    session: SessionHandle,
    sender: Arc<dyn BatchSender>,
    pending: Mutex<VecDeque<EventRecord>>,
    in_flight: Mutex<Vec<EventRecord>>,
    flushing: AtomicBool,
}

impl QueueInner {
    fn flush(self: &Arc<Self>) {
        if self.pending.lock().is_empty() && self.in_flight.lock().is_empty() {
            return;
        }
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("flush already in progress");
            return;
        }

        let batch = {
            let drained: Vec<EventRecord> = self.pending.lock().drain(..).collect();
            let mut in_flight = self.in_flight.lock();
            in_flight.extend(drained);
            if in_flight.len() > MAX_EVENTS_TO_SEND {
                let excess = in_flight.len() - MAX_EVENTS_TO_SEND;
                in_flight.drain(..excess);
                warn!(dropped = excess, "event backlog over limit; dropping oldest events");
            }
            in_flight.clone()
        };

        debug!(events = batch.len(), "flushing events");
        let weak = Arc::downgrade(self);
        self.sender.send_batch(
            batch,
            Box::new(move |result| {
                if let Some(inner) = weak.upgrade() {
                    inner.complete(result);
                }
            }),
        );
    }

    fn complete(&self, result: Result<()>) {
        match result {
            Ok(()) => {
                let sent = {
                    let mut in_flight = self.in_flight.lock();
                    let sent = in_flight.len();
                    in_flight.clear();
                    sent
                };
                debug!(events = sent, "event batch delivered");
            }
            Err(error) => {
                warn!("event batch failed; keeping it for the next flush: {error:#}");
            }
        }
        self.flushing.store(false, Ordering::Release);
    }
}

/// Buffers telemetry and sends it in batches, with at most one send
/// outstanding at a time.
pub struct EventQueue {
    inner: Arc<QueueInner>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl EventQueue {
    pub fn new(session: SessionHandle, sender: Arc<dyn BatchSender>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                session,
                sender,
                pending: Mutex::new(VecDeque::new()),
                in_flight: Mutex::new(Vec::new()),
                flushing: AtomicBool::new(false),
            }),
            timer: Mutex::new(None),
        }
    }

    pub fn add(&self, event: EventRecord) {
        let settings = self.inner.session.settings();
        if settings.is_blacklisted(&event.event_type) {
            debug!(event = %event.event_type, "event type is blacklisted; dropping");
            return;
        }
        let queued = {
            let mut pending = self.inner.pending.lock();
            pending.push_back(event);
            pending.len()
        };
        if queued >= settings.track_batch_size {
            self.inner.flush();
        }
    }

    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Containment over not-yet-flushed events, by `EventRecord` equality.
    pub fn contains(&self, event: &EventRecord) -> bool {
        self.inner.pending.lock().iter().any(|queued| queued == event)
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.flushing.load(Ordering::Acquire)
    }

    pub fn clear_all(&self) {
        self.inner.pending.lock().clear();
        self.inner.in_flight.lock().clear();
        self.inner.flushing.store(false, Ordering::Release);
    }

    /// Starts the periodic flush. The period is re-read from the session
    /// before every wait, so refreshed settings apply on the next cycle.
    pub fn start_timer(&self, runtime: &Handle) {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }
        let weak: Weak<QueueInner> = Arc::downgrade(&self.inner);
        *timer = Some(runtime.spawn(async move {
            loop {
                let period = match weak.upgrade() {
                    Some(inner) => inner.session.settings().flush_interval(),
                    None => break,
                };
                tokio::time::sleep(period).await;
                match weak.upgrade() {
                    Some(inner) => inner.flush(),
                    None => break,
                }
            }
        }));
    }

    pub fn stop_timer(&self) {
        if let Some(task) = self.timer.lock().take() {
            task.abort();
        }
    }
}

impl EventSink for EventQueue {
    fn track(&self, event: EventRecord) {
        self.add(event);
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.stop_timer();
    }
}
