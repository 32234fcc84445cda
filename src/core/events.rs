use std::{collections::HashMap, sync::Arc};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

pub const EVENT_JOB_FINISHED: &str = "job-finished";
pub const EVENT_MODEL_DOWNLOADED: &str = "model-downloaded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    JobFinished,
    ModelDownloaded,
}

impl Signal {
    pub fn as_str(self) -> &'static str {
        match self {
            Signal::JobFinished => EVENT_JOB_FINISHED,
            Signal::ModelDownloaded => EVENT_MODEL_DOWNLOADED,
        }
    }
}

pub type SubscriptionId = u64;

type OneShot = Box<dyn FnOnce(Signal) + Send>;

#[derive(Default)]
struct BusInner {
    next_id: SubscriptionId,
    one_shot: HashMap<SubscriptionId, OneShot>,
    streams: Vec<Sender<Signal>>,
}

/// In-process pub/sub for the two lifecycle signals. One-shot listeners are
/// removed before they run, so each fires at most once.
#[derive(Clone, Default)]
pub struct NotificationBus {
    inner: Arc<Mutex<BusInner>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_once<F>(&self, listener: F) -> SubscriptionId
    where
        F: FnOnce(Signal) + Send + 'static,
    {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.one_shot.insert(id, Box::new(listener));
        id
    }

    /// Returns false if the listener already fired or was never registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.lock().one_shot.remove(&id).is_some()
    }

    /// Long-lived stream of every signal, for hosts that poll.
    pub fn subscribe(&self) -> Receiver<Signal> {
        let (tx, rx) = unbounded();
        self.inner.lock().streams.push(tx);
        rx
    }

    pub fn broadcast(&self, signal: Signal) {
        let listeners: Vec<OneShot> = {
            let mut inner = self.inner.lock();
            inner.streams.retain(|tx| tx.send(signal).is_ok());
            inner.one_shot.drain().map(|(_, listener)| listener).collect()
        };
        debug!(signal = signal.as_str(), listeners = listeners.len(), "broadcast");
        for listener in listeners {
            listener(signal);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().one_shot.len()
    }
}

pub fn emit_job_finished(bus: &NotificationBus) {
    bus.broadcast(Signal::JobFinished);
}

pub fn emit_model_downloaded(bus: &NotificationBus) {
    bus.broadcast(Signal::ModelDownloaded);
}
