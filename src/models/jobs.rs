use std::{collections::BTreeMap, collections::HashMap, sync::Arc, time::Duration};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::Notify, time::Instant};
use tracing::{debug, error, info, warn};

pub type JobId = u32;
pub type JobExtras = BTreeMap<String, String>;

pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5 * 60 * 60);
pub const DEFAULT_JOB_DEADLINE: Duration = Duration::from_secs(30 * 60);
const DEFAULT_NETWORK_POLL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    Any,
    Unmetered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Offline,
    Metered,
    Unmetered,
}

impl NetworkType {
    pub fn is_satisfied_by(self, connectivity: Connectivity) -> bool {
        match (self, connectivity) {
            (_, Connectivity::Offline) => false,
            (NetworkType::Any, _) => true,
            (NetworkType::Unmetered, Connectivity::Unmetered) => true,
            (NetworkType::Unmetered, Connectivity::Metered) => false,
        }
    }
}

pub trait NetworkMonitor: Send + Sync {
    fn connectivity(&self) -> Connectivity;
}

/// Reports an unmetered connection at all times.
pub struct AlwaysOnline;

impl NetworkMonitor for AlwaysOnline {
    fn connectivity(&self) -> Connectivity {
        Connectivity::Unmetered
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_BACKOFF,
            max: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based): `initial * 2^(attempt-1)`,
    /// capped at `max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial
            .saturating_mul(1u32 << exponent)
            .min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: JobId,
    pub network: NetworkType,
    pub backoff: BackoffPolicy,
    pub deadline: Duration,
    pub extras: JobExtras,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSubmission {
    Scheduled,
    AlreadyRunning,
    Rejected,
}

impl JobSubmission {
    pub fn is_scheduled(self) -> bool {
        matches!(self, JobSubmission::Scheduled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    Finished,
    Reschedule,
}

/// Work invoked by a [`JobRunner`]. `on_start` runs on a blocking thread and
/// may perform network and disk I/O.
pub trait JobHandler: Send + Sync {
    fn on_start(&self, extras: &JobExtras) -> JobResult;

    /// The runner is reclaiming the job. Return true to have it retried.
    fn on_stop(&self, extras: &JobExtras) -> bool;

    /// The job ran out of time and will not be attempted again.
    fn on_abandon(&self, _extras: &JobExtras) {}
}

pub trait JobRunner: Send + Sync {
    fn schedule(&self, spec: JobSpec) -> JobSubmission;

    fn is_pending(&self, id: JobId) -> bool;

    fn stop(&self, id: JobId) -> bool;
}

/// Runs jobs as tasks on a tokio runtime. At most one job per id is in
/// flight; the id stays reserved from `schedule` until the job finishes,
/// is abandoned, or is stopped without rescheduling.
pub struct LocalJobRunner {
    runtime: Handle,
    handler: OnceCell<Arc<dyn JobHandler>>,
    network: Arc<dyn NetworkMonitor>,
    network_poll: Duration,
    in_flight: Arc<Mutex<HashMap<JobId, Arc<Notify>>>>,
}

impl LocalJobRunner {
    pub fn new(runtime: Handle, network: Arc<dyn NetworkMonitor>) -> Self {
        Self {
            runtime,
            handler: OnceCell::new(),
            network,
            network_poll: DEFAULT_NETWORK_POLL,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn with_network_poll(mut self, interval: Duration) -> Self {
        self.network_poll = interval;
        self
    }

    /// Installs the handler. Only the first registration takes effect.
    pub fn register_handler(&self, handler: Arc<dyn JobHandler>) -> bool {
        self.handler.set(handler).is_ok()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

impl JobRunner for LocalJobRunner {
    fn schedule(&self, spec: JobSpec) -> JobSubmission {
        let Some(handler) = self.handler.get().cloned() else {
            warn!(job = spec.id, "no job handler registered; rejecting job");
            return JobSubmission::Rejected;
        };

        let stop = Arc::new(Notify::new());
        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains_key(&spec.id) {
                debug!(job = spec.id, "job already in flight");
                return JobSubmission::AlreadyRunning;
            }
            in_flight.insert(spec.id, stop.clone());
        }

        info!(
            job = spec.id,
            network = ?spec.network,
            deadline_secs = spec.deadline.as_secs(),
            "job scheduled"
        );
        let in_flight = self.in_flight.clone();
        let network = self.network.clone();
        let poll = self.network_poll;
        self.runtime.spawn(async move {
            let id = spec.id;
            drive_job(handler, network, poll, spec, stop).await;
            in_flight.lock().remove(&id);
            debug!(job = id, "job released");
        });
        JobSubmission::Scheduled
    }

    fn is_pending(&self, id: JobId) -> bool {
        self.in_flight.lock().contains_key(&id)
    }

    fn stop(&self, id: JobId) -> bool {
        match self.in_flight.lock().get(&id) {
            Some(stop) => {
                stop.notify_one();
                true
            }
            None => false,
        }
    }
}

async fn drive_job(
    handler: Arc<dyn JobHandler>,
    network: Arc<dyn NetworkMonitor>,
    poll: Duration,
    spec: JobSpec,
    stop: Arc<Notify>,
) {
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        while !spec.network.is_satisfied_by(network.connectivity()) {
            if started.elapsed() + poll > spec.deadline {
                warn!(job = spec.id, "network constraint never satisfied; abandoning job");
                handler.on_abandon(&spec.extras);
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = stop.notified() => {
                    if !handler.on_stop(&spec.extras) {
                        return;
                    }
                }
            }
        }

        attempt += 1;
        debug!(job = spec.id, attempt, "job starting");
        let worker = handler.clone();
        let extras = spec.extras.clone();
        let mut task = tokio::task::spawn_blocking(move || worker.on_start(&extras));

        let outcome = tokio::select! {
            joined = &mut task => joined,
            _ = stop.notified() => {
                info!(job = spec.id, attempt, "job stopped");
                let reschedule = handler.on_stop(&spec.extras);
                // The attempt cannot be interrupted; wait for it so two
                // attempts never overlap.
                let interrupted = task.await;
                debug!(job = spec.id, attempt, ?interrupted, "stopped attempt settled");
                if !reschedule {
                    return;
                }
                match interrupted {
                    Ok(JobResult::Finished) => {
                        info!(job = spec.id, attempt, "stopped attempt had already finished");
                        return;
                    }
                    _ => Ok(JobResult::Reschedule),
                }
            }
        };

        match outcome {
            Ok(JobResult::Finished) => {
                info!(job = spec.id, attempt, "job finished");
                return;
            }
            Ok(JobResult::Reschedule) => {}
            Err(join_error) => {
                error!(job = spec.id, attempt, "job attempt aborted: {join_error}");
            }
        }

        let delay = spec.backoff.delay_for(attempt);
        if started.elapsed() + delay > spec.deadline {
            warn!(job = spec.id, attempt, "job deadline reached; abandoning");
            handler.on_abandon(&spec.extras);
            return;
        }
        debug!(job = spec.id, attempt, delay_ms = delay.as_millis() as u64, "job backing off");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.notified() => {
                if !handler.on_stop(&spec.extras) {
                    return;
                }
            }
        }
    }
}
