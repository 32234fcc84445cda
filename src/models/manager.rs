use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    download::ModelDownloader,
    jobs::{BackoffPolicy, JobRunner, JobSpec, JobSubmission, NetworkType, DEFAULT_JOB_DEADLINE},
    metadata::stable_job_id,
    records::{DownloadConfig, ManagedModel, OnDeviceModel},
    service::{JobKind, JobRequest},
};
use crate::{
    core::events::NotificationBus,
    store::{Preferences, StoreError},
    telemetry::{factory, EventSink, ModelApi, ModelEventName},
};

pub const UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub ota_updates_enabled: bool,
    pub backoff: BackoffPolicy,
    pub deadline: Duration,
    pub update_check_interval: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            ota_updates_enabled: false,
            backoff: BackoffPolicy::default(),
            deadline: DEFAULT_JOB_DEADLINE,
            update_check_interval: UPDATE_CHECK_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    NoUpdate,
    Updated(OnDeviceModel),
    /// Transient failure; the job should be retried.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// The listener was called before `load_model` returned.
    Ready,
    /// The listener fires when the scheduled or running job ends.
    Pending,
    /// No job could be scheduled; the listener was called with `None`.
    Rejected,
}

/// Owns the model version lifecycle: when to check, what to download, and
/// which on-device file is active.
pub struct ModelManager {
    prefs: Preferences,
    api: Arc<dyn ModelApi>,
    downloader: Arc<dyn ModelDownloader>,
    runner: Arc<dyn JobRunner>,
    telemetry: Arc<dyn EventSink>,
    bus: NotificationBus,
    options: ManagerOptions,
}

impl ModelManager {
    pub fn new(
        prefs: Preferences,
        api: Arc<dyn ModelApi>,
        downloader: Arc<dyn ModelDownloader>,
        runner: Arc<dyn JobRunner>,
        telemetry: Arc<dyn EventSink>,
        bus: NotificationBus,
        options: ManagerOptions,
    ) -> Self {
        Self {
            prefs,
            api,
            downloader,
            runner,
            telemetry,
            bus,
            options,
        }
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn check_for_update(&self, model: &ManagedModel, allow_metered: bool) -> JobSubmission {
        self.submit(JobKind::CheckModelUpdate, model, allow_metered)
    }

    /// Schedules a download of the version already described by
    /// `model.download_config`, skipping the version check.
    pub fn download_model_version(&self, model: &ManagedModel, allow_metered: bool) -> JobSubmission {
        if model.download_config.is_none() {
            warn!(model = %model.model_id, "download requested without a download config");
            return JobSubmission::Rejected;
        }
        self.submit(JobKind::DownloadModel, model, allow_metered)
    }

    fn submit(&self, kind: JobKind, model: &ManagedModel, allow_metered: bool) -> JobSubmission {
        let id = stable_job_id(&model.model_id);
        if self.runner.is_pending(id) {
            debug!(model = %model.model_id, job = id, "model job already pending");
            return JobSubmission::AlreadyRunning;
        }

        let extras = match JobRequest::new(kind, model.clone()).to_extras() {
            Ok(extras) => extras,
            Err(error) => {
                error!(model = %model.model_id, "cannot build job: {error:#}");
                return JobSubmission::Rejected;
            }
        };
        let spec = JobSpec {
            id,
            network: if allow_metered {
                NetworkType::Any
            } else {
                NetworkType::Unmetered
            },
            backoff: self.options.backoff,
            deadline: self.options.deadline,
            extras,
        };
        let submission = self.runner.schedule(spec);
        info!(model = %model.model_id, kind = kind.as_str(), ?submission, "model job submitted");
        submission
    }

    pub fn run_job(&self, request: &JobRequest) -> UpdateOutcome {
        match request.kind {
            JobKind::CheckModelUpdate => self.run_check(&request.model),
            JobKind::DownloadModel => self.download_model(&request.model),
        }
    }

    /// Asks the backend for the active version and downloads it if it
    /// differs from the local one.
    pub fn run_check(&self, model: &ManagedModel) -> UpdateOutcome {
        let body = match self
            .api
            .fetch_active_version(&model.model_id, model.pinned_version)
        {
            Ok(body) => body,
            Err(error) => {
                warn!(model = %model.model_id, "active version request failed: {error:#}");
                return UpdateOutcome::Failed;
            }
        };
        let config = match DownloadConfig::from_response(&body) {
            Ok(config) => config,
            Err(error) => {
                warn!(model = %model.model_id, "ignoring malformed active version: {error:#}");
                return UpdateOutcome::NoUpdate;
            }
        };

        let local_version = self.active_version(&model.model_id);
        if local_version == Some(config.version) {
            if let Err(error) = self.update_from_server_configs(
                &model.model_id,
                config.tags.clone(),
                config.metadata.clone(),
            ) {
                warn!(model = %model.model_id, "could not refresh model metadata: {error}");
            }
            info!(model = %model.model_id, version = config.version, "model is up to date");
            return UpdateOutcome::NoUpdate;
        }

        info!(
            model = %model.model_id,
            local = ?local_version,
            remote = config.version,
            "new model version available"
        );
        let managed = model.clone().with_download_config(config);
        self.download_model(&managed)
    }

    /// Downloads `model.download_config`, activates the result, and removes
    /// the file it supersedes.
    pub fn download_model(&self, model: &ManagedModel) -> UpdateOutcome {
        let Some(config) = model.download_config.as_ref() else {
            warn!(model = %model.model_id, "no download config; nothing to download");
            return UpdateOutcome::NoUpdate;
        };

        info!(model = %model.model_id, version = config.version, "starting model download");
        let started = Instant::now();
        let path = match self.downloader.download(&model.model_id, config) {
            Ok(path) => path,
            Err(error) => {
                warn!(
                    model = %model.model_id,
                    version = config.version,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "model download failed: {error:#}"
                );
                return UpdateOutcome::Failed;
            }
        };
        let elapsed_ns = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);

        let Some(downloaded) = OnDeviceModel::from_download(model, &path) else {
            return UpdateOutcome::NoUpdate;
        };
        let previous = match self.prefs.saved_model(&model.model_id) {
            Ok(previous) => previous,
            Err(error) => {
                warn!(model = %model.model_id, "ignoring unreadable active model: {error}");
                None
            }
        };

        if let Err(error) = self.prefs.save_model(&downloaded) {
            error!(model = %model.model_id, "could not activate downloaded model: {error}");
            return UpdateOutcome::Failed;
        }
        self.telemetry.track(factory::custom_timing(
            ModelEventName::ModelDownloadCompleted,
            &downloaded,
            elapsed_ns,
        ));

        if let Some(previous) = previous {
            if previous.local_path != downloaded.local_path && !previous.is_bundled() {
                previous.delete_model_file();
            }
        }
        UpdateOutcome::Updated(downloaded)
    }

    /// Registers the model the host shipped with. Reports its install once
    /// per version and adopts it as active when nothing usable is active.
    pub fn handle_model_initialized(&self, model: &OnDeviceModel) -> Result<(), StoreError> {
        let model_id = model.model_id();
        if !self.prefs.has_tracked_install(model_id, model.version)? {
            self.telemetry.track(factory::install_event(model));
            self.prefs.mark_install_tracked(model_id, model.version)?;
        }

        let active = match self.prefs.saved_model(model_id) {
            Ok(active) => active,
            Err(StoreError::Serialization(error)) => {
                warn!(model = model_id, "replacing unreadable active model: {error}");
                None
            }
            Err(error) => return Err(error),
        };

        match active {
            None => {
                debug!(%model, "no active model; adopting initialized model");
                self.prefs.save_model(model)
            }
            Some(active) if !active.file_exists() || active.version == model.version => {
                debug!(%model, "refreshing active model record");
                self.prefs.save_model(model)
            }
            Some(_) => Ok(()),
        }
    }

    pub fn active_model(&self, model_id: &str) -> Option<OnDeviceModel> {
        match self.prefs.saved_model(model_id) {
            Ok(model) => model,
            Err(error) => {
                warn!(model = model_id, "unreadable active model: {error}");
                None
            }
        }
    }

    pub fn active_version(&self, model_id: &str) -> Option<i32> {
        match self.prefs.active_version(model_id) {
            Ok(version) => version,
            Err(error) => {
                warn!(model = model_id, "unreadable active version: {error}");
                None
            }
        }
    }

    /// Rewrites tags and metadata of the active model. Returns false when no
    /// model is active.
    pub fn update_from_server_configs(
        &self,
        model_id: &str,
        tags: BTreeSet<String>,
        metadata: BTreeMap<String, String>,
    ) -> Result<bool, StoreError> {
        let Some(mut model) = self.prefs.saved_model(model_id)? else {
            return Ok(false);
        };
        model.tags = tags;
        model.metadata = metadata;
        self.prefs.save_model(&model)?;
        Ok(true)
    }

    /// Hands `listener` the active model once it satisfies the pinned version,
    /// scheduling a check first if it does not yet.
    pub fn load_model<F>(&self, model: &ManagedModel, allow_metered: bool, listener: F) -> LoadStatus
    where
        F: FnOnce(Option<OnDeviceModel>) + Send + 'static,
    {
        if let Some(active) = self.active_model(&model.model_id) {
            if active.pinned_version() == model.pinned_version {
                listener(Some(active));
                return LoadStatus::Ready;
            }
        }

        let slot = Arc::new(Mutex::new(Some(listener)));
        let waiting = slot.clone();
        let prefs = self.prefs.clone();
        let model_id = model.model_id.clone();
        let subscription = self.bus.subscribe_once(move |signal| {
            let Some(listener) = waiting.lock().take() else {
                return;
            };
            let active = prefs.saved_model(&model_id).ok().flatten();
            debug!(model = %model_id, signal = signal.as_str(), found = active.is_some(), "model load settled");
            listener(active);
        });

        match self.check_for_update(model, allow_metered) {
            JobSubmission::Scheduled | JobSubmission::AlreadyRunning => LoadStatus::Pending,
            JobSubmission::Rejected => {
                self.bus.unsubscribe(subscription);
                if let Some(listener) = slot.lock().take() {
                    listener(None);
                }
                LoadStatus::Rejected
            }
        }
    }

    pub fn tracker(self: &Arc<Self>, model: ManagedModel, allow_metered: bool) -> ModelUpdateTracker {
        ModelUpdateTracker {
            manager: self.clone(),
            model,
            allow_metered,
            last_checked: Mutex::new(None),
        }
    }
}

/// Rate-limits update checks for one model.
pub struct ModelUpdateTracker {
    manager: Arc<ModelManager>,
    model: ManagedModel,
    allow_metered: bool,
    last_checked: Mutex<Option<Instant>>,
}

impl ModelUpdateTracker {
    pub fn model(&self) -> &ManagedModel {
        &self.model
    }

    /// Launches a check job if OTA updates are on and the last launch was at
    /// least one check interval ago. Returns whether a launch was attempted.
    pub fn check_for_new_active_version(&self) -> bool {
        let options = self.manager.options();
        if !options.ota_updates_enabled {
            return false;
        }
        {
            let mut last_checked = self.last_checked.lock();
            if let Some(at) = *last_checked {
                if at.elapsed() < options.update_check_interval {
                    return false;
                }
            }
            *last_checked = Some(Instant::now());
        }
        let submission = self.manager.check_for_update(&self.model, self.allow_metered);
        debug!(
            model = %self.model.model_id,
            scheduled = submission.is_scheduled(),
            "periodic update check"
        );
        true
    }
}
