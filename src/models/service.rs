use std::sync::Weak;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use super::{
    jobs::{JobExtras, JobHandler, JobResult},
    manager::{ModelManager, UpdateOutcome},
    records::ManagedModel,
};
use crate::core::events::{self, NotificationBus};

pub const JOB_TYPE_KEY: &str = "job_type";
pub const MANAGED_MODEL_KEY: &str = "managed_model";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    CheckModelUpdate,
    DownloadModel,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::CheckModelUpdate => "check_model_update",
            JobKind::DownloadModel => "download_model",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "check_model_update" => Some(JobKind::CheckModelUpdate),
            "download_model" => Some(JobKind::DownloadModel),
            _ => None,
        }
    }
}

/// What a background job is asked to do, as carried in its extras.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub kind: JobKind,
    pub model: ManagedModel,
}

impl JobRequest {
    pub fn new(kind: JobKind, model: ManagedModel) -> Self {
        Self { kind, model }
    }

    pub fn to_extras(&self) -> Result<JobExtras> {
        let model = self
            .model
            .to_json_string()
            .context("serialize managed model for job")?;
        Ok(JobExtras::from([
            (JOB_TYPE_KEY.to_string(), self.kind.as_str().to_string()),
            (MANAGED_MODEL_KEY.to_string(), model),
        ]))
    }

    pub fn from_extras(extras: &JobExtras) -> Result<Self> {
        let kind = extras
            .get(JOB_TYPE_KEY)
            .ok_or_else(|| anyhow!("job extras missing {JOB_TYPE_KEY}"))?;
        let kind = JobKind::parse(kind).ok_or_else(|| anyhow!("unknown job type {kind}"))?;
        let model = extras
            .get(MANAGED_MODEL_KEY)
            .ok_or_else(|| anyhow!("job extras missing {MANAGED_MODEL_KEY}"))?;
        let model = ManagedModel::from_json_str(model).context("parse managed model from job")?;
        Ok(Self { kind, model })
    }
}

/// Bridges runner callbacks to the model manager and announces the result
/// on the notification bus.
pub struct ModelUpdateService {
    manager: Weak<ModelManager>,
    bus: NotificationBus,
}

impl ModelUpdateService {
    pub fn new(manager: Weak<ModelManager>, bus: NotificationBus) -> Self {
        Self { manager, bus }
    }
}

impl JobHandler for ModelUpdateService {
    fn on_start(&self, extras: &JobExtras) -> JobResult {
        let request = match JobRequest::from_extras(extras) {
            Ok(request) => request,
            Err(error) => {
                warn!("dropping malformed job: {error:#}");
                events::emit_job_finished(&self.bus);
                return JobResult::Finished;
            }
        };
        let Some(manager) = self.manager.upgrade() else {
            debug!("model manager gone; finishing job");
            events::emit_job_finished(&self.bus);
            return JobResult::Finished;
        };

        debug!(model = %request.model.model_id, kind = request.kind.as_str(), "running model job");
        match manager.run_job(&request) {
            UpdateOutcome::NoUpdate => {
                events::emit_job_finished(&self.bus);
                JobResult::Finished
            }
            UpdateOutcome::Updated(model) => {
                info!(%model, "new model version active");
                events::emit_model_downloaded(&self.bus);
                JobResult::Finished
            }
            UpdateOutcome::Failed => {
                warn!(model = %request.model.model_id, "model job failed; rescheduling");
                JobResult::Reschedule
            }
        }
    }

    fn on_stop(&self, _extras: &JobExtras) -> bool {
        info!("model job interrupted");
        events::emit_job_finished(&self.bus);
        true
    }

    fn on_abandon(&self, extras: &JobExtras) {
        let model = extras.get(MANAGED_MODEL_KEY).map(String::as_str).unwrap_or("?");
        warn!(%model, "giving up on model job until the next explicit check");
        events::emit_job_finished(&self.bus);
    }
}
