mod download;
pub mod jobs;
mod manager;
mod metadata;
mod records;
mod service;

pub use download::{
    artifact_file_name, download_model_file, download_with_progress, DownloadOutcome,
    DownloadPlan, HttpDownloader, ModelDownloader, CHUNK_SIZE,
};
pub use jobs::{
    AlwaysOnline, BackoffPolicy, Connectivity, JobExtras, JobHandler, JobId, JobResult,
    JobRunner, JobSpec, JobSubmission, LocalJobRunner, NetworkMonitor, NetworkType,
};
pub use manager::{
    LoadStatus, ManagerOptions, ModelManager, ModelUpdateTracker, UpdateOutcome,
    UPDATE_CHECK_INTERVAL,
};
pub use metadata::{compute_sha256, stable_job_id};
pub use records::{DownloadConfig, ManagedModel, OnDeviceModel, BUNDLED_ASSET_ROOT};
pub use service::{JobKind, JobRequest, ModelUpdateService, JOB_TYPE_KEY, MANAGED_MODEL_KEY};
