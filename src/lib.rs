//! On-device model version lifecycle and telemetry event queue.
//!
//! [`SdkContext::configure`] builds every component: the persistent store,
//! the session and its remote settings, the telemetry [`EventQueue`], the
//! background job runner and the [`ModelManager`] that decides when to
//! check for, download and activate new model versions.

pub mod core;
pub mod models;
pub mod store;
pub mod telemetry;

pub use crate::core::{
    config::SdkConfig,
    context::{Collaborators, SdkContext},
    error::{ConfigError, SdkError},
    events::{NotificationBus, Signal},
    session::SessionManager,
    settings::{Session, SessionHandle, SessionSettings},
};
pub use models::{
    DownloadConfig, JobSubmission, LoadStatus, ManagedModel, ModelManager, OnDeviceModel,
    UpdateOutcome,
};
pub use store::{FileStore, KeyValueStore, MemoryStore, Preferences, StoreError};
pub use telemetry::{EventQueue, EventRecord, ModelEventName};
