use std::{sync::Arc, time::Duration};

use tokio::runtime::Runtime;
use tracing::info;

use super::{
    config::SdkConfig,
    error::SdkError,
    events::NotificationBus,
    session::{bootstrap_session, SessionManager},
    settings::SessionHandle,
};
use crate::{
    models::{
        AlwaysOnline, HttpDownloader, LocalJobRunner, ManagerOptions, ModelDownloader,
        ModelManager, ModelUpdateService, NetworkMonitor,
    },
    store::{FileStore, KeyValueStore, Preferences},
    telemetry::{ApiClient, BatchSender, EventQueue, HttpBatchSender, ModelApi, SessionApi},
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Replacements for the default collaborators. Anything left `None` is built
/// from the config.
#[derive(Default)]
pub struct Collaborators {
    pub store: Option<Arc<dyn KeyValueStore>>,
    pub model_api: Option<Arc<dyn ModelApi>>,
    pub session_api: Option<Arc<dyn SessionApi>>,
    pub downloader: Option<Arc<dyn ModelDownloader>>,
    pub batch_sender: Option<Arc<dyn BatchSender>>,
    pub network: Option<Arc<dyn NetworkMonitor>>,
    pub manager_options: Option<ManagerOptions>,
}

/// Everything the SDK runs on, built once at startup and shared from here.
pub struct SdkContext {
    runtime: Runtime,
    config: SdkConfig,
    prefs: Preferences,
    bus: NotificationBus,
    sessions: Arc<SessionManager>,
    queue: Arc<EventQueue>,
    runner: Arc<LocalJobRunner>,
    models: Arc<ModelManager>,
}

impl SdkContext {
    pub fn configure(config: SdkConfig) -> Result<Self, SdkError> {
        Self::with_collaborators(config, Collaborators::default())
    }

    pub fn with_collaborators(config: SdkConfig, parts: Collaborators) -> Result<Self, SdkError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("modelsync-worker")
            .enable_all()
            .build()
            .map_err(SdkError::Runtime)?;
        let handle = runtime.handle().clone();

        let store: Arc<dyn KeyValueStore> = match parts.store {
            Some(store) => store,
            None => Arc::new(FileStore::open(config.resolve_store_path()?)?),
        };
        let prefs = Preferences::new(store);
        let session = SessionHandle::new(bootstrap_session(&prefs, &config)?);
        let api = Arc::new(ApiClient::new(config.api_base.clone(), session.clone()));

        let batch_sender: Arc<dyn BatchSender> = match parts.batch_sender {
            Some(sender) => sender,
            None => Arc::new(HttpBatchSender::new(api.clone(), handle.clone())),
        };
        let queue = Arc::new(EventQueue::new(session.clone(), batch_sender));
        queue.start_timer(&handle);

        let session_api: Arc<dyn SessionApi> = match parts.session_api {
            Some(session_api) => session_api,
            None => api.clone(),
        };
        let sessions = Arc::new(SessionManager::new(
            prefs.clone(),
            session,
            session_api,
            queue.clone(),
            handle.clone(),
        ));

        let bus = NotificationBus::new();
        let network: Arc<dyn NetworkMonitor> = match parts.network {
            Some(network) => network,
            None => Arc::new(AlwaysOnline),
        };
        let runner = Arc::new(LocalJobRunner::new(handle.clone(), network));
        let downloader: Arc<dyn ModelDownloader> = match parts.downloader {
            Some(downloader) => downloader,
            None => Arc::new(HttpDownloader::new(config.resolve_files_dir()?)),
        };
        let model_api: Arc<dyn ModelApi> = match parts.model_api {
            Some(model_api) => model_api,
            None => api,
        };
        let options = parts.manager_options.unwrap_or_else(|| ManagerOptions {
            ota_updates_enabled: config.ota_updates_enabled,
            ..ManagerOptions::default()
        });
        let models = Arc::new(ModelManager::new(
            prefs.clone(),
            model_api,
            downloader,
            runner.clone(),
            queue.clone(),
            bus.clone(),
            options,
        ));
        runner.register_handler(Arc::new(ModelUpdateService::new(
            Arc::downgrade(&models),
            bus.clone(),
        )));

        info!(
            instance = %sessions.session().read(|session| session.instance_id.clone()),
            ota = models.options().ota_updates_enabled,
            "sdk configured"
        );
        Ok(Self {
            runtime,
            config,
            prefs,
            bus,
            sessions,
            queue,
            runner,
            models,
        })
    }

    pub fn config(&self) -> &SdkConfig {
        &self.config
    }

    pub fn preferences(&self) -> &Preferences {
        &self.prefs
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        self.sessions.clone()
    }

    pub fn events(&self) -> Arc<EventQueue> {
        self.queue.clone()
    }

    pub fn runner(&self) -> Arc<LocalJobRunner> {
        self.runner.clone()
    }

    pub fn models(&self) -> Arc<ModelManager> {
        self.models.clone()
    }

    /// Flushes buffered events, stops the flush timer and winds down
    /// background work.
    pub fn shutdown(self) {
        self.sessions.flush_events();
        self.queue.stop_timer();
        self.runtime.shutdown_timeout(SHUTDOWN_GRACE);
        info!("sdk shut down");
    }
}
