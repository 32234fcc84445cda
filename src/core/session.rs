use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    config::SdkConfig,
    error::{ConfigError, SdkError},
    settings::{now_millis, Session, SessionHandle, SessionSettings},
};
use crate::{
    store::{Preferences, StoreError},
    telemetry::{EventQueue, EventRecord, SessionApi},
};

pub fn user_agent(config: &SdkConfig) -> String {
    format!(
        "{}/{} ({}; build:{}; platform:{}; {}) modelsync/{}",
        config.app_name,
        config.version_name,
        config.package_name,
        config.version_code,
        std::env::consts::OS,
        std::env::consts::ARCH,
        env!("CARGO_PKG_VERSION"),
    )
}

/// Loads the persisted session, or creates one on first run. The instance id
/// survives restarts; token and user agent follow the current config.
pub fn bootstrap_session(prefs: &Preferences, config: &SdkConfig) -> Result<Session, SdkError> {
    config.validate_package()?;

    let stored = match prefs.session() {
        Ok(stored) => stored,
        Err(StoreError::Serialization(error)) => {
            warn!("discarding unreadable stored session: {error}");
            None
        }
        Err(error) => return Err(error.into()),
    };

    let token = config
        .app_token
        .clone()
        .filter(|token| !token.trim().is_empty())
        .or_else(|| stored.as_ref().map(|session| session.app_token.clone()))
        .filter(|token| !token.trim().is_empty())
        .ok_or(ConfigError::MissingAppToken)?;

    let session = match stored {
        Some(mut session) => {
            session.app_token = token;
            session.user_agent = user_agent(config);
            debug!(instance = %session.instance_id, "restored session");
            session
        }
        None => {
            let session = Session::new(Uuid::new_v4().to_string(), token, user_agent(config));
            info!(instance = %session.instance_id, "created session");
            session
        }
    };
    prefs.save_session(&session)?;
    Ok(session)
}

pub type AnnotationCallback = Box<dyn FnOnce(Result<()>) + Send>;

pub struct SessionManager {
    prefs: Preferences,
    session: SessionHandle,
    api: Arc<dyn SessionApi>,
    queue: Arc<EventQueue>,
    runtime: Handle,
}

impl SessionManager {
    pub fn new(
        prefs: Preferences,
        session: SessionHandle,
        api: Arc<dyn SessionApi>,
        queue: Arc<EventQueue>,
        runtime: Handle,
    ) -> Self {
        Self {
            prefs,
            session,
            api,
            queue,
            runtime,
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Replaces the settings wholesale and persists the session.
    pub fn apply_settings(&self, settings: SessionSettings) -> Result<(), StoreError> {
        let updated = self.session.replace_settings(settings);
        self.prefs.save_session(&updated)
    }

    /// Fetches remote settings when the refresh interval has elapsed.
    /// Returns whether new settings were applied.
    pub fn refresh_settings(&self) -> Result<bool> {
        let now = now_millis();
        if !self.session.settings().should_check_settings(now) {
            return Ok(false);
        }
        let body = self.api.fetch_settings().context("fetch session settings")?;
        let mut settings = SessionSettings::from_response(&body)?;
        settings.last_checked_at_ms = now;
        self.apply_settings(settings)
            .context("persist refreshed session settings")?;
        info!("session settings refreshed");
        Ok(true)
    }

    pub fn track(&self, event: EventRecord) {
        self.queue.add(event);
    }

    pub fn flush_events(&self) {
        self.queue.flush();
    }

    /// Sends one annotation event straight to the backend, off the calling
    /// thread, and reports the result to `callback`.
    pub fn record_annotation(&self, event: EventRecord, callback: AnnotationCallback) {
        let api = self.api.clone();
        self.runtime.spawn_blocking(move || {
            let result = api.record_annotation(&event);
            if let Err(error) = &result {
                warn!("annotation upload failed: {error:#}");
            }
            callback(result);
        });
    }

    pub fn on_foreground(self: &Arc<Self>) {
        let this = self.clone();
        self.runtime.spawn_blocking(move || {
            if let Err(error) = this.refresh_settings() {
                debug!("settings refresh skipped: {error:#}");
            }
        });
    }

    pub fn on_background(&self) {
        self.flush_events();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;
    use crossbeam_channel::bounded;
    use serde_json::{json, Value};

    use super::*;
    use crate::{
        store::MemoryStore,
        telemetry::{BatchSender, EventPayload, SendCallback},
    };

    struct NullSender;

    impl BatchSender for NullSender {
        fn send_batch(&self, _events: Vec<EventRecord>, done: SendCallback) {
            done(Ok(()));
        }
    }

    #[derive(Default)]
    struct FakeApi {
        settings_calls: AtomicUsize,
        fail_annotations: bool,
    }

    impl SessionApi for FakeApi {
        fn fetch_settings(&self) -> Result<Value> {
            self.settings_calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({
                "api_requests_enabled": true,
                "track_request_batch_size": 5,
                "batch_flush_interval": 2
            }))
        }

        fn record_annotation(&self, _event: &EventRecord) -> Result<()> {
            if self.fail_annotations {
                Err(anyhow!("backend down"))
            } else {
                Ok(())
            }
        }
    }

    fn prefs() -> Preferences {
        Preferences::new(Arc::new(MemoryStore::new()))
    }

    fn config() -> SdkConfig {
        SdkConfig {
            app_name: "demo".into(),
            package_name: "com.example.demo".into(),
            version_name: "2.1".into(),
            version_code: 21,
            ..SdkConfig::default()
        }
        .with_app_token("token-1")
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .unwrap()
    }

    fn manager(prefs: &Preferences, api: Arc<FakeApi>, runtime: &tokio::runtime::Runtime) -> SessionManager {
        let session = SessionHandle::new(bootstrap_session(prefs, &config()).unwrap());
        let queue = Arc::new(EventQueue::new(session.clone(), Arc::new(NullSender)));
        SessionManager::new(prefs.clone(), session, api, queue, runtime.handle().clone())
    }

    #[test]
    fn user_agent_names_app_and_build() {
        let agent = user_agent(&config());
        assert!(agent.starts_with("demo/2.1 (com.example.demo; build:21; platform:"));
        assert!(agent.contains(") modelsync/"));
    }

    #[test]
    fn session_is_created_once_and_restored() {
        let prefs = prefs();
        let first = bootstrap_session(&prefs, &config()).unwrap();
        let second = bootstrap_session(&prefs, &config()).unwrap();
        assert_eq!(first.instance_id, second.instance_id);
        assert_eq!(prefs.session().unwrap(), Some(second));
    }

    #[test]
    fn stored_token_is_used_when_config_has_none() {
        let prefs = prefs();
        bootstrap_session(&prefs, &config()).unwrap();
        let restored = bootstrap_session(&prefs, &SdkConfig::default()).unwrap();
        assert_eq!(restored.app_token, "token-1");
    }

    #[test]
    fn missing_token_stops_setup() {
        assert!(matches!(
            bootstrap_session(&prefs(), &SdkConfig::default()),
            Err(SdkError::Config(ConfigError::MissingAppToken))
        ));
    }

    #[test]
    fn refresh_applies_and_persists_settings_once_due() {
        let runtime = runtime();
        let prefs = prefs();
        let api = Arc::new(FakeApi::default());
        let manager = manager(&prefs, api.clone(), &runtime);

        assert!(manager.refresh_settings().unwrap());
        assert!(!manager.refresh_settings().unwrap());
        assert_eq!(api.settings_calls.load(Ordering::SeqCst), 1);

        let settings = manager.session().settings();
        assert!(settings.api_enabled);
        assert_eq!(settings.track_batch_size, 5);
        assert_eq!(settings.batch_flush_interval_ms, 2_000);
        assert!(settings.last_checked_at_ms > 0);

        let stored = prefs.session().unwrap().unwrap();
        assert_eq!(stored.settings, settings);
    }

    #[test]
    fn track_and_background_flush_use_the_queue() {
        let runtime = runtime();
        let prefs = prefs();
        let manager = manager(&prefs, Arc::new(FakeApi::default()), &runtime);
        manager.track(EventRecord::new(
            "prediction",
            1,
            EventPayload::Timing {
                model_uid: "m1".into(),
                model_version: 1,
                elapsed_nano_seconds: 3,
            },
        ));
        assert_eq!(manager.queue().pending_len(), 1);
        manager.on_background();
        assert_eq!(manager.queue().pending_len(), 0);
        assert_eq!(manager.queue().in_flight_len(), 0);
    }

    #[test]
    fn annotation_result_reaches_callback() {
        let runtime = runtime();
        let prefs = prefs();
        let api = Arc::new(FakeApi {
            fail_annotations: true,
            ..FakeApi::default()
        });
        let manager = manager(&prefs, api, &runtime);
        let (tx, rx) = bounded(1);
        let event = EventRecord::new(
            "prediction_annotation",
            1,
            EventPayload::Timing {
                model_uid: "m1".into(),
                model_version: 1,
                elapsed_nano_seconds: 0,
            },
        );
        manager.record_annotation(
            event,
            Box::new(move |result| {
                let _ = tx.send(result.is_ok());
            }),
        );
        assert!(!rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap());
    }
}
