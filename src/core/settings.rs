use std::{collections::BTreeSet, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const MINUTE_MS: u64 = 60_000;
const SECOND_MS: u64 = 1_000;

pub const DEFAULT_SETTINGS_REFRESH_INTERVAL_MS: u64 = 30 * MINUTE_MS;
pub const DEFAULT_TRACK_REQUEST_BATCH_SIZE: usize = 100;
pub const DEFAULT_BATCH_FLUSH_INTERVAL_MS: u64 = MINUTE_MS;

const REFRESH_INTERVAL_FIELD: &str = "settings_refresh_interval";
const FLUSH_INTERVAL_FIELD: &str = "batch_flush_interval";

pub(crate) fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Remote policy knobs. Replaced as a whole whenever the backend answers;
/// never edited field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    #[serde(rename = "settings_refresh_interval")]
    pub refresh_interval_ms: u64,
    #[serde(rename = "api_requests_enabled")]
    pub api_enabled: bool,
    #[serde(rename = "model_input_output_sampling_ratio")]
    pub io_sampling_ratio: f64,
    #[serde(rename = "track_request_batch_size")]
    pub track_batch_size: usize,
    #[serde(rename = "gzip_track_events")]
    pub gzip_events: bool,
    #[serde(rename = "batch_flush_interval")]
    pub batch_flush_interval_ms: u64,
    pub event_blacklist: BTreeSet<String>,
    #[serde(rename = "settings_last_checked_at")]
    pub last_checked_at_ms: i64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            refresh_interval_ms: DEFAULT_SETTINGS_REFRESH_INTERVAL_MS,
            api_enabled: false,
            io_sampling_ratio: 0.0,
            track_batch_size: DEFAULT_TRACK_REQUEST_BATCH_SIZE,
            gzip_events: false,
            batch_flush_interval_ms: DEFAULT_BATCH_FLUSH_INTERVAL_MS,
            event_blacklist: BTreeSet::new(),
            last_checked_at_ms: 0,
        }
    }
}

impl SessionSettings {
    /// Parses the settings endpoint body. The backend reports the refresh
    /// interval in minutes and the flush interval in seconds.
    pub fn from_response(body: &serde_json::Value) -> Result<Self> {
        let mut settings: Self =
            serde_json::from_value(body.clone()).context("parse session settings response")?;
        if body.get(REFRESH_INTERVAL_FIELD).is_some() {
            settings.refresh_interval_ms = settings.refresh_interval_ms.saturating_mul(MINUTE_MS);
        }
        if body.get(FLUSH_INTERVAL_FIELD).is_some() {
            settings.batch_flush_interval_ms =
                settings.batch_flush_interval_ms.saturating_mul(SECOND_MS);
        }
        Ok(settings.sanitized())
    }

    /// Reads the persisted form, whose intervals are already in milliseconds.
    pub fn from_stored(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value).map(Self::sanitized)
    }

    fn sanitized(mut self) -> Self {
        self.io_sampling_ratio = if self.io_sampling_ratio.is_finite() {
            self.io_sampling_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.track_batch_size = self.track_batch_size.max(1);
        self
    }

    pub fn should_check_settings(&self, now_ms: i64) -> bool {
        let interval = i64::try_from(self.refresh_interval_ms).unwrap_or(i64::MAX);
        now_ms.saturating_sub(self.last_checked_at_ms) >= interval
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.batch_flush_interval_ms.max(1))
    }

    pub fn is_blacklisted(&self, event_type: &str) -> bool {
        self.event_blacklist.contains(event_type)
    }
}

/// Identity sent with every backend request, plus the current policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub instance_id: String,
    pub app_token: String,
    pub user_agent: String,
    #[serde(default)]
    pub settings: SessionSettings,
}

impl Session {
    pub fn new(
        instance_id: impl Into<String>,
        app_token: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            app_token: app_token.into(),
            user_agent: user_agent.into(),
            settings: SessionSettings::default(),
        }
    }

    pub fn is_api_enabled(&self) -> bool {
        self.settings.api_enabled
    }
}

/// Shared, read-mostly handle on the live session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<RwLock<Session>>,
}

impl SessionHandle {
    pub fn new(session: Session) -> Self {
        Self {
            inner: Arc::new(RwLock::new(session)),
        }
    }

    pub fn snapshot(&self) -> Session {
        self.inner.read().clone()
    }

    pub fn settings(&self) -> SessionSettings {
        self.inner.read().settings.clone()
    }

    pub fn is_api_enabled(&self) -> bool {
        self.inner.read().is_api_enabled()
    }

    pub fn read<R>(&self, f: impl FnOnce(&Session) -> R) -> R {
        f(&self.inner.read())
    }

    /// Swaps in a complete settings value and returns the updated session.
    pub fn replace_settings(&self, settings: SessionSettings) -> Session {
        let mut guard = self.inner.write();
        guard.settings = settings;
        guard.clone()
    }
}
