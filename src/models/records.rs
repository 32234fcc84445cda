use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Prefix for models shipped inside the host application package. Such
/// files are read-only: never deleted and never considered missing.
pub const BUNDLED_ASSET_ROOT: &str = "asset://";

/// Download coordinates for one model version, as reported by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DownloadConfig {
    pub version: i32,
    #[serde(alias = "src")]
    pub download_url: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl DownloadConfig {
    /// Parses the active-version response body (`version`, `src`,
    /// `metadata`, `tags`).
    pub fn from_response(body: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(body.clone()).context("parse active model version response")
    }
}

/// A model the application wants, optionally pinned to one version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ManagedModel {
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_version: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_config: Option<DownloadConfig>,
}

impl ManagedModel {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            pinned_version: None,
            download_config: None,
        }
    }

    #[must_use]
    pub fn with_pinned_version(mut self, version: i32) -> Self {
        self.pinned_version = Some(version);
        self
    }

    #[must_use]
    pub fn with_download_config(mut self, config: DownloadConfig) -> Self {
        self.download_config = Some(config);
        self
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_str(value: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(value)
    }
}

/// A model materialized on local storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OnDeviceModel {
    #[serde(flatten)]
    pub model: ManagedModel,
    pub local_path: String,
    pub version: i32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub is_encrypted: bool,
    #[serde(default)]
    pub downloaded_over_network: bool,
}

impl OnDeviceModel {
    pub fn new(local_path: impl Into<String>, model_id: impl Into<String>, version: i32) -> Self {
        Self {
            model: ManagedModel::new(model_id),
            local_path: local_path.into(),
            version,
            metadata: BTreeMap::new(),
            tags: BTreeSet::new(),
            is_encrypted: false,
            downloaded_over_network: false,
        }
    }

    /// A model shipped with the application under [`BUNDLED_ASSET_ROOT`].
    pub fn bundled(asset_name: &str, model_id: impl Into<String>, version: i32) -> Self {
        Self::new(format!("{BUNDLED_ASSET_ROOT}{asset_name}"), model_id, version)
    }

    /// Builds the record for a freshly downloaded artifact. Returns `None` if
    /// the managed model carries no download configuration.
    pub fn from_download(managed: &ManagedModel, local_path: &Path) -> Option<Self> {
        let config = managed.download_config.as_ref()?;
        Some(Self {
            model: ManagedModel {
                model_id: managed.model_id.clone(),
                pinned_version: managed.pinned_version,
                download_config: None,
            },
            local_path: local_path.to_string_lossy().into_owned(),
            version: config.version,
            metadata: config.metadata.clone(),
            tags: config.tags.clone(),
            is_encrypted: false,
            downloaded_over_network: true,
        })
    }

    #[must_use]
    pub fn with_pinned_version(mut self, version: i32) -> Self {
        self.model.pinned_version = Some(version);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: BTreeSet<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model.model_id
    }

    pub fn pinned_version(&self) -> Option<i32> {
        self.model.pinned_version
    }

    pub fn is_bundled(&self) -> bool {
        self.local_path.starts_with(BUNDLED_ASSET_ROOT)
    }

    pub fn file_exists(&self) -> bool {
        self.is_bundled() || Path::new(&self.local_path).exists()
    }

    /// Removes the model file. Bundled assets are left alone.
    pub fn delete_model_file(&self) -> bool {
        if self.is_bundled() {
            return false;
        }
        match fs::remove_file(&self.local_path) {
            Ok(()) => {
                debug!(model = %self.model_id(), path = %self.local_path, "deleted superseded model file");
                true
            }
            Err(error) => {
                warn!(model = %self.model_id(), path = %self.local_path, "failed to delete model file: {error}");
                false
            }
        }
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_str(value: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(value)
    }
}

impl PartialEq for OnDeviceModel {
    fn eq(&self, other: &Self) -> bool {
        self.model_id().eq_ignore_ascii_case(other.model_id())
            && self.version == other.version
            && self.local_path == other.local_path
    }
}

impl std::fmt::Display for OnDeviceModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "model {} (version {})", self.model_id(), self.version)
    }
}
