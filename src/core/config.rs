use std::{
    fs,
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use super::error::ConfigError;

const STORE_FILE: &str = "store.json";
const MODELS_DIR: &str = "models";
pub const DEFAULT_API_BASE: &str = "https://api.fritz.ai/sdk/v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SdkConfig {
    pub app_token: Option<String>,
    pub api_base: String,
    pub files_dir: Option<PathBuf>,
    pub store_path: Option<PathBuf>,
    pub app_name: String,
    pub package_name: String,
    pub expected_package_name: Option<String>,
    pub version_name: String,
    pub version_code: u32,
    pub ota_updates_enabled: bool,
    pub worker_threads: usize,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            app_token: None,
            api_base: DEFAULT_API_BASE.into(),
            files_dir: None,
            store_path: None,
            app_name: "app".into(),
            package_name: "app".into(),
            expected_package_name: None,
            version_name: "0.0.0".into(),
            version_code: 0,
            ota_updates_enabled: false,
            worker_threads: 2,
        }
    }
}

impl SdkConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ConfigError::Invalid {
            path: path.to_path_buf(),
            source,
        })
    }

    #[must_use]
    pub fn with_app_token(mut self, token: impl Into<String>) -> Self {
        self.app_token = Some(token.into());
        self
    }

    /// Puts both the model files and the store under `dir`.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        self.files_dir = Some(dir.join(MODELS_DIR));
        self.store_path = Some(dir.join(STORE_FILE));
        self
    }

    pub fn validate_package(&self) -> Result<(), ConfigError> {
        match &self.expected_package_name {
            Some(expected) if expected != &self.package_name => Err(ConfigError::PackageMismatch {
                expected: expected.clone(),
                actual: self.package_name.clone(),
            }),
            _ => Ok(()),
        }
    }

    pub fn resolve_files_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.files_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.project_data_dir()?.join(MODELS_DIR)),
        }
    }

    pub fn resolve_store_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.store_path {
            Some(path) => Ok(path.clone()),
            None => Ok(self.project_data_dir()?.join(STORE_FILE)),
        }
    }

    fn project_data_dir(&self) -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("ai", "modelsync", &self.app_name)
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or(ConfigError::NoDataDirectory)
    }
}
