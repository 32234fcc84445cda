use std::sync::Arc;

use tracing::warn;

use super::{
    active_version_key, install_tracked_key, model_key, KeyValueStore, StoreError, SESSION_KEY,
};
use crate::{
    core::settings::{Session, SessionSettings},
    models::OnDeviceModel,
};

/// Typed view over the persistent store. Cheap to clone; every clone talks to
/// the same backing store.
#[derive(Clone)]
pub struct Preferences {
    store: Arc<dyn KeyValueStore>,
}

impl Preferences {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn saved_model(&self, model_id: &str) -> Result<Option<OnDeviceModel>, StoreError> {
        match self.store.get(&model_key(model_id))? {
            Some(raw) => Ok(Some(OnDeviceModel::from_json_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Writes the model blob and its version index in one commit.
    pub fn save_model(&self, model: &OnDeviceModel) -> Result<(), StoreError> {
        let blob = model.to_json_string()?;
        self.store.put_all(&[
            (model_key(model.model_id()), blob),
            (active_version_key(model.model_id()), model.version.to_string()),
        ])
    }

    pub fn active_version(&self, model_id: &str) -> Result<Option<i32>, StoreError> {
        let Some(raw) = self.store.get(&active_version_key(model_id))? else {
            return Ok(None);
        };
        match raw.trim().parse::<i32>() {
            Ok(version) => Ok(Some(version)),
            Err(error) => {
                warn!(model = model_id, value = %raw, "ignoring unreadable active version: {error}");
                Ok(None)
            }
        }
    }

    pub fn has_tracked_install(&self, model_id: &str, version: i32) -> Result<bool, StoreError> {
        Ok(self
            .store
            .get(&install_tracked_key(model_id, version))?
            .map(|value| value == "true")
            .unwrap_or(false))
    }

    pub fn mark_install_tracked(&self, model_id: &str, version: i32) -> Result<(), StoreError> {
        self.store
            .put(&install_tracked_key(model_id, version), "true")
    }

    pub fn session(&self) -> Result<Option<Session>, StoreError> {
        let Some(raw) = self.store.get(SESSION_KEY)? else {
            return Ok(None);
        };
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        let mut session: Session = serde_json::from_value(value.clone())?;
        if let Some(settings) = value.get("settings") {
            session.settings = SessionSettings::from_stored(settings)?;
        }
        Ok(Some(session))
    }

    pub fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        let blob = serde_json::to_string(session)?;
        self.store.put(SESSION_KEY, &blob)
    }

    pub fn clear_all(&self) -> Result<(), StoreError> {
        self.store.delete_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn prefs() -> Preferences {
        Preferences::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn saving_a_model_updates_version_index() {
        let prefs = prefs();
        assert_eq!(prefs.active_version("m1").unwrap(), None);

        let model = OnDeviceModel::new("/files/m1_v3.tflite", "m1", 3);
        prefs.save_model(&model).unwrap();

        assert_eq!(prefs.active_version("m1").unwrap(), Some(3));
        assert_eq!(prefs.saved_model("m1").unwrap(), Some(model));
    }

    #[test]
    fn malformed_model_blob_is_an_error() {
        let prefs = prefs();
        prefs.store().put(&model_key("m1"), "{broken").unwrap();
        assert!(matches!(
            prefs.saved_model("m1"),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn install_flag_is_per_version() {
        let prefs = prefs();
        prefs.mark_install_tracked("m1", 3).unwrap();
        assert!(prefs.has_tracked_install("m1", 3).unwrap());
        assert!(!prefs.has_tracked_install("m1", 4).unwrap());
        assert!(!prefs.has_tracked_install("m2", 3).unwrap());
    }

    #[test]
    fn stored_session_settings_are_sanitized_on_load() {
        let prefs = prefs();
        let raw = r#"{
            "instance_id": "i-1",
            "app_token": "t",
            "user_agent": "ua",
            "settings": {
                "model_input_output_sampling_ratio": 7.5,
                "track_request_batch_size": 0,
                "batch_flush_interval": 5
            }
        }"#;
        prefs.store().put(SESSION_KEY, raw).unwrap();

        let session = prefs.session().unwrap().unwrap();
        assert_eq!(session.instance_id, "i-1");
        assert_eq!(session.settings.io_sampling_ratio, 1.0);
        assert_eq!(session.settings.track_batch_size, 1);
        assert_eq!(session.settings.batch_flush_interval_ms, 5);
    }

    #[test]
    fn clear_all_forgets_everything() {
        let prefs = prefs();
        prefs
            .save_model(&OnDeviceModel::new("/files/m1_v1.tflite", "m1", 1))
            .unwrap();
        prefs.clear_all().unwrap();
        assert_eq!(prefs.saved_model("m1").unwrap(), None);
        assert_eq!(prefs.active_version("m1").unwrap(), None);
    }
}
