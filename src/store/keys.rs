pub const SESSION_KEY: &str = "session";

pub fn model_key(model_id: &str) -> String {
    format!("model:{model_id}")
}

pub fn active_version_key(model_id: &str) -> String {
    format!("model:{model_id}:active-version")
}

pub fn install_tracked_key(model_id: &str, version: i32) -> String {
    format!("model:{model_id}:v{version}:install-tracked")
}
