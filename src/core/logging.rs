use once_cell::sync::OnceCell;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "MODELSYNC_LOG";

static INSTALLED: OnceCell<()> = OnceCell::new();

/// Installs a compact fmt subscriber. The level comes from `MODELSYNC_LOG`
/// (default `info`). Later calls, or a host that already installed its own
/// subscriber, leave things as they are.
pub fn init() {
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .with_env_var(LOG_ENV)
            .from_env_lossy();

        let subscriber = fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .finish();

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
