pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod logging;
pub mod session;
pub mod settings;
