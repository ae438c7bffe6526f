#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Logger setup shared by the proximity binaries.

pub use log;
use proximity_config::env::option_env;
use thiserror::Error;

#[cfg(feature = "macros")]
mod macros;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_LEVEL: &str = "proximity=debug";
#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_LEVEL: &str = "proximity=info";

#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    SetLogger(#[from] log::SetLoggerError),
}

/// The filter used by [`init`]: `PROXIMITY_LOG`, then `RUST_LOG`, then
/// [`DEFAULT_LOG_LEVEL`].
#[must_use]
pub fn env_filter() -> String {
    option_env("PROXIMITY_LOG")
        .or_else(|| option_env("RUST_LOG"))
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
}

/// Installs the global logger.
///
/// # Errors
///
/// * If a global logger was already installed
pub fn init() -> Result<(), InitError> {
    env_logger::Builder::new()
        .parse_filters(&env_filter())
        .format_timestamp_millis()
        .try_init()?;

    Ok(())
}
