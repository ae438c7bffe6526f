#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Configuration for the proximity server.
//!
//! Rooms are static: they are read once at startup (either the built-in
//! defaults or the `rooms` section of `config.json5`) and never change while
//! the process runs. The same file may also tune the media engine.

use std::{
    path::PathBuf,
    sync::{LazyLock, Mutex, PoisonError},
};

pub mod env;
pub mod file;
pub mod media;
pub mod rooms;

pub use file::{ConfigError, ConfigFile, ServerConfig, load_config, load_config_from};
pub use media::MediaConfig;
pub use rooms::{PointOfInterest, Position, RoomConfig, RoomId, RoomRegistry};

static ROOT_DIR: LazyLock<Mutex<Option<PathBuf>>> = LazyLock::new(|| Mutex::new(None));

/// Overrides the configuration root directory.
///
/// By default the root directory is `$PROXIMITY_CONFIG_DIR`, or
/// `~/.local/proximity` when that variable is unset.
pub fn set_root_dir(path: PathBuf) {
    *ROOT_DIR.lock().unwrap_or_else(PoisonError::into_inner) = Some(path);
}

fn get_root_dir() -> Option<PathBuf> {
    let mut root_dir = ROOT_DIR.lock().unwrap_or_else(PoisonError::into_inner);

    if root_dir.is_some() {
        return root_dir.clone();
    }

    *root_dir = env::option_env("PROXIMITY_CONFIG_DIR")
        .map(PathBuf::from)
        .or_else(|| home::home_dir().map(|home| home.join(".local").join("proximity")));

    root_dir.clone()
}

/// Returns the path to the configuration directory.
#[must_use]
pub fn get_config_dir_path() -> Option<PathBuf> {
    get_root_dir()
}

/// Returns the path to the configuration directory, creating it if it doesn't exist.
///
/// Returns `None` if the directory cannot be created or the path cannot be determined.
#[must_use]
pub fn make_config_dir_path() -> Option<PathBuf> {
    if let Some(path) = get_config_dir_path()
        && (path.is_dir() || std::fs::create_dir_all(&path).is_ok())
    {
        return Some(path);
    }

    None
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn set_root_dir_overrides_the_default() {
        let dir = tempfile::tempdir().unwrap();
        set_root_dir(dir.path().to_path_buf());

        assert_eq!(get_config_dir_path(), Some(dir.path().to_path_buf()));
        assert_eq!(make_config_dir_path(), Some(dir.path().to_path_buf()));
    }
}
