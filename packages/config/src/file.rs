//! Loading of the optional `config.json5` file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{MediaConfig, RoomConfig, RoomRegistry, get_config_dir_path};

/// File names searched for in the config directory, in order.
pub const CONFIG_FILE_NAMES: [&str; 2] = ["config.json5", "config.json"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: json5::Error },
    #[error("Config file {0} declares room '{1}' more than once")]
    DuplicateRoom(PathBuf, String),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub workers: Option<usize>,
}

/// Top level of `config.json5`. Every section is optional.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    pub server: Option<ServerConfig>,
    pub rooms: Option<Vec<RoomConfig>>,
    pub media: Option<MediaConfig>,
}

impl ConfigFile {
    #[must_use]
    pub fn room_registry(&self) -> RoomRegistry {
        RoomRegistry::new(self.rooms.clone().unwrap_or_default())
    }

    #[must_use]
    pub fn media_config(&self) -> MediaConfig {
        self.media.clone().unwrap_or_default()
    }
}

/// Loads the config file from the config directory.
///
/// A missing directory or file is not an error: the built-in defaults are
/// returned instead.
///
/// # Errors
///
/// * If a config file exists but cannot be read or parsed
pub fn load_config() -> Result<ConfigFile, ConfigError> {
    let Some(dir) = get_config_dir_path() else {
        log::debug!("load_config: no config directory, using defaults");
        return Ok(ConfigFile::default());
    };

    let Some(path) = CONFIG_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
    else {
        log::debug!("load_config: no config file in {}, using defaults", dir.display());
        return Ok(ConfigFile::default());
    };

    load_config_from(&path)
}

/// # Errors
///
/// * If the file cannot be read
/// * If the file is not valid JSON5 for a [`ConfigFile`]
/// * If the same room id appears twice
pub fn load_config_from(path: &Path) -> Result<ConfigFile, ConfigError> {
    log::debug!("load_config_from: {}", path.display());

    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let config: ConfigFile = json5::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    if let Some(rooms) = &config.rooms {
        let mut seen = std::collections::BTreeSet::new();
        for room in rooms {
            if !seen.insert(room.id.as_str()) {
                return Err(ConfigError::DuplicateRoom(
                    path.to_path_buf(),
                    room.id.clone(),
                ));
            }
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serial_test::serial;

    use super::*;
    use crate::{Position, set_root_dir};

    #[test]
    #[serial]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        set_root_dir(dir.path().to_path_buf());

        let config = load_config().unwrap();

        assert_eq!(config, ConfigFile::default());
        assert!(config.room_registry().get("main").is_some());
    }

    #[test]
    #[serial]
    fn json5_file_is_preferred_over_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json5"),
            "{ server: { port: 7000 }, // comment\n }",
        )
        .unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"server":{"port":8000}}"#).unwrap();
        set_root_dir(dir.path().to_path_buf());

        let config = load_config().unwrap();

        assert_eq!(config.server.unwrap().port, Some(7000));
    }

    #[test]
    fn rooms_section_replaces_the_default_room() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json5");
        std::fs::write(
            &path,
            r"{
                rooms: [
                    { id: 'garden', width: 1000, height: 800, startingPosition: { x: 50, y: 60 } },
                ],
            }",
        )
        .unwrap();

        let registry = load_config_from(&path).unwrap().room_registry();

        assert!(registry.get("main").is_none());
        assert_eq!(
            registry.get("garden").unwrap().starting_position,
            Position::new(50, 60)
        );
    }

    #[test]
    fn duplicate_rooms_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json5");
        std::fs::write(
            &path,
            r"{ rooms: [
                { id: 'a', width: 1, height: 1, startingPosition: { x: 0, y: 0 } },
                { id: 'a', width: 2, height: 2, startingPosition: { x: 0, y: 0 } },
            ] }",
        )
        .unwrap();

        let err = load_config_from(&path).unwrap_err();

        assert!(matches!(err, ConfigError::DuplicateRoom(_, ref id) if id == "a"));
    }

    #[test]
    fn malformed_file_reports_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json5");
        std::fs::write(&path, "{ server: ").unwrap();

        let err = load_config_from(&path).unwrap_err();

        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.json5"));
    }
}
