//! Layered settings and the storage layout derived from them.
//!
//! Settings merge defaults, configuration files, and `CORRAL_*` environment
//! variables through `ortho-config`. The resolved [`Storage`] value is an
//! explicit handle threaded into store constructors; nothing in the core
//! reads a process-wide mutable default.

use std::env;
use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

const MACHINE_DIR: &str = "machines";
const KEY_DIR: &str = "keys";
const DEFAULT_ROOT_DIR: &str = ".corral";

/// Tool-wide settings layered via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "CORRAL")]
pub struct Settings {
    /// Overrides the storage root where machine records and keys live.
    pub storage_root: Option<String>,
}

impl Settings {
    /// Loads settings without parsing CLI arguments. Values still merge
    /// defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, SettingsError> {
        Self::load_from_iter([OsString::from("corral")])
            .map_err(|err| SettingsError::Parse(err.to_string()))
    }
}

/// Errors raised while loading settings or preparing storage directories.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SettingsError {
    /// Raised when configuration parsing fails.
    #[error("settings parsing failed: {0}")]
    Parse(String),
    /// Raised when no home directory can be determined for the default root.
    #[error("cannot locate a home directory; set CORRAL_STORAGE_ROOT")]
    MissingHome,
    /// Raised when a storage directory cannot be created or opened.
    #[error("failed to prepare {path}: {message}")]
    Io {
        /// Directory that could not be prepared.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
}

/// Resolved storage layout for machine records and key pairs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Storage {
    root: Utf8PathBuf,
}

impl Storage {
    /// Resolves the storage root from settings, falling back to
    /// `~/.corral`.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::MissingHome`] when no override is set and
    /// the home directory cannot be determined.
    pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
        let root = match settings.storage_root.as_deref() {
            Some(value) if !value.trim().is_empty() => Utf8PathBuf::from(expand_tilde(value)),
            _ => default_root()?,
        };
        Ok(Self { root })
    }

    /// Builds a storage handle rooted at an explicit directory.
    #[must_use]
    pub fn at(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding one JSON record per machine.
    #[must_use]
    pub fn machine_dir(&self) -> Utf8PathBuf {
        self.root.join(MACHINE_DIR)
    }

    /// Directory holding per-machine SSH key pairs.
    #[must_use]
    pub fn key_dir(&self) -> Utf8PathBuf {
        self.root.join(KEY_DIR)
    }

    /// Creates the storage directories if they do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Io`] when a directory cannot be created.
    pub fn init(&self) -> Result<(), SettingsError> {
        create_dir_all(&self.machine_dir())?;
        create_dir_all(&self.key_dir())
    }
}

fn create_dir_all(path: &Utf8Path) -> Result<(), SettingsError> {
    Dir::create_ambient_dir_all(path, ambient_authority()).map_err(|err| SettingsError::Io {
        path: path.to_owned(),
        message: err.to_string(),
    })
}

fn default_root() -> Result<Utf8PathBuf, SettingsError> {
    let home = home_dir().ok_or(SettingsError::MissingHome)?;
    Ok(Utf8PathBuf::from(home).join(DEFAULT_ROOT_DIR))
}

fn home_dir() -> Option<String> {
    env::var("HOME")
        .ok()
        .or_else(|| env::var("USERPROFILE").ok())
        .filter(|value| !value.trim().is_empty())
}

/// Expands a leading `~/` against the home directory, leaving other paths
/// untouched.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = home_dir()
    {
        return format!("{home}/{rest}");
    }
    path.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_layout_nests_under_root() {
        let storage = Storage::at("/tmp/corral-test");
        assert_eq!(storage.machine_dir(), "/tmp/corral-test/machines");
        assert_eq!(storage.key_dir(), "/tmp/corral-test/keys");
    }

    #[test]
    fn from_settings_prefers_override() {
        let settings = Settings {
            storage_root: Some(String::from("/var/lib/corral")),
        };
        let storage = Storage::from_settings(&settings).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(storage.machine_dir(), "/var/lib/corral/machines");
    }

    #[test]
    fn expand_tilde_leaves_absolute_paths_alone() {
        assert_eq!(expand_tilde("/srv/corral"), "/srv/corral");
    }
}
