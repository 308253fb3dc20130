//! Durable machine record persistence.
//!
//! One JSON file per machine, named after the machine id, inside a
//! configurable base directory. Saves overwrite by id; listing skips
//! files that are not valid machine records so one corrupt file cannot
//! hide every other machine.

use std::io::Read as _;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use thiserror::Error;
use tracing::warn;

use super::Machine;

/// Errors raised by the machine record store.
#[derive(Debug, Error)]
pub enum MachineStoreError {
    /// Raised when no record exists for the given id.
    #[error("machine {id} not found")]
    NotFoundById {
        /// Machine id that was requested.
        id: String,
    },
    /// Raised when no record matches the given name.
    #[error("machine {name} not found")]
    NotFoundByName {
        /// Machine name that was requested.
        name: String,
    },
    /// Raised when file system access fails.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// Raised when a record cannot be encoded or decoded.
    #[error("failed to encode machine {id}: {message}")]
    Encoding {
        /// Machine id of the record.
        id: String,
        /// Underlying error message.
        message: String,
    },
}

/// File-backed store of machine records.
#[derive(Debug)]
pub struct MachineStore {
    dir: Dir,
    base: Utf8PathBuf,
}

impl MachineStore {
    /// Opens the store rooted at `machine_dir`, creating the directory
    /// if needed.
    ///
    /// # Errors
    ///
    /// Returns [`MachineStoreError::Io`] when the directory cannot be
    /// created or opened.
    pub fn open(machine_dir: &Utf8Path) -> Result<Self, MachineStoreError> {
        let io_error = |err: std::io::Error| MachineStoreError::Io {
            path: machine_dir.to_owned(),
            message: err.to_string(),
        };
        Dir::create_ambient_dir_all(machine_dir, ambient_authority()).map_err(io_error)?;
        let dir = Dir::open_ambient_dir(machine_dir, ambient_authority()).map_err(io_error)?;
        Ok(Self {
            dir,
            base: machine_dir.to_owned(),
        })
    }

    /// Saves the machine, overwriting any previous record with the same
    /// id.
    ///
    /// # Errors
    ///
    /// Returns [`MachineStoreError::Encoding`] when serialisation fails
    /// or [`MachineStoreError::Io`] when the write fails.
    pub fn save(&self, machine: &Machine) -> Result<(), MachineStoreError> {
        let payload =
            serde_json::to_vec(machine).map_err(|err| MachineStoreError::Encoding {
                id: machine.instance.id.clone(),
                message: err.to_string(),
            })?;
        let file_name = Self::file_name(&machine.instance.id);
        self.dir
            .write(&file_name, payload)
            .map_err(|err| MachineStoreError::Io {
                path: self.base.join(&file_name),
                message: err.to_string(),
            })
    }

    /// Retrieves a machine by id.
    ///
    /// # Errors
    ///
    /// Returns [`MachineStoreError::NotFoundById`] when no record
    /// exists.
    pub fn get(&self, id: &str) -> Result<Machine, MachineStoreError> {
        let file_name = Self::file_name(id);
        let contents = match self.dir.read_to_string(&file_name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(MachineStoreError::NotFoundById { id: id.to_owned() });
            }
            Err(err) => {
                return Err(MachineStoreError::Io {
                    path: self.base.join(&file_name),
                    message: err.to_string(),
                });
            }
        };
        serde_json::from_str(&contents).map_err(|err| MachineStoreError::Encoding {
            id: id.to_owned(),
            message: err.to_string(),
        })
    }

    /// Retrieves a machine by name.
    ///
    /// # Errors
    ///
    /// Returns [`MachineStoreError::NotFoundByName`] when no record
    /// matches.
    pub fn get_by_name(&self, name: &str) -> Result<Machine, MachineStoreError> {
        self.list()?
            .into_iter()
            .find(|machine| machine.instance.name == name)
            .ok_or_else(|| MachineStoreError::NotFoundByName {
                name: name.to_owned(),
            })
    }

    /// Lists every machine record, skipping files that are not valid
    /// records.
    ///
    /// # Errors
    ///
    /// Returns [`MachineStoreError::Io`] when the directory cannot be
    /// read.
    pub fn list(&self) -> Result<Vec<Machine>, MachineStoreError> {
        let io_error = |err: std::io::Error| MachineStoreError::Io {
            path: self.base.clone(),
            message: err.to_string(),
        };

        let mut machines = Vec::new();
        for entry in self.dir.entries().map_err(io_error)? {
            let entry = entry.map_err(io_error)?;
            if !entry.file_type().map_err(io_error)?.is_file() {
                continue;
            }
            let mut contents = String::new();
            entry
                .open()
                .and_then(|mut file| file.read_to_string(&mut contents))
                .map_err(io_error)?;
            match serde_json::from_str::<Machine>(&contents) {
                Ok(machine) => machines.push(machine),
                Err(err) => {
                    warn!(error = %err, "skipping file that is not a machine record");
                }
            }
        }
        machines.sort_by(|lhs, rhs| lhs.instance.name.cmp(&rhs.instance.name));
        Ok(machines)
    }

    /// Deletes the record for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`MachineStoreError::NotFoundById`] when no record
    /// exists.
    pub fn delete(&self, id: &str) -> Result<(), MachineStoreError> {
        let file_name = Self::file_name(id);
        match self.dir.remove_file(&file_name) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(MachineStoreError::NotFoundById { id: id.to_owned() })
            }
            Err(err) => Err(MachineStoreError::Io {
                path: self.base.join(&file_name),
                message: err.to_string(),
            }),
        }
    }

    fn file_name(id: &str) -> String {
        format!("{id}.json")
    }
}
