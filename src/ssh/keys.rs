//! Per-machine SSH key-pair generation and cleanup.
//!
//! Each machine owns exactly one Ed25519 key pair, named after the
//! machine inside the key directory. The private key is written with
//! `0o600` permissions and never leaves local disk; both files are
//! removed when the machine is deleted.

use std::io::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::{Dir, OpenOptions};
use serde::{Deserialize, Serialize};
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use thiserror::Error;

/// A generated key pair held in memory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyPair {
    /// OpenSSH-encoded private key.
    pub private_key: String,
    /// Authorized-keys line for the public key.
    pub public_key: String,
}

/// Paths to a key pair written to disk.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPairFiles {
    /// Path of the private key file.
    pub private_key_path: Utf8PathBuf,
    /// Path of the public key file.
    pub public_key_path: Utf8PathBuf,
}

/// Errors raised while generating or removing key pairs.
#[derive(Debug, Error)]
pub enum SshKeyError {
    /// Raised when the key directory cannot be opened.
    #[error("key directory {path} is not accessible: {message}")]
    KeyDirectory {
        /// Directory that could not be opened.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// Raised when key generation or encoding fails.
    #[error("failed to generate key pair: {message}")]
    Generate {
        /// Underlying error message.
        message: String,
    },
    /// Raised when a key file cannot be written.
    #[error("failed to write {path}: {message}")]
    Write {
        /// File that could not be written.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// Raised when a key file cannot be removed.
    #[error("failed to remove {path}: {message}")]
    Remove {
        /// File that could not be removed.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
}

/// Generates an Ed25519 key pair for `machine_name` inside `key_dir`.
///
/// # Errors
///
/// Returns [`SshKeyError::KeyDirectory`] when the directory is
/// inaccessible, or [`SshKeyError`] variants for generation and write
/// failures.
pub fn generate(
    key_dir: &Utf8Path,
    machine_name: &str,
) -> Result<(KeyPair, KeyPairFiles), SshKeyError> {
    let dir =
        Dir::open_ambient_dir(key_dir, ambient_authority()).map_err(|err| {
            SshKeyError::KeyDirectory {
                path: key_dir.to_owned(),
                message: err.to_string(),
            }
        })?;

    let private = PrivateKey::random(&mut rand_core::OsRng, Algorithm::Ed25519).map_err(|err| {
        SshKeyError::Generate {
            message: err.to_string(),
        }
    })?;
    let private_openssh = private
        .to_openssh(LineEnding::LF)
        .map_err(|err| SshKeyError::Generate {
            message: err.to_string(),
        })?;
    let public_openssh = private
        .public_key()
        .to_openssh()
        .map_err(|err| SshKeyError::Generate {
            message: err.to_string(),
        })?;

    let key_pair = KeyPair {
        private_key: private_openssh.as_str().to_owned(),
        public_key: public_openssh,
    };

    let private_name = machine_name.to_owned();
    let public_name = format!("{machine_name}.pub");
    let files = KeyPairFiles {
        private_key_path: key_dir.join(&private_name),
        public_key_path: key_dir.join(&public_name),
    };

    write_key(&dir, &private_name, &key_pair.private_key, 0o600).map_err(|message| {
        SshKeyError::Write {
            path: files.private_key_path.clone(),
            message,
        }
    })?;
    let public_contents = format!("{}\n", key_pair.public_key);
    write_key(&dir, &public_name, &public_contents, 0o644).map_err(|message| {
        SshKeyError::Write {
            path: files.public_key_path.clone(),
            message,
        }
    })?;

    Ok((key_pair, files))
}

/// Removes both key files. Files that are already absent count as
/// removed.
///
/// # Errors
///
/// Returns [`SshKeyError::Remove`] when a file exists but cannot be
/// deleted.
pub fn delete(files: &KeyPairFiles) -> Result<(), SshKeyError> {
    remove_ambient(&files.private_key_path)?;
    remove_ambient(&files.public_key_path)
}

fn write_key(dir: &Dir, name: &str, contents: &str, mode: u32) -> Result<(), String> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use cap_std::fs::OpenOptionsExt as _;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = dir.open_with(name, &options).map_err(|err| err.to_string())?;
    file.write_all(contents.as_bytes())
        .map_err(|err| err.to_string())
}

fn remove_ambient(path: &Utf8Path) -> Result<(), SshKeyError> {
    let (parent, file_name) = split_path(path)?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        // A missing parent directory means the file is gone too.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(SshKeyError::Remove {
                path: path.to_owned(),
                message: err.to_string(),
            });
        }
    };
    match dir.remove_file(file_name) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SshKeyError::Remove {
            path: path.to_owned(),
            message: err.to_string(),
        }),
    }
}

fn split_path(path: &Utf8Path) -> Result<(&Utf8Path, &str), SshKeyError> {
    let parent = path.parent().ok_or_else(|| SshKeyError::Remove {
        path: path.to_owned(),
        message: String::from("path has no parent directory"),
    })?;
    let file_name = path.file_name().ok_or_else(|| SshKeyError::Remove {
        path: path.to_owned(),
        message: String::from("path has no file name"),
    })?;
    Ok((parent, file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("{err}"));
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non-utf8 temp dir: {}", path.display()));
        (dir, path)
    }

    #[test]
    fn generate_writes_both_key_files() {
        let (_guard, dir) = scratch_dir();
        let (key_pair, files) = generate(&dir, "demo").unwrap_or_else(|err| panic!("{err}"));

        assert!(key_pair.public_key.starts_with("ssh-ed25519 "));
        assert!(key_pair.private_key.contains("OPENSSH PRIVATE KEY"));
        assert_eq!(files.private_key_path, dir.join("demo"));
        assert_eq!(files.public_key_path, dir.join("demo.pub"));
        assert!(files.private_key_path.as_std_path().exists());
        assert!(files.public_key_path.as_std_path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn private_key_is_owner_readable_only() {
        use std::os::unix::fs::PermissionsExt as _;

        let (_guard, dir) = scratch_dir();
        let (_, files) = generate(&dir, "demo").unwrap_or_else(|err| panic!("{err}"));
        let metadata = std::fs::metadata(files.private_key_path.as_std_path())
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn generate_fails_for_missing_directory() {
        let (_guard, dir) = scratch_dir();
        let missing = dir.join("nope");
        let result = generate(&missing, "demo");
        assert!(matches!(result, Err(SshKeyError::KeyDirectory { .. })));
    }

    #[test]
    fn delete_removes_files_and_tolerates_missing_ones() {
        let (_guard, dir) = scratch_dir();
        let (_, files) = generate(&dir, "demo").unwrap_or_else(|err| panic!("{err}"));

        delete(&files).unwrap_or_else(|err| panic!("{err}"));
        assert!(!files.private_key_path.as_std_path().exists());

        // A second delete finds nothing to remove and still succeeds.
        delete(&files).unwrap_or_else(|err| panic!("{err}"));
    }
}
