//! SSH transport: key generation, client sessions, and remote execution.

pub mod client;
pub mod keys;

pub use client::{
    DEFAULT_SSH_PORT, RemoteOutput, RemoteRunner, SshClient, SshError, SshRemoteRunner, SshTarget,
};
pub use keys::{KeyPair, KeyPairFiles, SshKeyError};
