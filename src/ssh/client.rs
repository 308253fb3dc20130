//! Blocking SSH client used for service probes, host resolution, and
//! tunnels.
//!
//! Host-key verification is intentionally not enforced: machines are
//! created and destroyed by this tool faster than any known-hosts
//! workflow could track them. This is an accepted operational risk.

use std::io::{self, Read as _};
use std::net::TcpStream;

use ssh2::Session;
use thiserror::Error;

use super::keys::KeyPairFiles;

/// TCP port machines expose SSH on.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Everything needed to open an authenticated session to one machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshTarget {
    /// Host name or IP address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Key pair used for public-key authentication.
    pub key_pair: KeyPairFiles,
}

/// Output captured from a remote command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteOutput {
    /// Exit status of the remote command, when one was reported.
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
}

/// Errors raised by the SSH client.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshError {
    /// Raised when the TCP connection is refused, which during boot
    /// means the SSH daemon is not up yet.
    #[error("connection refused by {host}:{port}")]
    ConnectionRefused {
        /// Host that refused the connection.
        host: String,
        /// Port that was dialled.
        port: u16,
    },
    /// Raised for any other connection failure.
    #[error("failed to connect to {host}:{port}: {message}")]
    Connect {
        /// Host that was dialled.
        host: String,
        /// Port that was dialled.
        port: u16,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the SSH handshake fails.
    #[error("ssh handshake with {host} failed: {message}")]
    Handshake {
        /// Host the handshake was attempted with.
        host: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when public-key authentication fails.
    #[error("authentication as {user}@{host} failed: {message}")]
    Auth {
        /// Login user.
        user: String,
        /// Host authentication was attempted against.
        host: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when executing a remote command fails.
    #[error("remote command failed: {message}")]
    Command {
        /// Underlying error message.
        message: String,
    },
    /// Raised when a forwarding channel cannot be opened.
    #[error("failed to open channel to {host}:{port}: {message}")]
    Channel {
        /// Forwarding destination host.
        host: String,
        /// Forwarding destination port.
        port: u16,
        /// Underlying error message.
        message: String,
    },
}

/// An authenticated SSH session to one machine.
pub struct SshClient {
    session: Session,
}

impl SshClient {
    /// Connects and authenticates with the target's key pair.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::ConnectionRefused`] while the SSH daemon is
    /// not accepting connections yet, or other [`SshError`] variants for
    /// handshake and authentication failures.
    pub fn connect(target: &SshTarget) -> Result<Self, SshError> {
        let stream =
            TcpStream::connect((target.host.as_str(), target.port)).map_err(|err| {
                if err.kind() == io::ErrorKind::ConnectionRefused {
                    SshError::ConnectionRefused {
                        host: target.host.clone(),
                        port: target.port,
                    }
                } else {
                    SshError::Connect {
                        host: target.host.clone(),
                        port: target.port,
                        message: err.to_string(),
                    }
                }
            })?;

        let mut session = Session::new().map_err(|err| SshError::Handshake {
            host: target.host.clone(),
            message: err.to_string(),
        })?;
        session.set_tcp_stream(stream);
        session.handshake().map_err(|err| SshError::Handshake {
            host: target.host.clone(),
            message: err.to_string(),
        })?;

        session
            .userauth_pubkey_file(
                &target.user,
                Some(target.key_pair.public_key_path.as_std_path()),
                target.key_pair.private_key_path.as_std_path(),
                None,
            )
            .map_err(|err| SshError::Auth {
                user: target.user.clone(),
                host: target.host.clone(),
                message: err.to_string(),
            })?;

        Ok(Self { session })
    }

    /// Runs a command and captures its combined output and exit status.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Command`] when the channel cannot be opened or
    /// the command cannot be executed.
    pub fn run(&self, command: &str) -> Result<RemoteOutput, SshError> {
        let command_error = |err: ssh2::Error| SshError::Command {
            message: err.to_string(),
        };

        let mut channel = self.session.channel_session().map_err(command_error)?;
        channel.exec(command).map_err(command_error)?;

        let mut output = String::new();
        channel
            .read_to_string(&mut output)
            .map_err(|err| SshError::Command {
                message: err.to_string(),
            })?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(|err| SshError::Command {
                message: err.to_string(),
            })?;
        output.push_str(&stderr);

        channel.wait_close().map_err(command_error)?;
        let exit_code = channel.exit_status().ok();

        Ok(RemoteOutput { exit_code, output })
    }

    /// Opens a direct-tcpip channel to `host:port` through this session.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Channel`] when the channel cannot be opened.
    pub fn open_direct(&self, host: &str, port: u16) -> Result<ssh2::Channel, SshError> {
        self.session
            .channel_direct_tcpip(host, port, None)
            .map_err(|err| SshError::Channel {
                host: host.to_owned(),
                port,
                message: err.to_string(),
            })
    }

    /// Underlying session, used by the tunnel for channel multiplexing.
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }
}

/// Abstraction over remote command execution, for dependency injection.
pub trait RemoteRunner {
    /// Connects to the target and runs one command.
    ///
    /// # Errors
    ///
    /// Returns [`SshError`] when the connection or command fails.
    fn run(&self, target: &SshTarget, command: &str) -> Result<RemoteOutput, SshError>;
}

/// Remote runner that opens a fresh SSH session per command.
#[derive(Clone, Copy, Debug, Default)]
pub struct SshRemoteRunner;

impl RemoteRunner for SshRemoteRunner {
    fn run(&self, target: &SshTarget, command: &str) -> Result<RemoteOutput, SshError> {
        let client = SshClient::connect(target)?;
        client.run(command)
    }
}
