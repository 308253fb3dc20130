//! Network exposure strategies for a machine's Ollama service.
//!
//! A strategy is chosen once at creation time and fixed for the
//! machine's lifetime. It decides two things: which provisioning steps
//! are injected into the cloud-init document, and how the externally
//! reachable Ollama host is resolved once the machine is alive.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use shell_escape::unix::escape;
use thiserror::Error;

use crate::cloudinit::CloudConfig;
use crate::machine::{Machine, OLLAMA_ENV_FILE_PATH};
use crate::ssh::{RemoteRunner, SshError};

/// Host returned for machines that keep Ollama loopback-only.
pub const LOOPBACK_HOST: &str = "localhost";

const TAILSCALE_IP_COMMAND: &str = "tailscale ip -4";

/// Operator intent for a machine's connectivity.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectivityOptions {
    /// Expose Ollama publicly.
    pub public: bool,
    /// Join the machine to a tailnet with this auth key.
    pub tailscale_auth_key: Option<String>,
}

/// Name of a connectivity strategy as stored on machine records.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityKind {
    /// Loopback-only; reachable through the tunnel.
    #[default]
    Private,
    /// Bound to all interfaces and reachable on the public IP.
    Public,
    /// Reachable on the machine's tailnet address.
    Tailscale,
}

impl ConnectivityKind {
    /// Lowercase strategy name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Public => "public",
            Self::Tailscale => "tailscale",
        }
    }
}

impl fmt::Display for ConnectivityKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Errors raised while resolving a machine's Ollama host.
#[derive(Debug, Error)]
pub enum ConnectivityError {
    /// Raised when the provider never reported a public IP.
    #[error("machine {id} has no public IP address")]
    MissingPublicIp {
        /// Machine identifier.
        id: String,
    },
    /// Raised when a remote query is needed but the machine has no
    /// address or key pair.
    #[error("machine {id} has no address or key pair for SSH")]
    MissingSshTarget {
        /// Machine identifier.
        id: String,
    },
    /// Raised when the remote overlay query fails. Transient SSH
    /// unavailability surfaces here and is the caller's to retry.
    #[error("failed to query overlay address: {0}")]
    Ssh(#[from] SshError),
    /// Raised when the overlay client reports no address.
    #[error("machine {id} reported an empty overlay address")]
    EmptyOverlayAddress {
        /// Machine identifier.
        id: String,
    },
}

/// A connectivity strategy, carrying any creation-time inputs it needs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Connectivity {
    /// Keep Ollama bound to loopback.
    Private,
    /// Bind Ollama to all interfaces.
    Public,
    /// Join a tailnet and bind Ollama to the overlay address.
    Tailscale {
        /// Pre-authorised key used to join the tailnet.
        auth_key: String,
    },
}

impl Connectivity {
    /// Selects a strategy from operator options. Public wins over a
    /// supplied auth key; the default is private.
    #[must_use]
    pub fn from_options(options: &ConnectivityOptions) -> Self {
        if options.public {
            return Self::Public;
        }
        if let Some(key) = options.tailscale_auth_key.as_deref()
            && !key.trim().is_empty()
        {
            return Self::Tailscale {
                auth_key: key.trim().to_owned(),
            };
        }
        Self::Private
    }

    /// Name of the strategy as recorded on machines.
    #[must_use]
    pub const fn kind(&self) -> ConnectivityKind {
        match self {
            Self::Private => ConnectivityKind::Private,
            Self::Public => ConnectivityKind::Public,
            Self::Tailscale { .. } => ConnectivityKind::Tailscale,
        }
    }

    /// Strategy name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Appends the strategy's provisioning steps to the cloud-config
    /// builder. Call at most once per build; calling twice appends the
    /// commands twice.
    pub fn install_via_cloud_init(&self, config: &mut CloudConfig) {
        match self {
            Self::Private => {
                config.add_shell_command(format!(
                    "echo \"OLLAMA_HOST={LOOPBACK_HOST}\" > {OLLAMA_ENV_FILE_PATH}"
                ));
            }
            Self::Public => {
                config.add_shell_command(format!(
                    "echo \"OLLAMA_HOST=0.0.0.0\" > {OLLAMA_ENV_FILE_PATH}"
                ));
            }
            Self::Tailscale { auth_key } => {
                config.add_shell_command("curl -fsSL https://tailscale.com/install.sh | sh");
                config.add_shell_command(
                    "echo 'net.ipv4.ip_forward = 1' | sudo tee -a /etc/sysctl.d/99-tailscale.conf \
                     && echo 'net.ipv6.conf.all.forwarding = 1' | sudo tee -a \
                     /etc/sysctl.d/99-tailscale.conf && sudo sysctl -p \
                     /etc/sysctl.d/99-tailscale.conf",
                );
                config.add_shell_command(format!(
                    "tailscale up --auth-key={}",
                    escape(Cow::from(auth_key.as_str()))
                ));
                config.add_shell_command(format!(
                    "echo \"OLLAMA_HOST=$(tailscale ip -4)\" > {OLLAMA_ENV_FILE_PATH}"
                ));
            }
        }
    }

    /// Resolves the host Ollama is reachable on for this machine.
    ///
    /// Private and public resolution are pure queries over the machine
    /// record; the Tailscale variant runs one remote command to ask the
    /// overlay client for its address.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectivityError`] when the machine lacks the needed
    /// inputs or the remote query fails.
    pub fn retrieve_ollama_host(
        &self,
        machine: &Machine,
        runner: &dyn RemoteRunner,
    ) -> Result<String, ConnectivityError> {
        match self {
            Self::Private => Ok(LOOPBACK_HOST.to_owned()),
            Self::Public => machine.instance.ip.clone().ok_or_else(|| {
                ConnectivityError::MissingPublicIp {
                    id: machine.instance.id.clone(),
                }
            }),
            Self::Tailscale { .. } => {
                let target = machine.ssh_target().ok_or_else(|| {
                    ConnectivityError::MissingSshTarget {
                        id: machine.instance.id.clone(),
                    }
                })?;
                let result = runner.run(&target, TAILSCALE_IP_COMMAND)?;
                let address = result.output.trim();
                if address.is_empty() {
                    return Err(ConnectivityError::EmptyOverlayAddress {
                        id: machine.instance.id.clone(),
                    });
                }
                Ok(address.to_owned())
            }
        }
    }
}
