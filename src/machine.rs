//! Canonical machine records shared across providers.
//!
//! A [`Machine`] wraps the provider's view of an instance with the local
//! metadata needed to reach it again: which provider and credentials
//! created it, the connectivity strategy it was built with, its key-pair
//! files, and the resolved Ollama endpoint.

pub mod store;

use serde::{Deserialize, Serialize};

use crate::connectivity::ConnectivityKind;
use crate::provider::ProviderMachine;
use crate::ssh::{DEFAULT_SSH_PORT, KeyPairFiles, SshTarget};

/// Login user created on every VM.
pub const SSH_USERNAME: &str = "corral";

/// Environment file the Ollama systemd unit is pointed at.
pub const OLLAMA_ENV_FILE_PATH: &str = "/home/corral/env";

/// Port Ollama serves on by default.
pub const OLLAMA_DEFAULT_PORT: u16 = 11434;

/// Resolved endpoint of the managed Ollama service.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct OllamaEndpoint {
    /// Host the service is reachable on.
    #[serde(default)]
    pub host: String,
    /// Port the service listens on.
    #[serde(default)]
    pub port: u16,
}

impl OllamaEndpoint {
    /// Joins host and port into an address string.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Canonical record of one provisioned machine.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    /// Provider-side view of the instance.
    #[serde(flatten)]
    pub instance: ProviderMachine,
    /// Resolved Ollama endpoint; empty until host resolution completes.
    #[serde(default)]
    pub ollama: OllamaEndpoint,
    /// Provider backend that created the machine.
    pub provider_name: String,
    /// Stored credentials the machine was created with.
    pub credentials_name: String,
    /// Connectivity strategy fixed at creation time. Absent means
    /// private.
    #[serde(default)]
    pub connectivity: ConnectivityKind,
    /// Key-pair files owned by this machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_pair: Option<KeyPairFiles>,
}

impl Machine {
    /// SSH target for this machine, when it has an address and a key
    /// pair.
    #[must_use]
    pub fn ssh_target(&self) -> Option<SshTarget> {
        let host = self.instance.ip.clone()?;
        let key_pair = self.key_pair.clone()?;
        Some(SshTarget {
            host,
            port: DEFAULT_SSH_PORT,
            user: SSH_USERNAME.to_owned(),
            key_pair,
        })
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use crate::provider::MachineState;

    use super::*;

    fn sample_machine() -> Machine {
        Machine {
            instance: ProviderMachine {
                id: String::from("m-123"),
                name: String::from("demo"),
                ip: Some(String::from("198.51.100.7")),
                region: String::from("fr-par-1"),
                state: MachineState::Running,
            },
            ollama: OllamaEndpoint {
                host: String::from("localhost"),
                port: OLLAMA_DEFAULT_PORT,
            },
            provider_name: String::from("scaleway"),
            credentials_name: String::from("acct1"),
            connectivity: ConnectivityKind::Private,
            key_pair: Some(KeyPairFiles {
                private_key_path: Utf8PathBuf::from("/tmp/keys/demo"),
                public_key_path: Utf8PathBuf::from("/tmp/keys/demo.pub"),
            }),
        }
    }

    #[test]
    fn record_round_trips_through_json() {
        let machine = sample_machine();
        let encoded = serde_json::to_string(&machine).unwrap_or_else(|err| panic!("{err}"));
        let decoded: Machine =
            serde_json::from_str(&encoded).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(decoded, machine);
    }

    #[test]
    fn record_uses_camel_case_field_names() {
        let machine = sample_machine();
        let encoded = serde_json::to_string(&machine).unwrap_or_else(|err| panic!("{err}"));
        assert!(encoded.contains("\"providerName\""), "got: {encoded}");
        assert!(encoded.contains("\"credentialsName\""), "got: {encoded}");
        assert!(encoded.contains("\"keyPair\""), "got: {encoded}");
        assert!(encoded.contains("\"privateKeyPath\""), "got: {encoded}");
    }

    #[test]
    fn missing_connectivity_defaults_to_private() {
        let record = r#"{
            "id": "m-1",
            "name": "demo",
            "region": "",
            "state": "running",
            "providerName": "noop",
            "credentialsName": "acct1"
        }"#;
        let decoded: Machine =
            serde_json::from_str(record).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(decoded.connectivity, ConnectivityKind::Private);
        assert!(decoded.key_pair.is_none());
    }

    #[test]
    fn ssh_target_requires_ip_and_key_pair() {
        let machine = sample_machine();
        let target = machine
            .ssh_target()
            .unwrap_or_else(|| panic!("target should exist"));
        assert_eq!(target.host, "198.51.100.7");
        assert_eq!(target.port, DEFAULT_SSH_PORT);
        assert_eq!(target.user, SSH_USERNAME);

        let mut without_ip = sample_machine();
        without_ip.instance.ip = None;
        assert!(without_ip.ssh_target().is_none());

        let mut without_keys = sample_machine();
        without_keys.key_pair = None;
        assert!(without_keys.ssh_target().is_none());
    }

    #[test]
    fn ollama_endpoint_joins_host_and_port() {
        let endpoint = OllamaEndpoint {
            host: String::from("localhost"),
            port: 11434,
        };
        assert_eq!(endpoint.address(), "localhost:11434");
    }
}
