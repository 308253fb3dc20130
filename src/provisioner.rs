//! Machine lifecycle orchestration: create, delete, start, and stop.
//!
//! The creation path walks a fixed sequence of phases: generate a key
//! pair, assemble provisioning configuration, request the instance,
//! poll until it reports running, probe until Ollama is active, resolve
//! the service host, and persist the record after every settled phase.
//! There is no automatic rollback: a failed creation leaves the partial
//! machine and its key pair in place for an explicit delete.

use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::time::sleep;
use tracing::info;

use crate::cloudinit::{CloudConfig, CloudInitError, User, WriteFile};
use crate::connectivity::{Connectivity, ConnectivityError};
use crate::machine::store::{MachineStore, MachineStoreError};
use crate::machine::{
    Machine, OLLAMA_DEFAULT_PORT, OLLAMA_ENV_FILE_PATH, OllamaEndpoint, SSH_USERNAME,
};
use crate::provider::{
    CreateMachineRequest, MachineKind, MachineManager, MachineState, ProviderError,
    ProviderMachine,
};
use crate::ssh::{KeyPair, RemoteRunner, SshError, SshKeyError, keys};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const OLLAMA_STATUS_COMMAND: &str = "systemctl is-active ollama";
const OLLAMA_ACTIVE_STATUS: &str = "active";
const OLLAMA_INSTALL_COMMAND: &str = "curl -fsSL https://ollama.com/install.sh | sh";
const OLLAMA_START_COMMAND: &str = "sudo systemctl start ollama";
const OLLAMA_UNIT_OVERRIDE_PATH: &str = "/etc/systemd/system/ollama.service.d/override.conf";

/// Errors surfaced while orchestrating a machine's lifecycle.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Raised when key-pair generation fails.
    #[error("failed to generate key pair: {0}")]
    KeyPair(#[from] SshKeyError),
    /// Raised when provisioning configuration cannot be rendered.
    #[error("failed to assemble provisioning configuration: {0}")]
    CloudInit(#[from] CloudInitError),
    /// Raised when a provider operation fails.
    #[error("provider operation failed: {0}")]
    Provider(#[from] ProviderError),
    /// Raised when the machine record cannot be persisted or read.
    #[error("machine record error: {0}")]
    Store(#[from] MachineStoreError),
    /// Raised when the provider reports the machine in error state.
    #[error("machine {id} is in error state")]
    MachineErrored {
        /// Provider instance identifier.
        id: String,
    },
    /// Raised when SSH is needed but the machine lacks an address or
    /// key pair.
    #[error("machine {id} has no address or key pair for SSH")]
    MissingSshTarget {
        /// Provider instance identifier.
        id: String,
    },
    /// Raised when a remote-shell failure is not the retryable
    /// connection-refused case.
    #[error("remote shell failed: {0}")]
    Ssh(#[from] SshError),
    /// Raised when the connectivity strategy cannot resolve the host.
    #[error("failed to resolve Ollama host: {0}")]
    Connectivity(#[from] ConnectivityError),
    /// Raised when an injected deadline elapses before a wait settles.
    /// The default configuration has no deadline.
    #[error("timed out waiting for {action}")]
    DeadlineExceeded {
        /// Description of the wait that timed out.
        action: String,
    },
    /// Raised after a successful delete whose key-pair cleanup failed;
    /// the record is already gone.
    #[error("machine deleted, but key pair cleanup failed: {0}")]
    KeyPairCleanup(#[source] SshKeyError),
}

/// Drives machines through their lifecycle against one provider backend.
pub struct Provisioner<R: RemoteRunner> {
    provider_name: String,
    credentials_name: String,
    manager: Box<dyn MachineManager>,
    store: MachineStore,
    key_dir: Utf8PathBuf,
    runner: R,
    poll_interval: Duration,
    wait_deadline: Option<Duration>,
}

impl<R: RemoteRunner> Provisioner<R> {
    /// Creates a provisioner bound to one backend, record store, and key
    /// directory.
    #[must_use]
    pub fn new(
        provider_name: impl Into<String>,
        credentials_name: impl Into<String>,
        manager: Box<dyn MachineManager>,
        store: MachineStore,
        key_dir: impl Into<Utf8PathBuf>,
        runner: R,
    ) -> Self {
        Self {
            provider_name: provider_name.into(),
            credentials_name: credentials_name.into(),
            manager,
            store,
            key_dir: key_dir.into(),
            runner,
            poll_interval: DEFAULT_POLL_INTERVAL,
            wait_deadline: None,
        }
    }

    /// Overrides the polling interval. Primarily used by tests to keep
    /// scenarios fast.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bounds every wait loop with a deadline. The default is unbounded,
    /// interruptible only by process termination.
    #[must_use]
    pub const fn with_wait_deadline(mut self, deadline: Duration) -> Self {
        self.wait_deadline = Some(deadline);
        self
    }

    /// Remote runner the orchestrator probes with.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Creates a machine and drives it to readiness.
    ///
    /// The record is persisted immediately after the instance is
    /// requested, before readiness is confirmed, so an interrupted run
    /// still leaves a discoverable, deletable record.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when any phase fails. The partial
    /// machine is left in place.
    pub async fn create_machine(
        &self,
        mut request: CreateMachineRequest,
        connectivity: &Connectivity,
    ) -> Result<Machine, ProvisionError> {
        info!("generating SSH key pair");
        let (key_pair, key_pair_files) = keys::generate(&self.key_dir, &request.name)?;

        if self.manager.machine_kind() == MachineKind::Vm {
            info!("assembling provisioning configuration");
            request.user_data = self.render_cloud_init(connectivity, &key_pair)?;
        }

        info!("creating machine");
        let instance = self.manager.create(&request).await?;

        let mut machine = Machine {
            instance,
            ollama: OllamaEndpoint::default(),
            provider_name: self.provider_name.clone(),
            credentials_name: self.credentials_name.clone(),
            connectivity: connectivity.kind(),
            key_pair: Some(key_pair_files),
        };
        info!(id = %machine.instance.id, "saving machine record");
        self.store.save(&machine)?;

        info!("waiting for machine to report running");
        let settled = self
            .wait_for_state(&machine.instance.id, MachineState::Running)
            .await?;
        update_instance(&mut machine, settled);
        self.store.save(&machine)?;

        info!("waiting for Ollama to start");
        self.wait_for_ollama(&machine).await?;

        info!("resolving Ollama host");
        machine.ollama.host = connectivity.retrieve_ollama_host(&machine, &self.runner)?;
        machine.ollama.port = OLLAMA_DEFAULT_PORT;
        self.store.save(&machine)?;

        info!(name = %machine.instance.name, "machine ready");
        Ok(machine)
    }

    /// Deletes a machine: backend instance, key-pair files, record.
    ///
    /// Key-pair cleanup never blocks record deletion; a cleanup failure
    /// is surfaced only after the record is gone. Key files that are
    /// already absent count as removed.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the machine cannot be resolved,
    /// the backend delete fails, or the record cannot be removed.
    pub async fn delete_machine(&self, name: &str) -> Result<(), ProvisionError> {
        let machine = self.store.get_by_name(name)?;

        info!(id = %machine.instance.id, "deleting machine");
        self.manager.delete(&machine.instance.id).await?;

        let cleanup_failure = match &machine.key_pair {
            Some(files) => {
                info!("removing key pair files");
                keys::delete(files).err()
            }
            None => None,
        };

        info!("removing machine record");
        self.store.delete(&machine.instance.id)?;

        if let Some(failure) = cleanup_failure {
            return Err(ProvisionError::KeyPairCleanup(failure));
        }
        info!("machine deleted");
        Ok(())
    }

    /// Starts a stopped machine and waits until it reports running.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the backend call fails or the
    /// machine enters error state.
    pub async fn start_machine(&self, name: &str) -> Result<Machine, ProvisionError> {
        let mut machine = self.store.get_by_name(name)?;

        info!(id = %machine.instance.id, "starting machine");
        self.manager.start(&machine.instance.id).await?;
        let settled = self
            .wait_for_state(&machine.instance.id, MachineState::Running)
            .await?;
        update_instance(&mut machine, settled);
        self.store.save(&machine)?;

        info!("machine started");
        Ok(machine)
    }

    /// Stops a running machine and waits until it reports stopped.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the backend call fails or the
    /// machine enters error state.
    pub async fn stop_machine(&self, name: &str) -> Result<Machine, ProvisionError> {
        let mut machine = self.store.get_by_name(name)?;

        info!(id = %machine.instance.id, "stopping machine");
        self.manager.stop(&machine.instance.id).await?;
        let settled = self
            .wait_for_state(&machine.instance.id, MachineState::Stopped)
            .await?;
        update_instance(&mut machine, settled);
        self.store.save(&machine)?;

        info!("machine stopped");
        Ok(machine)
    }

    fn render_cloud_init(
        &self,
        connectivity: &Connectivity,
        key_pair: &KeyPair,
    ) -> Result<Vec<u8>, ProvisionError> {
        let mut config = CloudConfig::new();
        config.add_user(User {
            name: SSH_USERNAME.to_owned(),
            groups: Some(String::from("sudo")),
            shell: Some(String::from("/bin/bash")),
            sudo: Some(String::from("ALL=(ALL) NOPASSWD:ALL")),
            ssh_authorized_keys: vec![key_pair.public_key.clone()],
            password_hash: None,
        });

        connectivity.install_via_cloud_init(&mut config);

        config.add_file(WriteFile {
            path: String::from(OLLAMA_UNIT_OVERRIDE_PATH),
            content: format!("[Service]\nEnvironmentFile={OLLAMA_ENV_FILE_PATH}"),
            ..WriteFile::default()
        });
        config.add_shell_command(OLLAMA_INSTALL_COMMAND);
        config.add_shell_command(OLLAMA_START_COMMAND);

        Ok(config.render()?)
    }

    async fn wait_for_state(
        &self,
        id: &str,
        target: MachineState,
    ) -> Result<ProviderMachine, ProvisionError> {
        let deadline = self.deadline();
        loop {
            let instance = self.manager.get(id).await?;
            if instance.state == MachineState::Error {
                return Err(ProvisionError::MachineErrored { id: id.to_owned() });
            }
            if instance.state == target {
                return Ok(instance);
            }

            check_deadline(deadline, "machine state")?;
            info!(state = %instance.state, desired = %target, "still waiting for machine");
            sleep(self.poll_interval).await;
        }
    }

    async fn wait_for_ollama(&self, machine: &Machine) -> Result<(), ProvisionError> {
        let target = machine
            .ssh_target()
            .ok_or_else(|| ProvisionError::MissingSshTarget {
                id: machine.instance.id.clone(),
            })?;

        let deadline = self.deadline();
        loop {
            match self.runner.run(&target, OLLAMA_STATUS_COMMAND) {
                Ok(probe) => {
                    let status = probe.output.trim();
                    if status == OLLAMA_ACTIVE_STATUS {
                        info!("Ollama is active");
                        return Ok(());
                    }
                    // A non-active probe result is expected while the
                    // service is still coming up; keep retrying.
                    info!(status, "still waiting for Ollama");
                }
                Err(SshError::ConnectionRefused { .. }) => {
                    info!("waiting for SSH to accept connections");
                }
                Err(other) => return Err(ProvisionError::Ssh(other)),
            }

            check_deadline(deadline, "Ollama startup")?;
            sleep(self.poll_interval).await;
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.wait_deadline.map(|limit| Instant::now() + limit)
    }
}

fn check_deadline(deadline: Option<Instant>, action: &str) -> Result<(), ProvisionError> {
    if let Some(at) = deadline
        && Instant::now() > at
    {
        return Err(ProvisionError::DeadlineExceeded {
            action: action.to_owned(),
        });
    }
    Ok(())
}

/// Refreshes provider-owned fields from a poll result while keeping the
/// operator-chosen name and the creation-time id.
fn update_instance(machine: &mut Machine, polled: ProviderMachine) {
    machine.instance.state = polled.state;
    machine.instance.ip = polled.ip;
    if !polled.region.is_empty() {
        machine.instance.region = polled.region;
    }
}
