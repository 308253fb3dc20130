//! Core library for the corral machine management tool.
//!
//! The crate provisions cloud instances running the Ollama service, tracks
//! them in a local record store, and exposes the service through one of
//! three connectivity strategies (private, public, or Tailscale). The
//! lifecycle orchestrator in [`provisioner`] drives each machine from key
//! generation through readiness, persisting progress after every phase so
//! an interrupted run always leaves a deletable record behind.

pub mod cloudinit;
pub mod connectivity;
pub mod credentials;
pub mod machine;
pub mod provider;
pub mod provisioner;
pub mod settings;
pub mod ssh;
pub mod tunnel;

pub use cloudinit::{CloudConfig, CloudInitError};
pub use connectivity::{Connectivity, ConnectivityError, ConnectivityKind, ConnectivityOptions};
pub use credentials::{
    CredentialKey, CredentialStore, CredentialStoreError, KeyringSecrets, MemorySecrets,
    SecretBackend,
};
pub use machine::store::{MachineStore, MachineStoreError};
pub use machine::{Machine, OllamaEndpoint};
pub use provider::{
    CreateMachineRequest, CreateMachineRequestBuilder, MachineKind, MachineManager, MachineState,
    ManagerFuture, ProviderCredentials, ProviderError, ProviderKind, ProviderMachine,
};
pub use provisioner::{ProvisionError, Provisioner};
pub use settings::{Settings, SettingsError, Storage};
pub use ssh::{
    KeyPair, KeyPairFiles, RemoteOutput, RemoteRunner, SshClient, SshError, SshKeyError,
    SshRemoteRunner, SshTarget,
};
pub use tunnel::{Tunnel, TunnelError};
