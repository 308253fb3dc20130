//! Provider capability contract shared by every cloud backend.
//!
//! Each backend implements [`MachineManager`] for instance lifecycle
//! operations and exposes a credentials type implementing
//! [`ProviderCredentials`]. Backends are a closed set dispatched through
//! [`ProviderKind`], so adding one is a compile-time change with
//! exhaustiveness checking on every match.

pub mod noop;
pub mod scaleway;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::{CredentialKey, CredentialStore, CredentialStoreError, SecretBackend};

pub use noop::{NoopCredentialArgs, NoopCredentials, NoopMachineManager};
pub use scaleway::{ScalewayCredentialArgs, ScalewayCredentials, ScalewayMachineManager};

/// Canonical machine states shared across providers.
///
/// Backends map their native status vocabulary onto this enum; a native
/// state with no mapping reads as [`MachineState::Pending`], never as
/// running.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    /// The machine is being prepared or is in an unrecognised state.
    Pending,
    /// The machine is up.
    Running,
    /// The machine is halted but can be started again.
    Stopped,
    /// The machine has been destroyed.
    Terminated,
    /// The provider reports the machine as failed.
    Error,
}

impl MachineState {
    /// Lowercase name used in records and log lines.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Kind of machine a backend manages.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineKind {
    /// Full virtual machine; receives cloud-init user data.
    Vm,
    /// Container; provisioning configuration is not injected.
    Container,
}

/// Provider-side view of a machine instance.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProviderMachine {
    /// Provider-assigned identifier, immutable once created.
    pub id: String,
    /// Instance name as known to the provider.
    pub name: String,
    /// Public IP address, absent until the provider assigns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Region or zone the instance lives in.
    #[serde(default)]
    pub region: String,
    /// Current canonical state.
    pub state: MachineState,
}

/// Operator intent for creating a machine.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateMachineRequest {
    /// Operator-chosen machine name, unique within the local store.
    pub name: String,
    /// Instance type (flavor) to request; backends may default it.
    pub instance_type: String,
    /// Boot image label or identifier.
    pub image: String,
    /// Provider region.
    pub region: String,
    /// Availability zone inside the region.
    pub zone: String,
    /// Tags to attach to the instance.
    pub tags: BTreeMap<String, String>,
    /// Pre-rendered provisioning configuration, opaque to backends.
    /// Populated by the orchestrator for VM-kind backends.
    pub user_data: Vec<u8>,
}

impl CreateMachineRequest {
    /// Starts a builder for a [`CreateMachineRequest`].
    #[must_use]
    pub fn builder() -> CreateMachineRequestBuilder {
        CreateMachineRequestBuilder::default()
    }
}

/// Builder for [`CreateMachineRequest`] that defers trimming and
/// validation to construction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateMachineRequestBuilder {
    name: String,
    instance_type: String,
    image: String,
    region: String,
    zone: String,
    tags: BTreeMap<String, String>,
}

impl CreateMachineRequestBuilder {
    /// Sets the machine name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    /// Sets the instance type.
    #[must_use]
    pub fn instance_type(mut self, value: impl Into<String>) -> Self {
        self.instance_type = value.into();
        self
    }

    /// Sets the boot image.
    #[must_use]
    pub fn image(mut self, value: impl Into<String>) -> Self {
        self.image = value.into();
        self
    }

    /// Sets the region.
    #[must_use]
    pub fn region(mut self, value: impl Into<String>) -> Self {
        self.region = value.into();
        self
    }

    /// Sets the availability zone.
    #[must_use]
    pub fn zone(mut self, value: impl Into<String>) -> Self {
        self.zone = value.into();
        self
    }

    /// Attaches a tag.
    #[must_use]
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Builds the request, trimming string inputs.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Validation`] when the machine name is
    /// empty.
    pub fn build(self) -> Result<CreateMachineRequest, ProviderError> {
        let request = CreateMachineRequest {
            name: self.name.trim().to_owned(),
            instance_type: self.instance_type.trim().to_owned(),
            image: self.image.trim().to_owned(),
            region: self.region.trim().to_owned(),
            zone: self.zone.trim().to_owned(),
            tags: self.tags,
            user_data: Vec::new(),
        };
        if request.name.is_empty() {
            return Err(ProviderError::Validation(String::from("name")));
        }
        Ok(request)
    }
}

/// Errors raised by provider backends.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Raised when a provider name does not match any backend.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    /// Raised when a manager is requested before credentials were supplied.
    #[error("credentials not set")]
    CredentialsNotSet,
    /// Raised when supplied credentials fail validation.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    /// Raised when a request is missing a required field.
    #[error("invalid machine request: missing {0}")]
    Validation(String),
    /// Raised when an instance cannot be found.
    #[error("machine {id} not found")]
    NotFound {
        /// Provider instance identifier.
        id: String,
    },
    /// Raised when an operation is refused because of the instance state.
    #[error("machine {id} is in unexpected state {state}")]
    UnexpectedState {
        /// Provider instance identifier.
        id: String,
        /// Native state reported by the provider.
        state: String,
    },
    /// Raised when the requested image cannot be resolved.
    #[error("image '{label}' not found in zone {zone}")]
    ImageNotFound {
        /// Image label passed by the caller.
        label: String,
        /// Zone used for the lookup.
        zone: String,
    },
    /// Raised when teardown leaves an instance visible in the API.
    #[error("instance {instance_id} still present after teardown")]
    ResidualResource {
        /// Provider instance identifier.
        instance_id: String,
    },
    /// Wrapper for provider-level API failures.
    #[error("provider error: {message}")]
    Api {
        /// Message returned by the provider API.
        message: String,
    },
}

/// Future returned by manager operations.
pub type ManagerFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Instance lifecycle operations implemented by every backend.
pub trait MachineManager: Send + Sync {
    /// Creates a new machine from the request.
    fn create<'a>(
        &'a self,
        request: &'a CreateMachineRequest,
    ) -> ManagerFuture<'a, ProviderMachine>;

    /// Deletes the machine with the given id, reversing any
    /// backend-specific preparatory resources.
    ///
    /// Deleting an instance that no longer exists is a success; the
    /// not-found condition reads as already-deleted.
    fn delete<'a>(&'a self, id: &'a str) -> ManagerFuture<'a, ()>;

    /// Starts a stopped machine.
    fn start<'a>(&'a self, id: &'a str) -> ManagerFuture<'a, ()>;

    /// Stops a running machine. Once settled the instance must incur
    /// storage-tier cost only, never compute-tier cost.
    fn stop<'a>(&'a self, id: &'a str) -> ManagerFuture<'a, ()>;

    /// Returns the machine's current canonical state and networking.
    fn get<'a>(&'a self, id: &'a str) -> ManagerFuture<'a, ProviderMachine>;

    /// Kind of machine this backend manages.
    fn machine_kind(&self) -> MachineKind;
}

/// Mutable credentials object exposed by each backend.
pub trait ProviderCredentials {
    /// Validates that all required fields are present.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidCredentials`] naming the missing
    /// field.
    fn validate(&self) -> Result<(), ProviderError>;

    /// Completes the credentials interactively, for example by reading a
    /// secret from standard input.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidCredentials`] when the interactive
    /// prompt fails.
    fn complete(&mut self) -> Result<(), ProviderError>;

    /// Serialises the credentials for the credential store.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidCredentials`] when encoding fails.
    fn to_json(&self) -> Result<serde_json::Value, ProviderError>;
}

/// Provider-specific credential flags, one optional group per backend.
#[derive(Clone, Debug, Default, clap::Args)]
pub struct CredentialArgs {
    /// Scaleway credential flags.
    #[command(flatten)]
    pub scaleway: ScalewayCredentialArgs,
    /// No-op credential flags.
    #[command(flatten)]
    pub noop: NoopCredentialArgs,
}

/// Closed set of compiled-in provider backends.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProviderKind {
    /// Scaleway Instances backend.
    Scaleway,
    /// No-op backend for tests and dry runs.
    Noop,
}

impl ProviderKind {
    /// Every compiled-in backend.
    pub const ALL: [Self; 2] = [Self::Scaleway, Self::Noop];

    /// Resolves a backend from its name.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::UnknownProvider`] for unrecognised names.
    pub fn from_name(name: &str) -> Result<Self, ProviderError> {
        match name {
            "scaleway" => Ok(Self::Scaleway),
            "noop" => Ok(Self::Noop),
            other => Err(ProviderError::UnknownProvider(other.to_owned())),
        }
    }

    /// Name of the backend.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Scaleway => "scaleway",
            Self::Noop => "noop",
        }
    }

    /// Builds the backend's credentials object from CLI flag values.
    #[must_use]
    pub fn credentials(self, args: &CredentialArgs) -> Box<dyn ProviderCredentials> {
        match self {
            Self::Scaleway => Box::new(ScalewayCredentials::from(args.scaleway.clone())),
            Self::Noop => Box::new(NoopCredentials::from(args.noop.clone())),
        }
    }

    /// Builds a machine manager bound to stored credentials and, for
    /// backends that need one, a region.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::CredentialsNotSet`] when no credentials
    /// were stored under the given name, or [`ProviderError`] variants
    /// from credential validation.
    pub fn machine_manager<B: SecretBackend>(
        self,
        store: &CredentialStore<B>,
        credentials_name: &str,
        region: &str,
    ) -> Result<Box<dyn MachineManager>, ProviderError> {
        let key = CredentialKey {
            name: credentials_name.to_owned(),
            provider: self.name().to_owned(),
        };
        match self {
            Self::Scaleway => {
                let credentials: ScalewayCredentials = stored_credentials(store, &key)?;
                Ok(Box::new(ScalewayMachineManager::new(credentials, region)?))
            }
            Self::Noop => {
                let credentials: NoopCredentials = stored_credentials(store, &key)?;
                credentials.validate()?;
                Ok(Box::new(NoopMachineManager::new()))
            }
        }
    }
}

fn stored_credentials<T, B>(
    store: &CredentialStore<B>,
    key: &CredentialKey,
) -> Result<T, ProviderError>
where
    T: DeserializeOwned,
    B: SecretBackend,
{
    store.get(key).map_err(|err| match err {
        CredentialStoreError::NotFound { .. } => ProviderError::CredentialsNotSet,
        other => ProviderError::InvalidCredentials(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn builder_trims_and_requires_name() {
        let request = CreateMachineRequest::builder()
            .name("  demo  ")
            .instance_type("DEV1-S")
            .zone(" fr-par-1 ")
            .build()
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(request.name, "demo");
        assert_eq!(request.zone, "fr-par-1");

        let missing = CreateMachineRequest::builder().name("   ").build();
        assert!(matches!(missing, Err(ProviderError::Validation(field)) if field == "name"));
    }

    #[test]
    fn from_name_rejects_unknown_providers() {
        let err = ProviderKind::from_name("digitalocean")
            .expect_err("unknown provider should be rejected");
        assert!(matches!(err, ProviderError::UnknownProvider(name) if name == "digitalocean"));
    }

    #[rstest]
    #[case(MachineState::Pending, "\"pending\"")]
    #[case(MachineState::Running, "\"running\"")]
    #[case(MachineState::Stopped, "\"stopped\"")]
    #[case(MachineState::Terminated, "\"terminated\"")]
    #[case(MachineState::Error, "\"error\"")]
    fn machine_state_serialises_lowercase(#[case] state: MachineState, #[case] expected: &str) {
        let encoded = serde_json::to_string(&state).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(encoded, expected);
        let decoded: MachineState =
            serde_json::from_str(expected).unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(decoded, state);
    }

    #[test]
    fn provider_names_round_trip() {
        for kind in ProviderKind::ALL {
            let resolved =
                ProviderKind::from_name(kind.name()).unwrap_or_else(|err| panic!("{err}"));
            assert_eq!(resolved, kind);
        }
    }
}
