//! No-op backend used for tests and dry runs.
//!
//! Instances are imaginary: creation always succeeds, and `get` walks a
//! fixed ramp of three `pending` reports before settling on `running`
//! forever. Lifecycle operations never fail, which also makes the
//! backend a convenient target for exercising the orchestrator.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use super::{
    CreateMachineRequest, MachineKind, MachineManager, MachineState, ManagerFuture,
    ProviderCredentials, ProviderError, ProviderMachine,
};

/// Fixed identifier reported for the imaginary instance.
pub const NOOP_MACHINE_ID: &str = "4b00c526-5d3f-4648-b69b-272ab71c6e18";

const FIXED_IP: &str = "1.2.3.4";
const PENDING_POLLS: u32 = 3;

/// Credentials for the no-op backend: one required fake secret, so the
/// whole credential flow can be exercised without a cloud account.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct NoopCredentials {
    /// Fake secret; required but never sent anywhere.
    #[serde(default)]
    pub secret: String,
}

impl ProviderCredentials for NoopCredentials {
    fn validate(&self) -> Result<(), ProviderError> {
        if self.secret.trim().is_empty() {
            return Err(ProviderError::InvalidCredentials(String::from(
                "secret is required",
            )));
        }
        Ok(())
    }

    fn complete(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn to_json(&self) -> Result<serde_json::Value, ProviderError> {
        serde_json::to_value(self)
            .map_err(|err| ProviderError::InvalidCredentials(err.to_string()))
    }
}

/// CLI flags for no-op credentials.
#[derive(Clone, Debug, Default, clap::Args)]
pub struct NoopCredentialArgs {
    /// Fake secret for the no-op backend.
    #[arg(long = "noop-secret")]
    pub secret: Option<String>,
}

impl From<NoopCredentialArgs> for NoopCredentials {
    fn from(args: NoopCredentialArgs) -> Self {
        Self {
            secret: args.secret.unwrap_or_default(),
        }
    }
}

/// Machine manager that fabricates a single imaginary instance.
#[derive(Debug, Default)]
pub struct NoopMachineManager {
    get_count: AtomicU32,
}

impl NoopMachineManager {
    /// Creates a manager with a fresh ramp counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn machine(name: &str, state: MachineState) -> ProviderMachine {
        ProviderMachine {
            id: NOOP_MACHINE_ID.to_owned(),
            name: name.to_owned(),
            ip: Some(FIXED_IP.to_owned()),
            region: String::new(),
            state,
        }
    }
}

impl MachineManager for NoopMachineManager {
    fn create<'a>(
        &'a self,
        request: &'a CreateMachineRequest,
    ) -> ManagerFuture<'a, ProviderMachine> {
        Box::pin(async move { Ok(Self::machine(&request.name, MachineState::Pending)) })
    }

    fn delete<'a>(&'a self, _id: &'a str) -> ManagerFuture<'a, ()> {
        Box::pin(async move { Ok(()) })
    }

    fn start<'a>(&'a self, _id: &'a str) -> ManagerFuture<'a, ()> {
        Box::pin(async move { Ok(()) })
    }

    fn stop<'a>(&'a self, _id: &'a str) -> ManagerFuture<'a, ()> {
        Box::pin(async move { Ok(()) })
    }

    fn get<'a>(&'a self, id: &'a str) -> ManagerFuture<'a, ProviderMachine> {
        Box::pin(async move {
            let polled = self.get_count.fetch_add(1, Ordering::SeqCst);
            let state = if polled < PENDING_POLLS {
                MachineState::Pending
            } else {
                MachineState::Running
            };
            Ok(Self::machine(id, state))
        })
    }

    fn machine_kind(&self) -> MachineKind {
        MachineKind::Vm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_ramps_from_pending_to_running() {
        let manager = NoopMachineManager::new();
        for _ in 0..PENDING_POLLS {
            let machine = manager
                .get(NOOP_MACHINE_ID)
                .await
                .unwrap_or_else(|err| panic!("{err}"));
            assert_eq!(machine.state, MachineState::Pending);
        }

        let fourth = manager
            .get(NOOP_MACHINE_ID)
            .await
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(fourth.state, MachineState::Running);

        // The ramp never goes back.
        let fifth = manager
            .get(NOOP_MACHINE_ID)
            .await
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(fifth.state, MachineState::Running);
    }

    #[tokio::test]
    async fn create_echoes_the_requested_name() {
        let manager = NoopMachineManager::new();
        let request = CreateMachineRequest::builder()
            .name("demo")
            .build()
            .unwrap_or_else(|err| panic!("{err}"));
        let machine = manager
            .create(&request)
            .await
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(machine.name, "demo");
        assert_eq!(machine.state, MachineState::Pending);
        assert_eq!(machine.id, NOOP_MACHINE_ID);
    }

    #[tokio::test]
    async fn delete_succeeds_for_any_id() {
        let manager = NoopMachineManager::new();
        manager
            .delete("never-created")
            .await
            .unwrap_or_else(|err| panic!("{err}"));
    }

    #[test]
    fn credentials_require_the_fake_secret() {
        let empty = NoopCredentials::default();
        assert!(empty.validate().is_err());

        let filled = NoopCredentials {
            secret: String::from("anything"),
        };
        assert!(filled.validate().is_ok());
    }
}
