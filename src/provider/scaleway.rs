//! Scaleway backend built on the Instances API.
//!
//! Instances are created in a stopped state so the cloud-init payload is
//! present before first boot, then powered on with a server action.
//! `stop` maps to `poweroff`, which releases the hypervisor and keeps
//! only volume billing, and `delete` maps to `terminate` followed by a
//! bounded sweep until the API stops listing the server.

use std::sync::LazyLock;
use std::time::Duration;

use scaleway_rs::{ScalewayApi, ScalewayError, ScalewayListInstanceImagesBuilder};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use super::{
    CreateMachineRequest, MachineKind, MachineManager, MachineState, ManagerFuture,
    ProviderCredentials, ProviderError, ProviderMachine,
};

const SCALEWAY_INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";
const DEFAULT_ZONE: &str = "fr-par-1";
const DEFAULT_INSTANCE_TYPE: &str = "DEV1-S";
const DEFAULT_ARCHITECTURE: &str = "x86_64";
const CREATED_BY_TAG: &str = "corral";
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const DELETE_TIMEOUT: Duration = Duration::from_secs(300);

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(reqwest::Client::new);

/// Credentials for the Scaleway backend.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalewayCredentials {
    /// API access key; captured for audit purposes, not used for calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    /// API secret key used for authentication.
    #[serde(default)]
    pub secret_key: String,
    /// Project identifier used for billing and resource scoping.
    #[serde(default)]
    pub project_id: String,
    /// Organisation identifier used by some endpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
}

impl ProviderCredentials for ScalewayCredentials {
    fn validate(&self) -> Result<(), ProviderError> {
        if self.secret_key.trim().is_empty() {
            return Err(ProviderError::InvalidCredentials(String::from(
                "secret key is required",
            )));
        }
        if self.project_id.trim().is_empty() {
            return Err(ProviderError::InvalidCredentials(String::from(
                "project ID is required",
            )));
        }
        Ok(())
    }

    fn complete(&mut self) -> Result<(), ProviderError> {
        let prompt_error =
            |err: dialoguer::Error| ProviderError::InvalidCredentials(err.to_string());

        if self.secret_key.trim().is_empty() {
            self.secret_key = dialoguer::Password::new()
                .with_prompt("Scaleway secret key")
                .interact()
                .map_err(prompt_error)?;
        }
        if self.project_id.trim().is_empty() {
            self.project_id = dialoguer::Input::<String>::new()
                .with_prompt("Scaleway project ID")
                .interact_text()
                .map_err(prompt_error)?;
        }
        Ok(())
    }

    fn to_json(&self) -> Result<serde_json::Value, ProviderError> {
        serde_json::to_value(self)
            .map_err(|err| ProviderError::InvalidCredentials(err.to_string()))
    }
}

/// CLI flags for Scaleway credentials.
#[derive(Clone, Debug, Default, clap::Args)]
pub struct ScalewayCredentialArgs {
    /// Scaleway API access key.
    #[arg(long = "scaleway-access-key")]
    pub access_key: Option<String>,
    /// Scaleway API secret key.
    #[arg(long = "scaleway-secret-key", env = "SCW_SECRET_KEY")]
    pub secret_key: Option<String>,
    /// Scaleway project identifier.
    #[arg(long = "scaleway-project-id")]
    pub project_id: Option<String>,
    /// Scaleway organisation identifier.
    #[arg(long = "scaleway-organization-id")]
    pub organization_id: Option<String>,
}

impl From<ScalewayCredentialArgs> for ScalewayCredentials {
    fn from(args: ScalewayCredentialArgs) -> Self {
        Self {
            access_key: args.access_key,
            secret_key: args.secret_key.unwrap_or_default(),
            project_id: args.project_id.unwrap_or_default(),
            organization_id: args.organization_id,
        }
    }
}

#[derive(Serialize)]
struct CreateServerRequest {
    name: String,
    commercial_type: String,
    image: String,
    project: String,
    routed_ip_enabled: bool,
    dynamic_ip_required: bool,
    tags: Vec<String>,
    stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    cloud_init: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<String>,
}

#[derive(Deserialize)]
struct CreateServerResponse {
    server: scaleway_rs::ScalewayInstance,
}

/// Machine manager bound to one Scaleway account and zone.
pub struct ScalewayMachineManager {
    api: ScalewayApi,
    secret_key: String,
    project_id: String,
    organization_id: Option<String>,
    zone: String,
    poll_interval: Duration,
    delete_timeout: Duration,
}

impl ScalewayMachineManager {
    /// Builds a manager from validated credentials and a zone. An empty
    /// region falls back to the default zone.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::InvalidCredentials`] when the
    /// credentials fail validation.
    pub fn new(credentials: ScalewayCredentials, region: &str) -> Result<Self, ProviderError> {
        credentials.validate()?;
        let zone = if region.trim().is_empty() {
            DEFAULT_ZONE.to_owned()
        } else {
            region.trim().to_owned()
        };
        Ok(Self {
            api: ScalewayApi::new(&credentials.secret_key),
            secret_key: credentials.secret_key,
            project_id: credentials.project_id,
            organization_id: credentials.organization_id,
            zone,
            poll_interval: POLL_INTERVAL,
            delete_timeout: DELETE_TIMEOUT,
        })
    }

    fn request_zone<'a>(&'a self, request: &'a CreateMachineRequest) -> &'a str {
        if request.zone.trim().is_empty() {
            &self.zone
        } else {
            request.zone.trim()
        }
    }

    async fn resolve_image_id(
        &self,
        zone: &str,
        label: &str,
    ) -> Result<String, ProviderError> {
        let images = ScalewayListInstanceImagesBuilder::new(self.api.clone(), zone)
            .public(true)
            .name(label)
            .arch(DEFAULT_ARCHITECTURE)
            .run_async()
            .await
            .map_err(api_error)?;

        let mut candidates: Vec<_> = images
            .into_iter()
            .filter(|image| image.state == "available")
            .collect();
        if candidates.is_empty() {
            return Err(ProviderError::ImageNotFound {
                label: label.to_owned(),
                zone: zone.to_owned(),
            });
        }

        candidates.sort_by(|lhs, rhs| rhs.creation_date.cmp(&lhs.creation_date));
        let newest = candidates.remove(0);
        Ok(newest.id)
    }

    async fn create_instance_stopped(
        &self,
        request: &CreateMachineRequest,
        zone: &str,
        image_id: &str,
    ) -> Result<scaleway_rs::ScalewayInstance, ProviderError> {
        let url = format!("{SCALEWAY_INSTANCE_API_BASE}/zones/{zone}/servers");
        let mut tags = vec![CREATED_BY_TAG.to_owned()];
        tags.extend(
            request
                .tags
                .iter()
                .map(|(key, value)| format!("{key}={value}")),
        );

        let commercial_type = if request.instance_type.is_empty() {
            DEFAULT_INSTANCE_TYPE.to_owned()
        } else {
            request.instance_type.clone()
        };
        let cloud_init = if request.user_data.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&request.user_data).into_owned())
        };

        let payload = CreateServerRequest {
            name: request.name.clone(),
            commercial_type,
            image: image_id.to_owned(),
            project: self.project_id.clone(),
            routed_ip_enabled: true,
            dynamic_ip_required: true,
            tags,
            stopped: true,
            cloud_init,
            organization: self.organization_id.clone(),
        };

        let response = HTTP_CLIENT
            .post(&url)
            .header("X-Auth-Token", &self.secret_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| ProviderError::Api {
                message: err.to_string(),
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|err| ProviderError::Api {
            message: err.to_string(),
        })?;

        if status.is_success() {
            let parsed: CreateServerResponse =
                serde_json::from_slice(&body).map_err(|err| ProviderError::Api {
                    message: err.to_string(),
                })?;
            return Ok(parsed.server);
        }

        Err(ProviderError::Api {
            message: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    async fn power_on(
        &self,
        zone: &str,
        server: &scaleway_rs::ScalewayInstance,
    ) -> Result<(), ProviderError> {
        if server.state == "running" {
            return Ok(());
        }

        if server.allowed_actions.iter().any(|action| action == "poweron") {
            self.api
                .perform_instance_action_async(zone, &server.id, "poweron")
                .await
                .map_err(api_error)?;
            return Ok(());
        }

        Err(ProviderError::UnexpectedState {
            id: server.id.clone(),
            state: server.state.clone(),
        })
    }

    async fn fetch_instance(
        &self,
        id: &str,
    ) -> Result<Option<scaleway_rs::ScalewayInstance>, ProviderError> {
        let mut servers = self
            .api
            .list_instances(&self.zone)
            .servers(id)
            .per_page(1)
            .run_async()
            .await
            .map_err(api_error)?;
        Ok(servers.pop())
    }

    async fn wait_until_gone(&self, id: &str) -> Result<(), ProviderError> {
        let deadline = std::time::Instant::now() + self.delete_timeout;
        while std::time::Instant::now() <= deadline {
            if self.fetch_instance(id).await?.is_none() {
                return Ok(());
            }
            sleep(self.poll_interval).await;
        }
        Err(ProviderError::ResidualResource {
            instance_id: id.to_owned(),
        })
    }

    fn machine_from_instance(&self, server: &scaleway_rs::ScalewayInstance) -> ProviderMachine {
        ProviderMachine {
            id: server.id.clone(),
            name: server.name.clone(),
            ip: server.public_ip.as_ref().map(|ip| ip.address.clone()),
            region: self.zone.clone(),
            state: map_state(&server.state),
        }
    }
}

impl MachineManager for ScalewayMachineManager {
    fn create<'a>(
        &'a self,
        request: &'a CreateMachineRequest,
    ) -> ManagerFuture<'a, ProviderMachine> {
        Box::pin(async move {
            if request.image.is_empty() {
                return Err(ProviderError::Validation(String::from("image")));
            }
            let zone = self.request_zone(request).to_owned();
            let image_id = self.resolve_image_id(&zone, &request.image).await?;
            let server = self
                .create_instance_stopped(request, &zone, &image_id)
                .await?;
            self.power_on(&zone, &server).await?;

            // The power-on has not settled yet; readiness polling owns
            // the transition to running.
            Ok(ProviderMachine {
                id: server.id.clone(),
                name: request.name.clone(),
                ip: server.public_ip.as_ref().map(|ip| ip.address.clone()),
                region: zone,
                state: MachineState::Pending,
            })
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> ManagerFuture<'a, ()> {
        Box::pin(async move {
            match self
                .api
                .perform_instance_action_async(&self.zone, id, "terminate")
                .await
            {
                Ok(_) => {}
                Err(ScalewayError::Api(api_err)) if is_not_found(&api_err) => return Ok(()),
                Err(other) => return Err(api_error(other)),
            }
            self.wait_until_gone(id).await
        })
    }

    fn start<'a>(&'a self, id: &'a str) -> ManagerFuture<'a, ()> {
        Box::pin(async move {
            self.api
                .perform_instance_action_async(&self.zone, id, "poweron")
                .await
                .map_err(api_error)?;
            Ok(())
        })
    }

    fn stop<'a>(&'a self, id: &'a str) -> ManagerFuture<'a, ()> {
        Box::pin(async move {
            self.api
                .perform_instance_action_async(&self.zone, id, "poweroff")
                .await
                .map_err(api_error)?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> ManagerFuture<'a, ProviderMachine> {
        Box::pin(async move {
            let server = self
                .fetch_instance(id)
                .await?
                .ok_or_else(|| ProviderError::NotFound { id: id.to_owned() })?;
            Ok(self.machine_from_instance(&server))
        })
    }

    fn machine_kind(&self) -> MachineKind {
        MachineKind::Vm
    }
}

fn api_error(err: ScalewayError) -> ProviderError {
    ProviderError::Api {
        message: err.to_string(),
    }
}

fn is_not_found(api_err: &scaleway_rs::ScalewayApiError) -> bool {
    api_err.etype == "unknown_resource" || api_err.etype == "not_found"
}

/// Maps Scaleway server states onto the canonical enum. Unknown states
/// read as pending, never as running.
fn map_state(state: &str) -> MachineState {
    match state {
        "running" => MachineState::Running,
        "stopped" | "stopped in place" => MachineState::Stopped,
        "locked" => MachineState::Error,
        _ => MachineState::Pending,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("running", MachineState::Running)]
    #[case("stopped", MachineState::Stopped)]
    #[case("stopped in place", MachineState::Stopped)]
    #[case("locked", MachineState::Error)]
    #[case("starting", MachineState::Pending)]
    #[case("stopping", MachineState::Pending)]
    #[case("some-future-state", MachineState::Pending)]
    fn native_states_map_onto_the_canonical_enum(
        #[case] native: &str,
        #[case] expected: MachineState,
    ) {
        assert_eq!(map_state(native), expected);
    }

    #[test]
    fn credentials_require_secret_key_and_project() {
        let empty = ScalewayCredentials::default();
        assert!(empty.validate().is_err());

        let missing_project = ScalewayCredentials {
            secret_key: String::from("scw-secret"),
            ..ScalewayCredentials::default()
        };
        assert!(missing_project.validate().is_err());

        let complete = ScalewayCredentials {
            secret_key: String::from("scw-secret"),
            project_id: String::from("proj"),
            ..ScalewayCredentials::default()
        };
        assert!(complete.validate().is_ok());
    }

    #[test]
    fn manager_defaults_the_zone() {
        let credentials = ScalewayCredentials {
            secret_key: String::from("scw-secret"),
            project_id: String::from("proj"),
            ..ScalewayCredentials::default()
        };
        let manager = ScalewayMachineManager::new(credentials, "  ")
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(manager.zone, DEFAULT_ZONE);
    }

    #[test]
    fn manager_rejects_empty_credentials() {
        let result = ScalewayMachineManager::new(ScalewayCredentials::default(), "fr-par-1");
        assert!(matches!(
            result,
            Err(ProviderError::InvalidCredentials(_))
        ));
    }
}
