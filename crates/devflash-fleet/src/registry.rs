//! Device-registry client
//!
//! The registry is the cloud API that knows device names, platforms, and
//! product membership. The coordinator uses it to resolve names to ids, to
//! fill in platforms USB interrogation could not supply, and to mark product
//! devices as development devices so the cloud does not immediately revert
//! what we flash.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::error::FleetError;

/// A device as the registry sees it.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryDevice {
    /// 24-hex device id
    pub id: String,
    /// User-assigned name
    #[serde(default)]
    pub name: Option<String>,
    /// Platform id
    pub platform_id: u16,
    /// Product the device belongs to, if any
    #[serde(default)]
    pub product_id: Option<u32>,
}

/// Account info returned by the registry.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    /// Account username
    pub username: String,
}

/// Interface to the device registry.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Validate the token and fetch account info.
    async fn get_user_info(&self) -> Result<UserInfo, FleetError>;

    /// List all devices of the account.
    async fn list_devices(&self) -> Result<Vec<RegistryDevice>, FleetError>;

    /// Fetch one device by id or name.
    async fn get_device(&self, id_or_name: &str) -> Result<RegistryDevice, FleetError>;

    /// Flag a device as a development device within its product.
    async fn update_device(
        &self,
        id: &str,
        development: bool,
        product_id: Option<u32>,
    ) -> Result<(), FleetError>;
}

/// Credentials loaded from the CLI profile files.
#[derive(Debug, Clone)]
pub struct ProfileCredentials {
    /// Access token
    pub access_token: String,
    /// API base URL override, if the profile has one
    pub api_url: Option<String>,
}

#[derive(Deserialize)]
struct ProfileFile {
    name: String,
}

#[derive(Deserialize)]
struct ProfileConfigFile {
    access_token: Option<String>,
    #[serde(rename = "apiUrl")]
    api_url: Option<String>,
}

/// Read the saved credentials from `<home>/.particle/profile.json` and the
/// profile's config file. Returns `None` when any piece is missing.
pub fn load_profile_credentials(home: &Path) -> Option<ProfileCredentials> {
    let particle_dir = home.join(".particle");
    let profile: ProfileFile =
        serde_json::from_str(&std::fs::read_to_string(particle_dir.join("profile.json")).ok()?)
            .ok()?;
    let config: ProfileConfigFile = serde_json::from_str(
        &std::fs::read_to_string(particle_dir.join(format!("{}.config.json", profile.name)))
            .ok()?,
    )
    .ok()?;
    Some(ProfileCredentials {
        access_token: config.access_token?,
        api_url: config.api_url,
    })
}

/// REST client for the device registry.
pub struct CloudRegistryClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl CloudRegistryClient {
    /// Create a client against the production API.
    pub fn new(token: impl Into<String>) -> Result<Self, FleetError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("devflash/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: "https://api.particle.io".to_string(),
            token: token.into(),
        })
    }

    /// Point the client at a different API root (profile override, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, FleetError> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FleetError::AuthenticationRequired(
                "the registry rejected the access token".to_string(),
            ));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(FleetError::Registry {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl DeviceRegistry for CloudRegistryClient {
    async fn get_user_info(&self) -> Result<UserInfo, FleetError> {
        let url = format!("{}/v1/user", self.base_url);
        debug!(%url, "Fetching user info");
        let response = self.client.get(&url).bearer_auth(&self.token).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn list_devices(&self) -> Result<Vec<RegistryDevice>, FleetError> {
        let url = format!("{}/v1/devices", self.base_url);
        debug!(%url, "Listing registry devices");
        let response = self.client.get(&url).bearer_auth(&self.token).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn get_device(&self, id_or_name: &str) -> Result<RegistryDevice, FleetError> {
        let url = format!("{}/v1/devices/{id_or_name}", self.base_url);
        debug!(%url, "Fetching registry device");
        let response = self.client.get(&url).bearer_auth(&self.token).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(FleetError::DeviceNotFound(id_or_name.to_string()));
        }
        Ok(Self::check(response).await?.json().await?)
    }

    async fn update_device(
        &self,
        id: &str,
        development: bool,
        product_id: Option<u32>,
    ) -> Result<(), FleetError> {
        let url = match product_id {
            Some(product) => format!("{}/v1/products/{product}/devices/{id}", self.base_url),
            None => format!("{}/v1/devices/{id}", self.base_url),
        };
        debug!(%url, development, "Updating registry device");
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "development": development }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
