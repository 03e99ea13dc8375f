//! Release-host client
//!
//! The release host is a GitHub-style releases API: tagged releases with
//! downloadable assets, 100-per-page listing, and token-authenticated access
//! for drafts. [`ReleaseHost`] is the seam the resolver depends on; the tests
//! substitute a wiremock-backed server through the same trait.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::ReleaseError;

/// Releases per page when listing; the host caps pages at 100 entries.
pub const RELEASES_PER_PAGE: u32 = 100;

/// A downloadable asset attached to a release.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    /// Asset file name
    pub name: String,
    /// API download URL
    pub url: String,
    /// Size in bytes as reported by the host
    pub size: u64,
}

/// A published (or draft) release.
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    /// Release tag, `v<semver>` or `<semver>`
    pub tag_name: String,
    /// Whether the release is an unpublished draft
    #[serde(default)]
    pub draft: bool,
    /// Downloadable assets
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
    /// Publication timestamp, absent on drafts
    #[serde(default)]
    pub published_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Release {
    /// Tag with any leading `v` stripped.
    pub fn version_str(&self) -> &str {
        self.tag_name.strip_prefix('v').unwrap_or(&self.tag_name)
    }
}

/// Interface to the release hosting service.
#[async_trait]
pub trait ReleaseHost: Send + Sync {
    /// Fetch a release by exact tag; `None` when the host reports 404.
    async fn release_by_tag(&self, tag: &str) -> Result<Option<Release>, ReleaseError>;

    /// Fetch one page of the release listing (1-based page numbers).
    async fn list_releases(&self, page: u32) -> Result<Vec<Release>, ReleaseError>;

    /// Download an asset to `dest`.
    async fn download_asset(&self, asset: &ReleaseAsset, dest: &Path) -> Result<(), ReleaseError>;

    /// Whether the client holds an auth token.
    fn is_authenticated(&self) -> bool;

    /// Page through the entire release listing.
    async fn list_all_releases(&self) -> Result<Vec<Release>, ReleaseError> {
        let mut releases = Vec::new();
        let mut page = 1;
        loop {
            let batch = self.list_releases(page).await?;
            let last_page = (batch.len() as u32) < RELEASES_PER_PAGE;
            releases.extend(batch);
            if last_page {
                break;
            }
            page += 1;
        }
        Ok(releases)
    }
}

/// GitHub releases API client.
pub struct GithubReleaseClient {
    client: reqwest::Client,
    base_url: String,
    repo: String,
    token: Option<String>,
}

impl GithubReleaseClient {
    /// Create a client for `owner/repo` against the public API.
    pub fn new(repo: impl Into<String>) -> Result<Self, ReleaseError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("devflash/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: "https://api.github.com".to_string(),
            repo: repo.into(),
            token: None,
        })
    }

    /// Point the client at a different API root (used by tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Attach a bearer token for draft access and rate limits.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn releases_url(&self) -> String {
        format!("{}/repos/{}/releases", self.base_url, self.repo)
    }
}

#[async_trait]
impl ReleaseHost for GithubReleaseClient {
    async fn release_by_tag(&self, tag: &str) -> Result<Option<Release>, ReleaseError> {
        let url = format!("{}/tags/{}", self.releases_url(), tag);
        debug!(%url, "Fetching release by tag");
        let response = self.authorize(self.client.get(&url)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(ReleaseError::HttpStatus {
                status: status.as_u16(),
                url,
            }),
        }
    }

    async fn list_releases(&self, page: u32) -> Result<Vec<Release>, ReleaseError> {
        let url = format!(
            "{}?per_page={}&page={}",
            self.releases_url(),
            RELEASES_PER_PAGE,
            page
        );
        debug!(%url, "Listing releases");
        let response = self.authorize(self.client.get(&url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReleaseError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        Ok(response.json().await?)
    }

    async fn download_asset(&self, asset: &ReleaseAsset, dest: &Path) -> Result<(), ReleaseError> {
        let fail = |reason: String| ReleaseError::DownloadFailed {
            asset: asset.name.clone(),
            reason,
        };

        debug!(asset = %asset.name, url = %asset.url, dest = %dest.display(), "Downloading asset");
        let response = self
            .authorize(self.client.get(&asset.url))
            .header(header::ACCEPT, "application/octet-stream")
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fail(format!("server returned {}", status)));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| fail(e.to_string()))?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> GithubReleaseClient {
        GithubReleaseClient::new("particle-iot/device-os")
            .expect("client")
            .with_base_url(server.uri())
    }

    #[tokio::test]
    async fn release_by_tag_returns_none_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/particle-iot/device-os/releases/tags/v9.9.9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let release = client.release_by_tag("v9.9.9").await.expect("request ok");
        assert!(release.is_none());
    }

    #[tokio::test]
    async fn release_by_tag_parses_assets() {
        let server = MockServer::start().await;
        let body = serde_json::json!({
            "tag_name": "v2.1.0",
            "draft": false,
            "assets": [
                {"name": "boron-system-part1@2.1.0.bin", "url": format!("{}/a/1", server.uri()), "size": 1024},
            ],
        });
        Mock::given(method("GET"))
            .and(path("/repos/particle-iot/device-os/releases/tags/v2.1.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&body))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let release = client
            .release_by_tag("v2.1.0")
            .await
            .expect("request ok")
            .expect("release exists");
        assert_eq!(release.version_str(), "2.1.0");
        assert_eq!(release.assets.len(), 1);
        assert_eq!(release.assets[0].size, 1024);
    }

    #[tokio::test]
    async fn list_all_releases_pages_until_short_page() {
        let server = MockServer::start().await;
        let full_page: Vec<_> = (0..RELEASES_PER_PAGE)
            .map(|i| serde_json::json!({"tag_name": format!("v1.0.{}", i), "draft": false, "assets": []}))
            .collect();
        let short_page = vec![serde_json::json!({"tag_name": "v0.9.0", "draft": false, "assets": []})];

        Mock::given(method("GET"))
            .and(path("/repos/particle-iot/device-os/releases"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&full_page))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/particle-iot/device-os/releases"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&short_page))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let releases = client.list_all_releases().await.expect("listing ok");
        assert_eq!(releases.len(), RELEASES_PER_PAGE as usize + 1);
    }

    #[tokio::test]
    async fn download_sends_octet_stream_accept_and_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/assets/42"))
            .and(header("accept", "application/octet-stream"))
            .and(header("authorization", "Bearer sekrit"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"firmware".to_vec()))
            .mount(&server)
            .await;

        let client = client_for(&server).with_token(Some("sekrit".to_string()));
        assert!(client.is_authenticated());

        let asset = ReleaseAsset {
            name: "fw.bin".to_string(),
            url: format!("{}/assets/42", server.uri()),
            size: 8,
        };
        let dir = TempDir::new().expect("temp dir");
        let dest = dir.path().join("fw.bin");
        client.download_asset(&asset, &dest).await.expect("download");
        assert_eq!(std::fs::read(&dest).expect("read"), b"firmware");
    }

    #[tokio::test]
    async fn download_failure_names_the_asset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/assets/7"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let asset = ReleaseAsset {
            name: "boron-softdevice.bin".to_string(),
            url: format!("{}/assets/7", server.uri()),
            size: 4,
        };
        let dir = TempDir::new().expect("temp dir");
        let err = client
            .download_asset(&asset, &dir.path().join("x.bin"))
            .await
            .expect_err("download fails");
        let msg = err.to_string();
        assert!(msg.contains("boron-softdevice.bin"), "got: {msg}");
    }
}
