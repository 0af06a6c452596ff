use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::ResolvedConfig;
use crate::domain::{FileSource, RemoteFile};
use crate::error::UnlockError;
use crate::quota::Quota;

pub const LISTING_TIMEOUT: Duration = Duration::from_secs(30);
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const RATE_LIMIT_HEADER: &str = "x-ratelimit-remaining";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listing {
    Files(Vec<RemoteFile>),
    NotFound,
    RateLimited,
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    fn label(&self) -> &str;

    async fn list_files(&self, branch: &str) -> Result<Listing, UnlockError>;

    fn direct_file(&self, branch: &str, name: &str) -> Option<RemoteFile>;

    async fn fetch(&self, file: &RemoteFile) -> Result<Vec<u8>, UnlockError>;

    fn quota(&self) -> Option<u64> {
        None
    }

    fn begin_run(&self) {}
}

#[derive(Debug, Deserialize)]
struct ContentEntry {
    name: String,
    #[serde(rename = "type")]
    entry_type: String,
    #[serde(default)]
    download_url: Option<String>,
}

pub struct GithubSource {
    client: Client,
    slug: String,
    api_base: String,
    raw_base: String,
    token: Option<String>,
    api_gate: Semaphore,
    quota: Quota,
}

impl GithubSource {
    pub fn new(
        slug: &str,
        token: Option<String>,
        api_base: &str,
        raw_base: &str,
        api_concurrency: usize,
    ) -> Result<Self, UnlockError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("depot-unlock/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| UnlockError::GithubHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|err| UnlockError::GithubHttp(err.to_string()))?;

        Ok(Self {
            client,
            slug: slug.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            raw_base: raw_base.trim_end_matches('/').to_string(),
            token: token.filter(|token| !token.is_empty()),
            api_gate: Semaphore::new(api_concurrency.max(1)),
            quota: Quota::new(),
        })
    }

    pub fn from_config(config: &ResolvedConfig) -> Result<Self, UnlockError> {
        let slug = config.repo.slug().ok_or_else(|| UnlockError::InvalidSetting {
            name: "repo".to_string(),
            message: "GitHub source needs an owner/repo remote".to_string(),
        })?;
        Self::new(
            &slug,
            config.auth_token.clone(),
            &config.api_base,
            &config.raw_base,
            config.api_concurrency,
        )
    }

    pub fn contents_url(&self) -> String {
        format!("{}/repos/{}/contents", self.api_base, self.slug)
    }

    pub fn raw_url(&self, branch: &str, name: &str) -> String {
        format!("{}/{}/{branch}/{name}", self.raw_base, self.slug)
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn record_quota(&self, headers: &HeaderMap) {
        if let Some(value) = remaining_header(headers) {
            self.quota.observe_header(value);
        }
    }

    fn to_remote_files(&self, branch: &str, entries: Vec<ContentEntry>) -> Vec<RemoteFile> {
        entries
            .into_iter()
            .filter(|entry| entry.entry_type == "file")
            .filter_map(|entry| {
                let url = entry
                    .download_url
                    .unwrap_or_else(|| self.raw_url(branch, &entry.name));
                RemoteFile::new(entry.name, FileSource::Url(url))
            })
            .collect()
    }
}

#[async_trait]
impl ContentSource for GithubSource {
    fn label(&self) -> &str {
        "github"
    }

    async fn list_files(&self, branch: &str) -> Result<Listing, UnlockError> {
        let _permit = self
            .api_gate
            .acquire()
            .await
            .map_err(|err| UnlockError::GithubHttp(err.to_string()))?;

        let mut request = self
            .client
            .get(self.contents_url())
            .query(&[("ref", branch)])
            .header(ACCEPT, "application/vnd.github+json")
            .timeout(LISTING_TIMEOUT);
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|err| UnlockError::GithubHttp(err.to_string()))?;
        self.record_quota(response.headers());

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(branch, "branch absent from contents API");
                Ok(Listing::NotFound)
            }
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
                warn!(branch, remaining = ?self.quota.remaining(), "contents API rate limited");
                Ok(Listing::RateLimited)
            }
            status if status.is_success() => {
                let entries: Vec<ContentEntry> = response
                    .json()
                    .await
                    .map_err(|err| UnlockError::GithubHttp(err.to_string()))?;
                Ok(Listing::Files(self.to_remote_files(branch, entries)))
            }
            status => {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "GitHub request failed".to_string());
                Err(UnlockError::GithubStatus {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }

    fn direct_file(&self, branch: &str, name: &str) -> Option<RemoteFile> {
        RemoteFile::new(name, FileSource::Url(self.raw_url(branch, name)))
    }

    async fn fetch(&self, file: &RemoteFile) -> Result<Vec<u8>, UnlockError> {
        let FileSource::Url(url) = &file.source else {
            return Err(UnlockError::GithubHttp(format!(
                "{} has no download URL",
                file.name
            )));
        };
        let response = self
            .client
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|err| UnlockError::GithubHttp(err.to_string()))?;
        if !response.status().is_success() {
            return Err(UnlockError::GithubStatus {
                status: response.status().as_u16(),
                message: format!("download {} failed", file.name),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| UnlockError::GithubHttp(err.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn quota(&self) -> Option<u64> {
        self.quota.remaining()
    }

    fn begin_run(&self) {
        self.quota.begin_run();
    }
}

fn remaining_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(RATE_LIMIT_HEADER)
        .and_then(|value| value.to_str().ok())
}
