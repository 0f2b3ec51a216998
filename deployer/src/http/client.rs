//! HTTP client implementation

use std::path::Path;
use std::time::Duration;

use reqwest::{header, Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::errors::DeployError;

const USER_AGENT: &str = concat!("deployer/", env!("CARGO_PKG_VERSION"));

/// JSON HTTP client bound to a base URL
pub struct HttpClient {
    client: Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(base_url: &str, token: Option<SecretString>) -> Result<Self, DeployError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header(
                header::AUTHORIZATION,
                format!("Bearer {}", token.expose_secret()),
            ),
            None => request,
        }
    }

    async fn check(method: &str, url: &str, response: Response) -> Result<Response, DeployError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!("HTTP {} {} failed: {} - {}", method, url, status, body);
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(DeployError::NotFound(format!("{url}: {body}")));
        }
        Err(DeployError::Internal(format!("{} {}: {} {}", method, url, status, body)))
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, DeployError> {
        let url = self.url(path);
        debug!("GET {}", url);

        let request = self
            .authorize(self.client.get(&url))
            .header(header::ACCEPT, "application/json");
        let response = Self::check("GET", &url, request.send().await?).await?;

        let body = response.json().await?;
        Ok(body)
    }

    /// Make a POST request, discarding any response body
    pub async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<(), DeployError> {
        let url = self.url(path);
        debug!("POST {}", url);

        let request = self.authorize(self.client.post(&url)).json(body);
        Self::check("POST", &url, request.send().await?).await?;
        Ok(())
    }

    /// Make a POST request without a body
    pub async fn post_empty(&self, path: &str) -> Result<(), DeployError> {
        let url = self.url(path);
        debug!("POST {}", url);

        let request = self.authorize(self.client.post(&url));
        Self::check("POST", &url, request.send().await?).await?;
        Ok(())
    }

    /// Stream a response body to `dest`, returning the byte count.
    ///
    /// Redirects are followed; the bearer token is only sent when
    /// `authorized` is set (signed URLs carry their own credentials).
    pub async fn download(
        &self,
        path: &str,
        dest: &Path,
        authorized: bool,
    ) -> Result<u64, DeployError> {
        let url = self.url(path);
        debug!("GET {} -> {}", url, dest.display());

        let mut request = self.client.get(&url).timeout(Duration::from_secs(600));
        if authorized {
            request = self.authorize(request);
        }
        let mut response = Self::check("GET", &url, request.send().await?).await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!("Downloaded {} bytes to {}", written, dest.display());
        Ok(written)
    }
}
