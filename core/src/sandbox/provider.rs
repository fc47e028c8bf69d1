//! Client for the remote sandbox provider's REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::backend::CommandResult;
use crate::error::ProviderErr;
use crate::flags::SANDBOX_API_BASE;
use crate::flags::SANDBOX_API_KEY;
use crate::flags::SANDBOX_DOMAIN;

pub type ProviderResult<T> = std::result::Result<T, ProviderErr>;

/// Capability surface of the sandbox provider: lifecycle, command
/// execution, file transfer, and the public-host mapping for preview URLs.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Allocate a sandbox from a template; returns the provider sandbox id.
    async fn create(&self, template: &str, timeout: Duration) -> ProviderResult<String>;

    async fn kill(&self, sandbox_id: &str) -> ProviderResult<()>;

    /// Run a command to completion inside the sandbox.
    async fn run(
        &self,
        sandbox_id: &str,
        command: &str,
        cwd: Option<&str>,
        timeout: Duration,
    ) -> ProviderResult<CommandResult>;

    /// Launch a command inside the sandbox without waiting for it.
    async fn run_background(
        &self,
        sandbox_id: &str,
        command: &str,
        cwd: Option<&str>,
    ) -> ProviderResult<()>;

    async fn read_file(&self, sandbox_id: &str, path: &str) -> ProviderResult<String>;

    async fn read_file_bytes(&self, sandbox_id: &str, path: &str) -> ProviderResult<Vec<u8>>;

    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> ProviderResult<()>;

    /// Public host mapped to `port` inside the sandbox. Deterministic for a
    /// given sandbox id, so preview URLs are stable across the sandbox's
    /// lifetime.
    fn host(&self, sandbox_id: &str, port: u16) -> String;
}

/// Reqwest-backed implementation speaking the provider's HTTP API.
pub struct HttpSandboxProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    domain: String,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    template_id: &'a str,
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    sandbox_id: String,
}

#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
    timeout_secs: u64,
    background: bool,
}

#[derive(Debug, Serialize)]
struct WriteFileRequest<'a> {
    path: &'a str,
    content: &'a str,
}

impl HttpSandboxProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, domain: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            domain: domain.into(),
        }
    }

    pub fn from_flags() -> Self {
        Self::new(
            *SANDBOX_API_BASE,
            SANDBOX_API_KEY.map(str::to_string),
            *SANDBOX_DOMAIN,
        )
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        let mut builder = self.client.request(method, url);
        if let Some(key) = &self.api_key {
            builder = builder.header("X-API-Key", key);
        }
        builder
    }

    async fn check(resp: reqwest::Response) -> ProviderResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderErr::SandboxNotFound(body));
        }
        Err(ProviderErr::UnexpectedStatus(status, body))
    }
}

#[async_trait]
impl SandboxProvider for HttpSandboxProvider {
    async fn create(&self, template: &str, timeout: Duration) -> ProviderResult<String> {
        debug!(template, "creating sandbox");
        let resp = self
            .request(reqwest::Method::POST, "/sandboxes")
            .json(&CreateRequest {
                template_id: template,
                timeout_secs: timeout.as_secs(),
            })
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let created: CreateResponse = resp.json().await?;
        Ok(created.sandbox_id)
    }

    async fn kill(&self, sandbox_id: &str) -> ProviderResult<()> {
        let resp = self
            .request(reqwest::Method::DELETE, &format!("/sandboxes/{sandbox_id}"))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn run(
        &self,
        sandbox_id: &str,
        command: &str,
        cwd: Option<&str>,
        timeout: Duration,
    ) -> ProviderResult<CommandResult> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/sandboxes/{sandbox_id}/commands"),
            )
            .json(&CommandRequest {
                command,
                cwd,
                timeout_secs: timeout.as_secs(),
                background: false,
            })
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.json().await?)
    }

    async fn run_background(
        &self,
        sandbox_id: &str,
        command: &str,
        cwd: Option<&str>,
    ) -> ProviderResult<()> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/sandboxes/{sandbox_id}/commands"),
            )
            .json(&CommandRequest {
                command,
                cwd,
                timeout_secs: 0,
                background: true,
            })
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> ProviderResult<String> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/sandboxes/{sandbox_id}/files"))
            .query(&[("path", path)])
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.text().await?)
    }

    async fn read_file_bytes(&self, sandbox_id: &str, path: &str) -> ProviderResult<Vec<u8>> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/sandboxes/{sandbox_id}/files"))
            .query(&[("path", path)])
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> ProviderResult<()> {
        let resp = self
            .request(reqwest::Method::PUT, &format!("/sandboxes/{sandbox_id}/files"))
            .json(&WriteFileRequest { path, content })
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    fn host(&self, sandbox_id: &str, port: u16) -> String {
        format!("{port}-{sandbox_id}.{}", self.domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn host_derivation_is_deterministic() {
        let provider = HttpSandboxProvider::new("https://api.example", None, "sbx.example.dev");
        assert_eq!(provider.host("abc123", 5173), "5173-abc123.sbx.example.dev");
        assert_eq!(provider.host("abc123", 5173), provider.host("abc123", 5173));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let provider =
            HttpSandboxProvider::new("https://api.example/", None, "sbx.example.dev");
        assert_eq!(provider.base_url, "https://api.example");
    }
}
