use std::time::Duration;

use url::Url;

pub const DEFAULT_API_BASE: &str = "http://localhost:8000/api";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base: String,
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let api_base = std::env::var("MGDI_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.into());
        let connect_timeout = std::env::var("MGDI_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
        Self { api_base, connect_timeout: Duration::from_secs(connect_timeout) }
    }

    pub fn with_api_base(mut self, api_base: Option<String>) -> Self {
        if let Some(base) = api_base {
            self.api_base = base;
        }
        self
    }

    /// Chat API base without a trailing slash.
    pub fn chat_base(&self) -> anyhow::Result<String> {
        let url = Url::parse(&self.api_base)?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("unsupported scheme '{}' in api base", url.scheme());
        }
        Ok(url.as_str().trim_end_matches('/').to_string())
    }

    /// The health endpoint lives beside the API, so a trailing `/api`
    /// segment is dropped.
    pub fn health_base(&self) -> anyhow::Result<String> {
        let mut url = Url::parse(&self.chat_base()?)?;
        let path = url.path().trim_end_matches('/').to_string();
        if let Some(stripped) = path.strip_suffix("/api") {
            url.set_path(stripped);
        }
        Ok(url.as_str().trim_end_matches('/').to_string())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { api_base: DEFAULT_API_BASE.into(), connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS) }
    }
}
