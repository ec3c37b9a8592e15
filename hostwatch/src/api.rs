//! HTTP client for the per-module monitoring endpoints.

use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::error::{MonitorError, TransportError};
use crate::protocol::ApiResponse;
use crate::types::{
    CpuInfo, DiskInfo, MemoryInfo, Module, ModulePayload, NetworkInfo, ProcessInfo, SystemInfo,
};

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    health_url: String,
    request_timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
}

impl ApiClient {
    pub fn new(cfg: &MonitorConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(TransportError::Client)?;
        Ok(Self {
            http,
            base_url: cfg.api_base_url.trim_end_matches('/').to_string(),
            health_url: cfg.health_url(),
            request_timeout: cfg.request_timeout(),
            max_retries: cfg.max_retries,
            retry_backoff: cfg.retry_backoff(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET `{base}{endpoint}` and unwrap the `{success, data}` envelope.
    ///
    /// A failed attempt is retried up to `max_retries` times; retry `n` waits
    /// `n * retry_backoff`. Only the last error is returned.
    pub async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, TransportError> {
        let mut attempt: u32 = 0;
        loop {
            match self.get_once(endpoint).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    attempt += 1;
                    warn!(endpoint, attempt, max = self.max_retries, error = %e, "API call failed");
                    if attempt > self.max_retries {
                        return Err(e);
                    }
                    let delay = self.retry_backoff * attempt;
                    debug!(endpoint, delay_ms = delay.as_millis() as u64, "retrying");
                    sleep(delay).await;
                }
            }
        }
    }

    // One request raced against the timeout. A late response is dropped
    // along with the request future.
    async fn get_once<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, TransportError> {
        timeout(self.request_timeout, self.request(endpoint))
            .await
            .map_err(|_| TransportError::Timeout {
                endpoint: endpoint.to_string(),
                timeout: self.request_timeout,
            })?
    }

    async fn request<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, TransportError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let http_err = |source| TransportError::Http {
            endpoint: endpoint.to_string(),
            source,
        };
        let resp = self.http.get(&url).send().await.map_err(http_err)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }
        let body: ApiResponse<T> = resp.json().await.map_err(http_err)?;
        body.into_result(endpoint)
    }

    pub async fn get_system_info(&self) -> Result<SystemInfo, TransportError> {
        self.get(Module::System.endpoint()).await
    }

    pub async fn get_cpu_info(&self) -> Result<CpuInfo, TransportError> {
        self.get(Module::Cpu.endpoint()).await
    }

    pub async fn get_memory_info(&self) -> Result<MemoryInfo, TransportError> {
        self.get(Module::Memory.endpoint()).await
    }

    pub async fn get_disk_info(&self) -> Result<DiskInfo, TransportError> {
        self.get(Module::Disk.endpoint()).await
    }

    pub async fn get_network_info(&self) -> Result<NetworkInfo, TransportError> {
        self.get(Module::Network.endpoint()).await
    }

    pub async fn get_processes_info(&self) -> Result<Vec<ProcessInfo>, TransportError> {
        self.get(Module::Processes.endpoint()).await
    }

    /// Fetch one module, tagging a failure with the module it belongs to.
    pub async fn fetch_module(&self, module: Module) -> Result<ModulePayload, MonitorError> {
        let res = match module {
            Module::System => self.get_system_info().await.map(ModulePayload::System),
            Module::Cpu => self.get_cpu_info().await.map(ModulePayload::Cpu),
            Module::Memory => self.get_memory_info().await.map(ModulePayload::Memory),
            Module::Disk => self.get_disk_info().await.map(ModulePayload::Disk),
            Module::Network => self.get_network_info().await.map(ModulePayload::Network),
            Module::Processes => self.get_processes_info().await.map(ModulePayload::Processes),
        };
        res.map_err(|source| MonitorError::ModuleFetch { module, source })
    }

    /// `GET {base}/health`; any 2xx is healthy. Never fails.
    pub async fn check_health(&self) -> bool {
        match self
            .http
            .get(&self.health_url)
            .timeout(self.request_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(url = %self.health_url, error = %e, "health check failed");
                false
            }
        }
    }

    /// Single probe of the system endpoint, no retries. True only for a
    /// 2xx answer whose envelope reports success. Never fails.
    pub async fn test_connection(&self) -> bool {
        let url = format!("{}{}", self.base_url, Module::System.endpoint());
        match timeout(self.request_timeout, self.probe(&url)).await {
            Ok(Ok(body)) => {
                info!(url = %url, success = body.success, "API connection test");
                body.success
            }
            Ok(Err(e)) => {
                warn!(url = %url, error = %e, "API connection test failed");
                false
            }
            Err(_) => {
                warn!(url = %url, "API connection test timed out");
                false
            }
        }
    }

    async fn probe(&self, url: &str) -> Result<ApiResponse<serde_json::Value>, reqwest::Error> {
        let resp = self.http.get(url).send().await?.error_for_status()?;
        resp.json().await
    }
}
