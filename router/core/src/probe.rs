//! Backend probes
//!
//! The outbound calls the control plane makes to backends: liveness
//! (`GET /health`), engine load (`GET /metrics`, Prometheus text) and model
//! listing (`GET /v1/models`). Everything goes through [`BackendProbe`] so
//! workers can be driven by a mock in tests.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::registry::EndpointId;

// ============================================================================
// Probe Trait
// ============================================================================

/// Engine-internal load signals reported by a backend
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EngineLoad {
    /// KV-cache occupancy in [0, 1]
    pub kv_cache_usage: f64,
    /// Requests waiting in the engine queue
    pub waiting_requests: u64,
    /// Requests currently running
    pub running_requests: u64,
    /// Prefix-cache hit rate, when the engine exports it
    pub prefix_cache_hit_rate: Option<f64>,
}

/// Outbound calls to a single backend
///
/// Every call takes its own timeout; callers pick one strictly shorter than
/// their polling interval.
#[async_trait]
pub trait BackendProbe: Send + Sync {
    /// Probe name for logs
    fn name(&self) -> &str;

    /// Liveness check
    async fn health_check(&self, endpoint: &EndpointId, timeout: Duration) -> Result<(), ProbeError>;

    /// Scrape engine load
    async fn fetch_load(&self, endpoint: &EndpointId, timeout: Duration)
        -> Result<EngineLoad, ProbeError>;

    /// Models the backend currently serves
    async fn list_models(
        &self,
        endpoint: &EndpointId,
        timeout: Duration,
    ) -> Result<Vec<String>, ProbeError>;
}

/// Probe failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("malformed response from {url}: {message}")]
    Malformed { url: String, message: String },
}

impl ProbeError {
    fn from_reqwest(url: &str, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else {
            Self::Transport {
                url: url.to_string(),
                message: e.to_string(),
            }
        }
    }
}

// ============================================================================
// HTTP Probe
// ============================================================================

/// Probe speaking the vLLM-compatible HTTP surface
#[derive(Clone, Debug)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    /// Build a probe with its own connection pool
    pub fn new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ProbeError::Transport {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }

    /// Use an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn get(&self, url: &str, timeout: Duration) -> Result<reqwest::Response, ProbeError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ProbeError::from_reqwest(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl BackendProbe for HttpProbe {
    fn name(&self) -> &str {
        "http"
    }

    async fn health_check(&self, endpoint: &EndpointId, timeout: Duration) -> Result<(), ProbeError> {
        let url = endpoint.join("health");
        self.get(&url, timeout).await.map(|_| ())
    }

    async fn fetch_load(
        &self,
        endpoint: &EndpointId,
        timeout: Duration,
    ) -> Result<EngineLoad, ProbeError> {
        let url = endpoint.join("metrics");
        let body = self
            .get(&url, timeout)
            .await?
            .text()
            .await
            .map_err(|e| ProbeError::from_reqwest(&url, e))?;

        parse_engine_metrics(&body).map_err(|message| ProbeError::Malformed { url, message })
    }

    async fn list_models(
        &self,
        endpoint: &EndpointId,
        timeout: Duration,
    ) -> Result<Vec<String>, ProbeError> {
        let url = endpoint.join("v1/models");
        let data: serde_json::Value = self
            .get(&url, timeout)
            .await?
            .json()
            .await
            .map_err(|e| ProbeError::Malformed {
                url: url.clone(),
                message: e.to_string(),
            })?;

        let models = data
            .get("data")
            .and_then(|d| d.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m.get("id").and_then(|n| n.as_str()).map(String::from))
                    .collect()
            })
            .ok_or_else(|| ProbeError::Malformed {
                url,
                message: "missing 'data' array".to_string(),
            })?;

        Ok(models)
    }
}

// ============================================================================
// Prometheus Text Parsing
// ============================================================================

const KV_CACHE_GAUGES: [&str; 2] = ["vllm:gpu_cache_usage_perc", "vllm:kv_cache_usage_perc"];
const WAITING_GAUGE: &str = "vllm:num_requests_waiting";
const RUNNING_GAUGE: &str = "vllm:num_requests_running";
const PREFIX_HIT_GAUGE: &str = "vllm:gpu_prefix_cache_hit_rate";

/// Split one exposition line into metric name and value
fn parse_sample(line: &str) -> Option<(&str, f64)> {
    let (name, rest) = match line.find('{') {
        Some(open) => {
            let close = line.rfind('}')?;
            (&line[..open], &line[close + 1..])
        }
        None => {
            let mut parts = line.splitn(2, char::is_whitespace);
            (parts.next()?, parts.next()?)
        }
    };
    let value = rest.split_whitespace().next()?.parse().ok()?;
    Some((name.trim(), value))
}

/// Extract engine load from a vLLM `/metrics` body. Series of the same gauge
/// with different labels (one per served model) are summed.
pub fn parse_engine_metrics(body: &str) -> Result<EngineLoad, String> {
    let mut kv: Option<f64> = None;
    let mut waiting = 0.0;
    let mut running = 0.0;
    let mut prefix: Option<f64> = None;

    for line in body.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, value)) = parse_sample(line) else {
            continue;
        };
        if !value.is_finite() {
            continue;
        }

        match name {
            n if KV_CACHE_GAUGES.contains(&n) => *kv.get_or_insert(0.0) += value,
            WAITING_GAUGE => waiting += value,
            RUNNING_GAUGE => running += value,
            PREFIX_HIT_GAUGE => *prefix.get_or_insert(0.0) += value,
            _ => {}
        }
    }

    let kv = kv.ok_or_else(|| "no KV cache usage gauge".to_string())?;
    Ok(EngineLoad {
        kv_cache_usage: kv.clamp(0.0, 1.0),
        waiting_requests: waiting.max(0.0) as u64,
        running_requests: running.max(0.0) as u64,
        prefix_cache_hit_rate: prefix.map(|p| p.clamp(0.0, 1.0)),
    })
}
