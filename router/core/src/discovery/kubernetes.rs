//! Kubernetes pod watch feed
//!
//! Lists the pods matching a label selector, then follows the watch API
//! (newline-delimited JSON) from the list's resource version. Ready pods
//! become backends at `http://{podIP}:{port}`; their served models come from
//! `GET /v1/models` on the pod.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::cluster::{EventStream, MembershipFeed};
use super::{BackoffConfig, DiscoveryError, MembershipEvent};
use crate::probe::BackendProbe;
use crate::registry::{BackendEndpoint, EndpointId};

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

// ============================================================================
// Configuration
// ============================================================================

/// Cluster-watch discovery settings
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterDiscoveryConfig {
    /// API server base URL
    pub api_server: String,
    pub namespace: String,
    /// Port the inference engine listens on inside each pod
    pub port: u16,
    /// Label selector for backend pods
    pub label_selector: String,
    /// Pod label whose value becomes the backend role
    pub role_label: Option<String>,
    /// Bearer token file; a missing file means unauthenticated access
    pub token_path: Option<PathBuf>,
    /// Extra CA certificate (PEM) for the API server
    pub ca_cert_path: Option<PathBuf>,
    pub insecure_skip_tls_verify: bool,
    /// Timeout for the list call and per-pod model lookups
    pub request_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl Default for ClusterDiscoveryConfig {
    fn default() -> Self {
        Self {
            api_server: "https://kubernetes.default.svc".to_string(),
            namespace: "default".to_string(),
            port: 8000,
            label_selector: String::new(),
            role_label: None,
            token_path: Some(PathBuf::from(SERVICE_ACCOUNT_TOKEN)),
            ca_cert_path: None,
            insecure_skip_tls_verify: false,
            request_timeout: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ClusterDiscoveryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.api_server.trim().is_empty() {
            return Err("cluster api_server must not be empty".into());
        }
        if self.namespace.trim().is_empty() {
            return Err("cluster namespace must not be empty".into());
        }
        if self.port == 0 {
            return Err("cluster backend port must be non-zero".into());
        }
        if self.request_timeout.is_zero() {
            return Err("cluster request timeout must be positive".into());
        }
        Ok(())
    }

    fn pods_url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/pods",
            self.api_server.trim_end_matches('/'),
            self.namespace
        )
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct WatchEvent {
    #[serde(rename = "type")]
    kind: String,
    object: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct PodList {
    #[serde(default)]
    metadata: ListMeta,
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Default, Deserialize)]
struct ListMeta {
    #[serde(rename = "resourceVersion", default)]
    resource_version: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Pod {
    metadata: PodMeta,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Clone, Debug, Deserialize)]
struct PodMeta {
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(rename = "deletionTimestamp", default)]
    deletion_timestamp: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(rename = "podIP", default)]
    pod_ip: Option<String>,
    #[serde(default)]
    conditions: Vec<PodCondition>,
}

#[derive(Clone, Debug, Deserialize)]
struct PodCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

#[derive(Debug, Default, Deserialize)]
struct WatchStatus {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

impl Pod {
    fn is_ready(&self) -> bool {
        self.metadata.deletion_timestamp.is_none()
            && self
                .status
                .conditions
                .iter()
                .any(|c| c.kind == "Ready" && c.status == "True")
    }

    fn endpoint_id(&self, port: u16) -> Option<EndpointId> {
        let ip = self.status.pod_ip.as_deref().filter(|ip| !ip.is_empty())?;
        Some(EndpointId::new(format!("http://{}:{}", ip, port)))
    }
}

// ============================================================================
// Pod Tracking
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PodEventKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum PodAction {
    Remove(EndpointId),
    /// Endpoint whose models still need to be resolved
    Upsert(BackendEndpoint),
}

/// Maps pod names to the identity they are registered under, so an IP
/// change removes the old identity.
#[derive(Debug)]
pub(crate) struct PodTracker {
    port: u16,
    role_label: Option<String>,
    pods: HashMap<String, EndpointId>,
}

impl PodTracker {
    pub(crate) fn new(port: u16, role_label: Option<String>) -> Self {
        Self {
            port,
            role_label,
            pods: HashMap::new(),
        }
    }

    pub(crate) fn observe(&mut self, kind: PodEventKind, pod: &Pod) -> Vec<PodAction> {
        let name = &pod.metadata.name;
        let identity = match kind {
            PodEventKind::Deleted => None,
            _ if pod.is_ready() => pod.endpoint_id(self.port),
            _ => None,
        };

        let mut actions = Vec::new();
        let previous = self.pods.get(name).cloned();
        if let Some(previous) = previous {
            if Some(&previous) != identity.as_ref() {
                self.pods.remove(name);
                actions.push(PodAction::Remove(previous));
            }
        }

        if let Some(id) = identity {
            self.pods.insert(name.clone(), id.clone());
            let mut endpoint = BackendEndpoint::new(id.as_str());
            endpoint.labels = pod.metadata.labels.clone();
            endpoint.role = self
                .role_label
                .as_ref()
                .and_then(|key| pod.metadata.labels.get(key).cloned());
            actions.push(PodAction::Upsert(endpoint));
        }
        actions
    }
}

/// Decode one watch line into tracker actions
pub(crate) fn decode_watch_line(
    line: &[u8],
    tracker: &mut PodTracker,
) -> Result<Vec<PodAction>, DiscoveryError> {
    let text = std::str::from_utf8(line)
        .map_err(|e| DiscoveryError::Decode(e.to_string()))?
        .trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let event: WatchEvent =
        serde_json::from_str(text).map_err(|e| DiscoveryError::Decode(e.to_string()))?;
    let kind = match event.kind.as_str() {
        "ADDED" => PodEventKind::Added,
        "MODIFIED" => PodEventKind::Modified,
        "DELETED" => PodEventKind::Deleted,
        "BOOKMARK" => return Ok(Vec::new()),
        "ERROR" => {
            let status: WatchStatus = serde_json::from_value(event.object).unwrap_or_default();
            return Err(DiscoveryError::Stream(format!(
                "watch error {}: {}",
                status.code.unwrap_or_default(),
                status.message.unwrap_or_default()
            )));
        }
        other => {
            tracing::debug!(kind = other, "Ignoring unknown watch event");
            return Ok(Vec::new());
        }
    };

    let pod: Pod =
        serde_json::from_value(event.object).map_err(|e| DiscoveryError::Decode(e.to_string()))?;
    Ok(tracker.observe(kind, &pod))
}

// ============================================================================
// Feed
// ============================================================================

#[derive(Clone)]
struct ModelResolver {
    probe: Arc<dyn BackendProbe>,
    timeout: Duration,
}

impl ModelResolver {
    /// Fill in served models. Pods that cannot answer are skipped until
    /// their next event.
    async fn resolve(&self, mut endpoint: BackendEndpoint) -> Option<BackendEndpoint> {
        match self.probe.list_models(&endpoint.id, self.timeout).await {
            Ok(models) if !models.is_empty() => {
                endpoint.models.extend(models);
                Some(endpoint)
            }
            Ok(_) => {
                tracing::debug!(backend = %endpoint.id, "Pod serves no models yet, skipping");
                None
            }
            Err(e) => {
                tracing::warn!(backend = %endpoint.id, error = %e, "Failed to list pod models, skipping");
                None
            }
        }
    }

    async fn apply(&self, action: PodAction) -> Option<MembershipEvent> {
        match action {
            PodAction::Remove(id) => Some(MembershipEvent::Remove(id)),
            PodAction::Upsert(endpoint) => self.resolve(endpoint).await.map(MembershipEvent::Upsert),
        }
    }
}

/// Membership feed backed by the Kubernetes pod API
pub struct KubernetesPodFeed {
    config: ClusterDiscoveryConfig,
    client: reqwest::Client,
    resolver: ModelResolver,
}

impl KubernetesPodFeed {
    pub fn new(
        config: ClusterDiscoveryConfig,
        probe: Arc<dyn BackendProbe>,
    ) -> Result<Self, DiscoveryError> {
        config.validate().map_err(DiscoveryError::Config)?;

        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify);
        if let Some(path) = &config.ca_cert_path {
            let pem = std::fs::read(path)
                .map_err(|e| DiscoveryError::Config(format!("{}: {}", path.display(), e)))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| DiscoveryError::Config(format!("{}: {}", path.display(), e)))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| DiscoveryError::Config(e.to_string()))?;

        let resolver = ModelResolver {
            probe,
            timeout: config.request_timeout,
        };
        Ok(Self {
            config,
            client,
            resolver,
        })
    }

    async fn read_token(&self) -> Result<Option<String>, DiscoveryError> {
        let Some(path) = &self.config.token_path else {
            return Ok(None);
        };
        match tokio::fs::read_to_string(path).await {
            Ok(token) => Ok(Some(token.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DiscoveryError::Config(format!("{}: {}", path.display(), e))),
        }
    }

    fn request(&self, token: Option<&str>) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .get(self.config.pods_url())
            .query(&[("labelSelector", self.config.label_selector.as_str())]);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, DiscoveryError> {
        let url = self.config.pods_url();
        let response = request.send().await.map_err(|e| DiscoveryError::Http {
            url: url.clone(),
            message: e.to_string(),
        })?;
        if !response.status().is_success() {
            return Err(DiscoveryError::Http {
                url,
                message: format!("HTTP {}", response.status()),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl MembershipFeed for KubernetesPodFeed {
    fn name(&self) -> &str {
        "kubernetes"
    }

    async fn subscribe(&self) -> Result<EventStream, DiscoveryError> {
        let token = self.read_token().await?;

        let list: PodList = self
            .send(self.request(token.as_deref()).timeout(self.config.request_timeout))
            .await?
            .json()
            .await
            .map_err(|e| DiscoveryError::Decode(e.to_string()))?;

        let mut tracker = PodTracker::new(self.config.port, self.config.role_label.clone());
        let pending: Vec<BackendEndpoint> = list
            .items
            .iter()
            .flat_map(|pod| tracker.observe(PodEventKind::Added, pod))
            .filter_map(|action| match action {
                PodAction::Upsert(endpoint) => Some(endpoint),
                PodAction::Remove(_) => None,
            })
            .collect();
        let endpoints: Vec<BackendEndpoint> =
            join_all(pending.into_iter().map(|e| self.resolver.resolve(e)))
                .await
                .into_iter()
                .flatten()
                .collect();

        let mut watch = self.request(token.as_deref()).query(&[
            ("watch", "true"),
            ("allowWatchBookmarks", "true"),
        ]);
        if let Some(version) = &list.metadata.resource_version {
            watch = watch.query(&[("resourceVersion", version.as_str())]);
        }
        let response = self.send(watch).await?;

        tracing::info!(
            namespace = %self.config.namespace,
            selector = %self.config.label_selector,
            pods = endpoints.len(),
            "Pod watch established"
        );

        let (tx, rx) = mpsc::channel(64);
        let _ = tx.send(Ok(MembershipEvent::Resync(endpoints))).await;
        tokio::spawn(pump(response, tracker, self.resolver.clone(), tx));

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(stream.boxed())
    }
}

/// Read the NDJSON watch body and forward resolved events until the body
/// ends, an error occurs, or the subscriber goes away.
async fn pump(
    response: reqwest::Response,
    mut tracker: PodTracker,
    resolver: ModelResolver,
    tx: mpsc::Sender<Result<MembershipEvent, DiscoveryError>>,
) {
    let mut body = response.bytes_stream().boxed();
    let mut buffer: Vec<u8> = Vec::new();

    loop {
        let chunk = tokio::select! {
            _ = tx.closed() => return,
            chunk = body.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
            Some(Err(e)) => {
                let _ = tx.send(Err(DiscoveryError::Stream(e.to_string()))).await;
                return;
            }
            None => return,
        }

        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let actions = match decode_watch_line(&line, &mut tracker) {
                Ok(actions) => actions,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            for action in actions {
                if let Some(event) = resolver.apply(action).await {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
