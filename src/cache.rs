//! Pooled Kubernetes clients and TTL-bounded pod snapshots
//!
//! Building an API client and listing pods on every accepted connection
//! would make bursty workloads pay the kubeconfig/TLS/discovery cost per
//! connection. The cache keeps:
//!
//! - one API client per kubeconfig context, refreshed every 10 minutes
//! - one immutable pod-list snapshot per `(context, namespace, service)`,
//!   refreshed every 30 seconds
//!
//! Pod snapshots hold only pods in phase `Running`, selected by the
//! Service's label selector. A background sweep drops expired entries every
//! minute. The cache is shared by injection (`Arc<ClusterCache>`), not as a
//! process global, so tests and embedders can scope it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, ListParams};
use kube::config::KubeConfigOptions;
use kube::{Client, Config};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, Result};

/// How long a cached API client is reused before being rebuilt.
pub const CLIENT_TTL: Duration = Duration::from_secs(600);

/// How long a pod-list snapshot is served before re-fetching.
pub const POD_LIST_TTL: Duration = Duration::from_secs(30);

/// Interval of the background sweep that drops expired entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PodKey {
    context: String,
    namespace: String,
    service: String,
}

struct CachedClient {
    client: Client,
    expires_at: Instant,
}

struct CachedPodList {
    pods: Arc<Vec<Pod>>,
    expires_at: Instant,
}

/// Process-shared cache of Kubernetes API clients and pod lists.
#[derive(Default)]
pub struct ClusterCache {
    clients: DashMap<String, CachedClient>,
    pods: DashMap<PodKey, CachedPodList>,
}

impl ClusterCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a live API client for the kubeconfig context, building one on
    /// miss or expiry. Replacement drops the prior client.
    pub async fn get_client(&self, context: &str) -> Result<Client> {
        if let Some(entry) = self.clients.get(context) {
            if entry.expires_at > Instant::now() {
                return Ok(entry.client.clone());
            }
        }

        let client = build_client(context).await?;
        debug!(context = %context, "Kubernetes client created");
        self.clients.insert(
            context.to_string(),
            CachedClient {
                client: client.clone(),
                expires_at: Instant::now() + CLIENT_TTL,
            },
        );
        Ok(client)
    }

    /// Return the Running pods selected by the Service's label selector,
    /// from cache when fresh. Concurrent misses for the same key may each
    /// fetch; the last snapshot stored wins.
    pub async fn get_pods_for_service(
        &self,
        context: &str,
        namespace: &str,
        service: &str,
    ) -> Result<Arc<Vec<Pod>>> {
        let key = PodKey {
            context: context.to_string(),
            namespace: namespace.to_string(),
            service: service.to_string(),
        };
        if let Some(entry) = self.pods.get(&key) {
            if entry.expires_at > Instant::now() {
                return Ok(Arc::clone(&entry.pods));
            }
        }

        let client = self.get_client(context).await?;
        let pods = fetch_service_pods(client, namespace, service).await?;
        debug!(
            context = %context,
            namespace = %namespace,
            service = %service,
            pods = pods.len(),
            "Pod list refreshed"
        );

        let snapshot = Arc::new(pods);
        self.pods.insert(
            key,
            CachedPodList {
                pods: Arc::clone(&snapshot),
                expires_at: Instant::now() + POD_LIST_TTL,
            },
        );
        Ok(snapshot)
    }

    /// Drop every cached pod list.
    pub fn invalidate_pods(&self) {
        self.pods.clear();
    }

    /// Drop the cached pod list for one service.
    pub fn invalidate_pods_for(&self, context: &str, namespace: &str, service: &str) {
        self.pods.remove(&PodKey {
            context: context.to_string(),
            namespace: namespace.to_string(),
            service: service.to_string(),
        });
    }

    /// Remove expired entries from both maps.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.clients.retain(|_, entry| entry.expires_at > now);
        self.pods.retain(|_, entry| entry.expires_at > now);
    }

    /// Number of cached clients (expired entries included until swept).
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Number of cached pod snapshots (expired entries included until swept).
    pub fn pod_list_count(&self) -> usize {
        self.pods.len()
    }

    /// Spawn the background sweep task; it runs until `cancel` fires.
    pub fn spawn_sweeper(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let cache = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => cache.sweep(),
                }
            }
        })
    }
}

/// Build a client for a kubeconfig context using default kubeconfig
/// resolution (`KUBECONFIG` env / `~/.kube/config`).
async fn build_client(context: &str) -> Result<Client> {
    let options = KubeConfigOptions {
        context: Some(context.to_string()),
        ..Default::default()
    };
    let config = Config::from_kubeconfig(&options).await.map_err(|e| {
        Error::kubernetes(format!(
            "failed to load kubeconfig for context '{}': {}",
            context, e
        ))
    })?;
    Client::try_from(config).map_err(Error::Kube)
}

/// Read the Service, join its selector into a label query, list the
/// matching pods, and keep only those in phase Running.
async fn fetch_service_pods(client: Client, namespace: &str, service: &str) -> Result<Vec<Pod>> {
    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    let svc = services.get(service).await.map_err(Error::Kube)?;

    let selector = svc
        .spec
        .and_then(|spec| spec.selector)
        .unwrap_or_default();
    if selector.is_empty() {
        warn!(
            namespace = %namespace,
            service = %service,
            "Service has no selector, no pods to forward to"
        );
        return Ok(Vec::new());
    }

    let pods_api: Api<Pod> = Api::namespaced(client, namespace);
    let list = pods_api
        .list(&ListParams::default().labels(&join_selector(&selector)))
        .await
        .map_err(Error::Kube)?;

    Ok(list.items.into_iter().filter(is_running).collect())
}

/// Join a Service selector map into the `k=v,k=v` label-query form.
fn join_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running")
}
