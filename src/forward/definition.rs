//! Typed, validated forward definitions
//!
//! [`ForwardDefinition`] is the persisted description of one forward. The
//! JSON form carries the variant in a `type` tag (`socket` / `kubernetes`)
//! next to the variant's fields; unknown tags fail deserialization rather
//! than entering the registry as something the manager can't start.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cache::ClusterCache;
use crate::forward::runtime::{Forwarder, RemoteConnector};
use crate::forward::{KubernetesConnector, SocketConnector};
use crate::{Error, Result};

/// Group assigned to definitions that don't name one.
pub const DEFAULT_GROUP: &str = "default";

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

/// One configured forward: a loopback port mapped to a remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ForwardDefinition {
    /// Relay to a raw TCP endpoint.
    Socket(SocketForward),
    /// Relay to a pod selected from a Kubernetes Service.
    Kubernetes(KubernetesForward),
}

/// Forward to a raw remote TCP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketForward {
    /// Unique forward name (registry-wide primary key).
    pub name: String,
    /// Group label for bulk operations.
    #[serde(default = "default_group")]
    pub group: String,
    /// Loopback port to listen on.
    pub local_port: u16,
    /// Whether the forward should be running.
    #[serde(default)]
    pub enabled: bool,
    /// Remote host, resolved by the OS resolver at connect time.
    pub remote_host: String,
    /// Remote port.
    pub remote_port: u16,
}

/// Forward to a pod behind a Kubernetes Service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesForward {
    /// Unique forward name (registry-wide primary key).
    pub name: String,
    /// Group label for bulk operations.
    #[serde(default = "default_group")]
    pub group: String,
    /// Loopback port to listen on.
    pub local_port: u16,
    /// Whether the forward should be running.
    #[serde(default)]
    pub enabled: bool,
    /// Kubeconfig context naming the cluster.
    pub context: String,
    /// Namespace of the Service.
    pub namespace: String,
    /// Service whose selector picks the target pods.
    pub service: String,
    /// Target port on the selected pod.
    pub service_port: u16,
}

impl ForwardDefinition {
    /// The forward's unique name.
    pub fn name(&self) -> &str {
        match self {
            Self::Socket(s) => &s.name,
            Self::Kubernetes(k) => &k.name,
        }
    }

    /// The forward's group label.
    pub fn group(&self) -> &str {
        match self {
            Self::Socket(s) => &s.group,
            Self::Kubernetes(k) => &k.group,
        }
    }

    /// The loopback port this forward listens on.
    pub fn local_port(&self) -> u16 {
        match self {
            Self::Socket(s) => s.local_port,
            Self::Kubernetes(k) => k.local_port,
        }
    }

    /// Whether the forward should be running.
    pub fn enabled(&self) -> bool {
        match self {
            Self::Socket(s) => s.enabled,
            Self::Kubernetes(k) => k.enabled,
        }
    }

    /// The variant tag as it appears on the wire and in config JSON.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Socket(_) => "socket",
            Self::Kubernetes(_) => "kubernetes",
        }
    }

    /// Rewrite the forward's name (used when the config-file map key wins).
    pub fn set_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        match self {
            Self::Socket(s) => s.name = name,
            Self::Kubernetes(k) => k.name = name,
        }
    }

    /// Rewrite the forward's group.
    pub fn set_group(&mut self, group: impl Into<String>) {
        let group = group.into();
        match self {
            Self::Socket(s) => s.group = group,
            Self::Kubernetes(k) => k.group = group,
        }
    }

    /// Flip the enabled flag.
    pub fn set_enabled(&mut self, enabled: bool) {
        match self {
            Self::Socket(s) => s.enabled = enabled,
            Self::Kubernetes(k) => k.enabled = enabled,
        }
    }

    /// Replace an empty group with the default one.
    pub fn normalize(&mut self) {
        if self.group().trim().is_empty() {
            self.set_group(DEFAULT_GROUP);
        }
    }

    /// Check the per-variant invariants; a definition that fails here never
    /// enters the registry.
    pub fn validate(&self) -> Result<()> {
        if self.name().trim().is_empty() {
            return Err(Error::validation("forward name must not be empty"));
        }
        if self.local_port() == 0 {
            return Err(Error::validation("localPort must be between 1 and 65535"));
        }
        match self {
            Self::Socket(s) => {
                if s.remote_host.trim().is_empty() {
                    return Err(Error::validation("remoteHost must not be empty"));
                }
                if s.remote_port == 0 {
                    return Err(Error::validation("remotePort must be between 1 and 65535"));
                }
            }
            Self::Kubernetes(k) => {
                if k.context.trim().is_empty() {
                    return Err(Error::validation("context must not be empty"));
                }
                if k.namespace.trim().is_empty() {
                    return Err(Error::validation("namespace must not be empty"));
                }
                if k.service.trim().is_empty() {
                    return Err(Error::validation("service must not be empty"));
                }
                if k.service_port == 0 {
                    return Err(Error::validation(
                        "servicePort must be between 1 and 65535",
                    ));
                }
            }
        }
        Ok(())
    }

    /// True when replacing `prev` with `self` requires tearing down and
    /// recreating a running forwarder: the listen port, the variant, or any
    /// routing parameter changed. Group and enabled flips alone never force
    /// a restart, so open connections survive them.
    pub fn requires_restart(&self, prev: &ForwardDefinition) -> bool {
        match (self, prev) {
            (Self::Socket(a), Self::Socket(b)) => {
                a.local_port != b.local_port
                    || a.remote_host != b.remote_host
                    || a.remote_port != b.remote_port
            }
            (Self::Kubernetes(a), Self::Kubernetes(b)) => {
                a.local_port != b.local_port
                    || a.context != b.context
                    || a.namespace != b.namespace
                    || a.service != b.service
                    || a.service_port != b.service_port
            }
            _ => true,
        }
    }

    /// Build the runtime forwarder for this definition. The only place that
    /// maps the variant tag to a connector.
    pub fn create_forwarder(
        &self,
        cache: Arc<ClusterCache>,
        shutdown: &CancellationToken,
    ) -> Forwarder {
        let connector: Arc<dyn RemoteConnector> = match self {
            Self::Socket(s) => Arc::new(SocketConnector::new(&s.remote_host, s.remote_port)),
            Self::Kubernetes(k) => Arc::new(KubernetesConnector::new(
                cache,
                &k.context,
                &k.namespace,
                &k.service,
                k.service_port,
            )),
        };
        Forwarder::new(self.name(), self.local_port(), connector, shutdown)
    }
}
