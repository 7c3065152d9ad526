//! Kubernetes forward connector: port-forward channels to Service pods
//!
//! Each accepted client resolves a pod through the shared
//! [`ClusterCache`] and opens a port-forward channel to it via the cluster
//! API server. Pod selection is deliberately deterministic: the first
//! Running pod of the cached list, which keeps routing sticky within a
//! cache-TTL window and stabilises long-lived protocols like AMQP or Redis.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Portforwarder};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::cache::ClusterCache;
use crate::forward::runtime::{RemoteConnector, RemoteReadHalf, RemoteWriteHalf};
use crate::{Error, Result};

/// Opens port-forward channels to the first Running pod behind a Service.
pub struct KubernetesConnector {
    cache: Arc<ClusterCache>,
    context: String,
    namespace: String,
    service: String,
    service_port: u16,
}

impl KubernetesConnector {
    /// Create a connector resolving pods through the given cache.
    pub fn new(
        cache: Arc<ClusterCache>,
        context: impl Into<String>,
        namespace: impl Into<String>,
        service: impl Into<String>,
        service_port: u16,
    ) -> Self {
        Self {
            cache,
            context: context.into(),
            namespace: namespace.into(),
            service: service.into(),
            service_port,
        }
    }
}

#[async_trait::async_trait]
impl RemoteConnector for KubernetesConnector {
    async fn connect(&self) -> Result<(RemoteReadHalf, RemoteWriteHalf)> {
        let client = self.cache.get_client(&self.context).await?;
        let pods = self
            .cache
            .get_pods_for_service(&self.context, &self.namespace, &self.service)
            .await?;

        let pod = pods.first().ok_or_else(|| {
            Error::kubernetes(format!(
                "no running pods for service {}/{}",
                self.namespace, self.service
            ))
        })?;
        let pod_name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::kubernetes("pod has no name"))?;

        debug!(
            context = %self.context,
            namespace = %self.namespace,
            service = %self.service,
            pod = %pod_name,
            port = self.service_port,
            "Opening port-forward channel"
        );

        let pod_api: Api<Pod> = Api::namespaced(client, &self.namespace);
        let mut forwarder = pod_api
            .portforward(&pod_name, &[self.service_port])
            .await
            .map_err(Error::Kube)?;
        let stream = forwarder.take_stream(self.service_port).ok_or_else(|| {
            Error::kubernetes(format!("no channel for port {}", self.service_port))
        })?;

        let (read, write) = tokio::io::split(PodChannel {
            stream,
            _forwarder: forwarder,
        });
        Ok((Box::new(read), Box::new(write)))
    }

    fn target(&self) -> String {
        format!(
            "{}/{}/{}:{}",
            self.context, self.namespace, self.service, self.service_port
        )
    }
}

/// One port-forward channel to a pod.
///
/// Keeps the `Portforwarder` alive alongside its stream: the forwarder task
/// drives the underlying API-server connection for as long as the channel
/// is in use.
struct PodChannel<S> {
    stream: S,
    _forwarder: Portforwarder,
}

impl<S: AsyncRead + Unpin> AsyncRead for PodChannel<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PodChannel<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
