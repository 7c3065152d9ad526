//! gRPC control surface for the daemon
//!
//! A thin adapter over [`ForwardManager`]: each RPC converts its wire
//! message, calls the matching manager operation, and projects the result
//! back. Semantic failures (not found, validation, port conflicts) travel
//! in-band as `{success, error}` so clients can render them; only malformed
//! requests and daemon bugs become transport-level `Status` errors.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::info;

use crate::forward::{ForwardDefinition, Forwarder, KubernetesForward, SocketForward};
use crate::manager::ForwardManager;
use crate::proto::kube_portal_server::{KubePortal, KubePortalServer};
use crate::proto::{
    ApplyConfigRequest, ApplyConfigResponse, CreateForwardRequest, DeleteGroupResponse,
    ExportConfigRequest, ExportConfigResponse, ForwardEntry, ForwardNameRequest,
    ForwardOpResponse, ForwardSpec, ForwardStatus, GetForwardResponse, GetStatusRequest,
    GetStatusResponse, GroupRequest, GroupStatus, ListForwardsRequest, ListForwardsResponse,
    ListGroupsRequest, ListGroupsResponse, ReloadConfigRequest, ShutdownRequest,
    ShutdownResponse,
};
use crate::{Error, Result};

/// gRPC service implementation over the forward manager.
pub struct PortalService {
    manager: Arc<ForwardManager>,
    shutdown: CancellationToken,
    started_at: std::time::Instant,
}

impl PortalService {
    /// Create a service over the given manager. `Shutdown` RPCs cancel the
    /// provided token.
    pub fn new(manager: Arc<ForwardManager>, shutdown: CancellationToken) -> Self {
        Self {
            manager,
            shutdown,
            started_at: std::time::Instant::now(),
        }
    }

    /// Convert to a tonic service
    pub fn into_service(self) -> KubePortalServer<Self> {
        KubePortalServer::new(self)
    }

    /// Serve the control surface on `addr` until `shutdown` fires.
    pub async fn serve(
        manager: Arc<ForwardManager>,
        shutdown: CancellationToken,
        addr: SocketAddr,
    ) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            Error::internal(format!("failed to bind RPC listener on {}: {}", addr, e))
        })?;
        let service = Self::new(manager, shutdown.clone());

        Server::builder()
            .add_service(service.into_service())
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                shutdown.cancelled_owned(),
            )
            .await
            .map_err(|e| Error::internal(format!("rpc server error: {}", e)))
    }

    fn entry_for(&self, def: &ForwardDefinition) -> ForwardEntry {
        let status = self
            .manager
            .forwarder(def.name())
            .map(|fw| status_projection(&fw))
            .unwrap_or_default();
        ForwardEntry {
            spec: Some(definition_to_spec(def)),
            status: Some(status),
        }
    }
}

#[tonic::async_trait]
impl KubePortal for PortalService {
    async fn create_forward(
        &self,
        request: Request<CreateForwardRequest>,
    ) -> std::result::Result<Response<ForwardOpResponse>, Status> {
        let Some(spec) = request.into_inner().spec else {
            return Err(Status::invalid_argument("spec is required"));
        };
        let result = match spec_to_definition(spec) {
            Ok(def) => self.manager.add_or_update(def).await,
            Err(e) => Err(e),
        };
        Ok(Response::new(op_response(result)))
    }

    async fn delete_forward(
        &self,
        request: Request<ForwardNameRequest>,
    ) -> std::result::Result<Response<ForwardOpResponse>, Status> {
        let name = request.into_inner().name;
        let response = match self.manager.delete(&name).await {
            Ok(true) => success(),
            Ok(false) => failure(format!("forward '{}' not found", name)),
            Err(e) => failure(e.to_string()),
        };
        Ok(Response::new(response))
    }

    async fn list_forwards(
        &self,
        request: Request<ListForwardsRequest>,
    ) -> std::result::Result<Response<ListForwardsResponse>, Status> {
        let group_filter = request.into_inner().group_filter;
        let forwards = self
            .manager
            .get_all()
            .await
            .iter()
            .filter(|def| group_filter.is_empty() || def.group() == group_filter)
            .map(|def| self.entry_for(def))
            .collect();
        Ok(Response::new(ListForwardsResponse { forwards }))
    }

    async fn get_forward(
        &self,
        request: Request<ForwardNameRequest>,
    ) -> std::result::Result<Response<GetForwardResponse>, Status> {
        let name = request.into_inner().name;
        let response = match self.manager.get(&name).await {
            Some(def) => GetForwardResponse {
                success: true,
                error: String::new(),
                entry: Some(self.entry_for(&def)),
            },
            None => GetForwardResponse {
                success: false,
                error: format!("forward '{}' not found", name),
                entry: None,
            },
        };
        Ok(Response::new(response))
    }

    async fn start_forward(
        &self,
        request: Request<ForwardNameRequest>,
    ) -> std::result::Result<Response<ForwardOpResponse>, Status> {
        let name = request.into_inner().name;
        Ok(Response::new(op_response(self.manager.start(&name).await)))
    }

    async fn stop_forward(
        &self,
        request: Request<ForwardNameRequest>,
    ) -> std::result::Result<Response<ForwardOpResponse>, Status> {
        let name = request.into_inner().name;
        let response = match self.manager.stop(&name).await {
            Ok(true) => success(),
            Ok(false) => failure(format!("forward '{}' is not running", name)),
            Err(e) => failure(e.to_string()),
        };
        Ok(Response::new(response))
    }

    async fn list_groups(
        &self,
        _request: Request<ListGroupsRequest>,
    ) -> std::result::Result<Response<ListGroupsResponse>, Status> {
        let groups = self
            .manager
            .group_statuses()
            .await
            .into_iter()
            .map(|(name, status)| GroupStatus {
                name,
                enabled: status.enabled,
                forward_count: status.forward_count as u32,
                active_forward_count: status.active_forward_count as u32,
            })
            .collect();
        Ok(Response::new(ListGroupsResponse { groups }))
    }

    async fn enable_group(
        &self,
        request: Request<GroupRequest>,
    ) -> std::result::Result<Response<ForwardOpResponse>, Status> {
        let group = request.into_inner().group;
        let result = self.manager.enable_group(&group).await.map(|_| ());
        Ok(Response::new(op_response(result)))
    }

    async fn disable_group(
        &self,
        request: Request<GroupRequest>,
    ) -> std::result::Result<Response<ForwardOpResponse>, Status> {
        let group = request.into_inner().group;
        let result = self.manager.disable_group(&group).await.map(|_| ());
        Ok(Response::new(op_response(result)))
    }

    async fn delete_group(
        &self,
        request: Request<GroupRequest>,
    ) -> std::result::Result<Response<DeleteGroupResponse>, Status> {
        let group = request.into_inner().group;
        let response = match self.manager.delete_group(&group).await {
            Ok(deleted) => DeleteGroupResponse {
                success: true,
                error: String::new(),
                deleted: deleted as u32,
            },
            Err(e) => DeleteGroupResponse {
                success: false,
                error: e.to_string(),
                deleted: 0,
            },
        };
        Ok(Response::new(response))
    }

    async fn apply_config(
        &self,
        request: Request<ApplyConfigRequest>,
    ) -> std::result::Result<Response<ApplyConfigResponse>, Status> {
        let req = request.into_inner();
        let target_group = if req.target_group.is_empty() {
            None
        } else {
            Some(req.target_group.as_str())
        };
        let response = match self
            .manager
            .apply_config(&req.config_json, target_group, req.remove_missing)
            .await
        {
            Ok(outcome) => ApplyConfigResponse {
                success: true,
                error: String::new(),
                added: outcome.added as u32,
                updated: outcome.updated as u32,
                removed: outcome.removed as u32,
            },
            Err(e) => ApplyConfigResponse {
                success: false,
                error: e.to_string(),
                added: 0,
                updated: 0,
                removed: 0,
            },
        };
        Ok(Response::new(response))
    }

    async fn export_config(
        &self,
        request: Request<ExportConfigRequest>,
    ) -> std::result::Result<Response<ExportConfigResponse>, Status> {
        let req = request.into_inner();
        let group_filter = if req.group_filter.is_empty() {
            None
        } else {
            Some(req.group_filter.as_str())
        };
        let response = match self
            .manager
            .export_config(req.include_disabled, group_filter)
            .await
        {
            Ok(config_json) => ExportConfigResponse {
                success: true,
                error: String::new(),
                config_json,
            },
            Err(e) => ExportConfigResponse {
                success: false,
                error: e.to_string(),
                config_json: String::new(),
            },
        };
        Ok(Response::new(response))
    }

    async fn reload_config(
        &self,
        _request: Request<ReloadConfigRequest>,
    ) -> std::result::Result<Response<ForwardOpResponse>, Status> {
        Ok(Response::new(op_response(
            self.manager.reload_config().await,
        )))
    }

    async fn get_status(
        &self,
        _request: Request<GetStatusRequest>,
    ) -> std::result::Result<Response<GetStatusResponse>, Status> {
        Ok(Response::new(GetStatusResponse {
            running: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
            active_forward_count: self.manager.active_count() as u32,
            total_forward_count: self.manager.total_count().await as u32,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }))
    }

    async fn shutdown(
        &self,
        _request: Request<ShutdownRequest>,
    ) -> std::result::Result<Response<ShutdownResponse>, Status> {
        info!("Shutdown requested over RPC");
        self.shutdown.cancel();
        Ok(Response::new(ShutdownResponse { success: true }))
    }
}

fn success() -> ForwardOpResponse {
    ForwardOpResponse {
        success: true,
        error: String::new(),
    }
}

fn failure(error: String) -> ForwardOpResponse {
    ForwardOpResponse {
        success: false,
        error,
    }
}

fn op_response(result: Result<()>) -> ForwardOpResponse {
    match result {
        Ok(()) => success(),
        Err(e) => failure(e.to_string()),
    }
}

/// Project a live forwarder into its wire status.
fn status_projection(forwarder: &Forwarder) -> ForwardStatus {
    ForwardStatus {
        active: forwarder.is_active(),
        bytes_transferred: forwarder.bytes_transferred(),
        connection_count: forwarder.connection_count() as u32,
        start_time: forwarder
            .started_at()
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
    }
}

/// Convert the flat wire message into the sum-typed definition.
fn spec_to_definition(spec: ForwardSpec) -> Result<ForwardDefinition> {
    match spec.r#type.as_str() {
        "socket" => Ok(ForwardDefinition::Socket(SocketForward {
            name: spec.name,
            group: spec.group,
            local_port: port_field(spec.local_port, "localPort")?,
            enabled: spec.enabled,
            remote_host: spec.remote_host,
            remote_port: port_field(spec.remote_port, "remotePort")?,
        })),
        "kubernetes" => Ok(ForwardDefinition::Kubernetes(KubernetesForward {
            name: spec.name,
            group: spec.group,
            local_port: port_field(spec.local_port, "localPort")?,
            enabled: spec.enabled,
            context: spec.context,
            namespace: spec.namespace,
            service: spec.service,
            service_port: port_field(spec.service_port, "servicePort")?,
        })),
        other => Err(Error::validation(format!(
            "unknown forward type '{}'",
            other
        ))),
    }
}

/// Flatten a definition into the wire message; unused variant fields stay
/// at their defaults.
fn definition_to_spec(def: &ForwardDefinition) -> ForwardSpec {
    let mut spec = ForwardSpec {
        r#type: def.kind().to_string(),
        name: def.name().to_string(),
        group: def.group().to_string(),
        local_port: u32::from(def.local_port()),
        enabled: def.enabled(),
        ..Default::default()
    };
    match def {
        ForwardDefinition::Socket(s) => {
            spec.remote_host = s.remote_host.clone();
            spec.remote_port = u32::from(s.remote_port);
        }
        ForwardDefinition::Kubernetes(k) => {
            spec.context = k.context.clone();
            spec.namespace = k.namespace.clone();
            spec.service = k.service.clone();
            spec.service_port = u32::from(k.service_port);
        }
    }
    spec
}

fn port_field(value: u32, field: &str) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| Error::validation(format!("{} must be between 1 and 65535", field)))
}
