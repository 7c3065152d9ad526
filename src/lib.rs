//! KubePortal - local daemon multiplexing developer port forwards
//!
//! KubePortal accepts TCP connections on loopback ports and relays them to
//! either a raw remote socket or a pod behind a Kubernetes Service, selected
//! through the cluster API server's port-forward subresource. Forwards are
//! persistent configuration, grouped for bulk operations, and controlled at
//! runtime over a loopback gRPC surface.
//!
//! # Architecture
//!
//! The daemon is built from four cooperating pieces:
//! - The [`manager`] owns the registry of forward definitions, persists it
//!   to the config file, and reconciles running forwarders against it.
//! - Each active definition is reified by a [`forward::Forwarder`] that owns
//!   a listener, its accept loop, and the per-connection byte pumps.
//! - Kubernetes forwards resolve pods through the shared [`cache`], which
//!   pools API clients per kubeconfig context and keeps TTL-bounded pod
//!   snapshots.
//! - The [`rpc`] service is a thin adapter translating wire messages into
//!   manager operations.
//!
//! # Modules
//!
//! - [`cache`] - pooled Kubernetes clients and pod-list snapshots
//! - [`config`] - config file location, schema, load/save
//! - [`error`] - error types for the daemon
//! - [`forward`] - forward definitions and their runtime forwarders
//! - [`manager`] - registry, persistence, lifecycle, hot reload
//! - [`proto`] - generated gRPC protocol definitions
//! - [`rpc`] - the gRPC control surface

#![deny(missing_docs)]

pub mod cache;
pub mod config;
pub mod error;
pub mod forward;
pub mod manager;
pub mod proto;
pub mod rpc;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default port for the daemon's loopback gRPC server
pub const DEFAULT_GRPC_PORT: u16 = 50051;
