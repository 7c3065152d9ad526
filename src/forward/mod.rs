//! Forward definitions and their runtime forwarders
//!
//! A *forward* is persistent configuration: a validated, JSON-serializable
//! description of one loopback-port mapping ([`ForwardDefinition`]). A
//! *forwarder* is the runtime object reifying an active forward: it owns
//! the listening socket, the accept loop, and the per-connection pumps
//! ([`Forwarder`]).
//!
//! The two definition variants differ only in how the remote side of a
//! connection is opened, captured by the [`RemoteConnector`] seam:
//! - [`socket`] dials a raw TCP endpoint per accepted client
//! - [`kubernetes`] resolves a Running pod behind a Service and opens a
//!   port-forward channel through the cluster API server

pub mod definition;
pub mod kubernetes;
pub mod runtime;
pub mod socket;

pub use definition::{ForwardDefinition, KubernetesForward, SocketForward};
pub use kubernetes::KubernetesConnector;
pub use runtime::{Forwarder, RemoteConnector, RemoteReadHalf, RemoteWriteHalf};
pub use socket::SocketConnector;
