//! gRPC protocol definitions for the daemon control surface
//!
//! Contains the generated Protobuf and gRPC code for the loopback control
//! protocol between the daemon and its CLI/IDE clients.
//!
//! The wire definition of a forward is deliberately flat: a `type` tag plus
//! the union of all variant fields. The [`crate::rpc`] adapter converts
//! between this shape and the sum-typed
//! [`ForwardDefinition`](crate::forward::ForwardDefinition).

#![allow(missing_docs)] // Generated code doesn't have docs

/// Generated protobuf and gRPC code for the daemon control protocol
pub mod daemon {
    /// Version 1 of the control protocol
    pub mod v1 {
        tonic::include_proto!("kubeportal.v1");
    }
}

// Re-export commonly used types at the module level for convenience
pub use daemon::v1::*;
