//! # cephcsi Proto
//!
//! Generated Rust code from the vendored protobuf definitions for the CSI
//! driver.
//!
//! This crate contains the gRPC service definitions and message types for:
//! - The CSI v1 surface (Identity, Controller, GroupController, Node)
//! - The volume-replication extension service

// Include generated code
pub mod generated {
    pub mod csi {
        pub mod v1 {
            include!("generated/csi.v1.rs");
        }
    }
    pub mod replication {
        pub mod v1 {
            include!("generated/replication.v1.rs");
        }
    }
}

// =============================================================================
// CSI v1 re-exports
// =============================================================================

/// CSI message types and service definitions.
pub mod csi {
    pub use crate::generated::csi::v1::*;
    pub use crate::generated::csi::v1::controller_server::{Controller, ControllerServer};
    pub use crate::generated::csi::v1::group_controller_server::{
        GroupController, GroupControllerServer,
    };
    pub use crate::generated::csi::v1::identity_server::{Identity, IdentityServer};
    pub use crate::generated::csi::v1::node_server::{Node, NodeServer};
}

// =============================================================================
// Replication extension re-exports
// =============================================================================

/// Volume-replication extension types and service definition.
pub mod replication {
    pub use crate::generated::replication::v1::*;
    pub use crate::generated::replication::v1::replication_server::{
        Replication, ReplicationServer,
    };
}
