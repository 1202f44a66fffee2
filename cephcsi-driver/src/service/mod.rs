//! gRPC service implementations bridging the CSI wire surface and the
//! engine.

mod controller;
mod group;
mod identity;
mod node;
mod replication;

pub use controller::ControllerService;
pub use group::GroupService;
pub use identity::IdentityService;
pub use node::NodeService;
pub use replication::ReplicationService;

use chrono::{DateTime, Utc};

/// Convert an engine timestamp into the protobuf well-known type.
pub(crate) fn timestamp(dt: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    }
}
