//! Volume and snapshot lifecycle.

pub mod options;

mod manager;

pub use manager::{
    Backends, ContentSource, CreateSnapshotParams, CreateVolumeParams, CreatedVolume,
    EngineContext, SnapshotInfo, SnapshotManager, VolumeManager,
};
