//! Container lifecycle: image registry, per-container state, manager
//!
//! The manager owns every running container on the node; handles are
//! shared read-only with the report builder. Image presence goes through
//! the de-duplicated fetch registry.

mod handle;
mod images;
mod manager;

pub use handle::{cpu_usage_from_counters, ContainerHandle, ContainerHandleParams};
pub use images::{ImageManager, ImagePullConfig, ImageState};
pub use manager::{
    overload_factor, ContainerManager, ContainerParams, ContainerSlot, LifecycleConfig,
    LifecycleError,
};
