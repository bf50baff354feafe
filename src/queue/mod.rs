//! Permission request queue: data model, waiters, events, persistence.

pub mod registry;
pub mod types;

pub use registry::{PermissionQueue, DEFAULT_RECENT_LIMIT};
pub use types::{Category, PermissionRequest, QueueEvent, RequestStatus, ResolvedBy};
