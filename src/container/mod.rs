//! Container lifecycle management
//!
//! Challenge containers are created on demand for a user or team, tracked
//! with an expiry, and killed when they expire or are stopped.

pub(crate) mod locks;
mod manager;
mod types;

pub use manager::{ContainerManager, LABEL_CHALLENGE, LABEL_TEAM, LABEL_USER};
pub use types::{ConnectionInfo, RequestStatus, RunningContainer, RunningOverview};
