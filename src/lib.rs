//! Berth - per-user challenge containers across a pool of Docker endpoints
//!
//! Berth hands each user (or team) a private container for a challenge,
//! spread over several Docker daemons. Containers get a random free host
//! port, a lifetime that can be renewed, and are reaped by a background
//! sweeper once they expire.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use berth::challenge::MemoryCatalog;
//! use berth::runtime::DockerConnector;
//! use berth::settings::MemorySettings;
//! use berth::store::{MemoryStore, SubjectKey};
//! use berth::ContainerManager;
//!
//! # async fn demo() -> berth::Result<()> {
//! let manager = ContainerManager::new(
//!     Arc::new(DockerConnector::default()),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryCatalog::from_file("challenges.json".as_ref())?),
//! )
//! .with_settings_store(Arc::new(MemorySettings::with_entries([
//!     ("docker_servers", r#"{"main": "unix:///var/run/docker.sock"}"#),
//!     ("docker_hostname", "ctf.example.org"),
//!     ("container_expiration", "45"),
//! ])));
//! manager.initialize().await?;
//!
//! let info = manager.request(1, &SubjectKey::user(7)).await?;
//! println!("{}:{} until {}", info.hostname, info.port, info.expires);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod challenge;
pub mod cli;
pub mod clock;
pub mod container;
pub mod error;
pub mod output;
pub mod pool;
pub mod ports;
pub mod retry;
pub mod runtime;
pub mod settings;
pub mod store;
pub mod sweeper;

pub use challenge::{Challenge, ChallengeCatalog};
pub use container::{ConnectionInfo, ContainerManager, RequestStatus};
pub use error::{BerthError, Result};
pub use output::{format_output, OutputFormat};
pub use pool::EndpointPool;
pub use store::{SubjectKey, TrackedContainer};
