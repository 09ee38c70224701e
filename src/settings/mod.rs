//! Manager settings
//!
//! Settings arrive as a flat key-value map owned by the storage layer. They
//! are parsed into an immutable [`ManagerSettings`] snapshot which the
//! manager swaps wholesale on every admin update.

mod store;

pub use store::{JsonFileSettings, MemorySettings, SettingsStore};

use std::collections::{BTreeMap, HashMap};

use bytesize::ByteSize;

use crate::error::{BerthError, Result};
use crate::runtime::ResourceLimits;

pub const DOCKER_SERVERS: &str = "docker_servers";
pub const DOCKER_HOSTNAME: &str = "docker_hostname";
pub const CONTAINER_EXPIRATION: &str = "container_expiration";
pub const CONTAINER_MAXMEMORY: &str = "container_maxmemory";
pub const CONTAINER_MAXCPU: &str = "container_maxcpu";
pub const MAX_CONTAINERS_ALLOWED: &str = "max_containers_allowed";
pub const TEAM_MODE: &str = "team_mode";

/// Fields an admin settings update must carry
pub const REQUIRED_FIELDS: [&str; 5] = [
    DOCKER_SERVERS,
    DOCKER_HOSTNAME,
    CONTAINER_EXPIRATION,
    CONTAINER_MAXMEMORY,
    CONTAINER_MAXCPU,
];

pub const DEFAULT_MAX_CONTAINERS: usize = 3;

/// Docker CPU scheduler period in microseconds
const CPU_PERIOD: i64 = 100_000;

/// Parsed snapshot of the key-value settings table
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerSettings {
    /// Endpoint name -> connection URL
    pub servers: BTreeMap<String, String>,
    /// Hostname shown to users when an endpoint has no public host of its own
    pub hostname: String,
    /// Container lifetime in minutes; zero disables automatic expiry
    pub expiration_minutes: u64,
    /// Raw memory cap in MB, validated when a container is created
    pub max_memory: Option<String>,
    /// Raw CPU cap (number of CPUs), validated when a container is created
    pub max_cpu: Option<String>,
    pub max_containers: usize,
    pub team_mode: bool,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            servers: BTreeMap::new(),
            hostname: String::new(),
            expiration_minutes: 0,
            max_memory: None,
            max_cpu: None,
            max_containers: DEFAULT_MAX_CONTAINERS,
            team_mode: false,
        }
    }
}

impl ManagerSettings {
    /// Parse settings from the flat key-value table.
    ///
    /// Only a malformed `docker_servers` map is rejected here. An unparsable
    /// expiration disables expiry, and the resource caps are checked when a
    /// container is actually created.
    pub fn from_map<K, V, I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let raw: BTreeMap<String, String> = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let servers = match raw.get(DOCKER_SERVERS).map(|s| s.trim()) {
            None | Some("") => BTreeMap::new(),
            Some(json) => parse_servers(json)?,
        };

        let expiration_minutes = raw
            .get(CONTAINER_EXPIRATION)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|m| *m > 0)
            .map(|m| m as u64)
            .unwrap_or(0);

        let max_containers = raw
            .get(MAX_CONTAINERS_ALLOWED)
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_CONTAINERS);

        let team_mode = raw
            .get(TEAM_MODE)
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "teams"))
            .unwrap_or(false);

        Ok(Self {
            servers,
            hostname: raw.get(DOCKER_HOSTNAME).cloned().unwrap_or_default(),
            expiration_minutes,
            max_memory: non_empty(raw.get(CONTAINER_MAXMEMORY)),
            max_cpu: non_empty(raw.get(CONTAINER_MAXCPU)),
            max_containers,
            team_mode,
        })
    }

    /// Lifetime granted on creation and on every renewal
    pub fn expiration(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.expiration_minutes as i64)
    }

    pub fn expiry_enabled(&self) -> bool {
        self.expiration_minutes > 0
    }

    /// Whether any endpoint is configured at all
    pub fn is_configured(&self) -> bool {
        !self.servers.is_empty()
    }

    /// Translate the configured caps into runtime resource constraints.
    pub fn resource_limits(&self) -> Result<ResourceLimits> {
        let mut limits = ResourceLimits::default();

        if let Some(memory) = &self.max_memory {
            let mb: i64 = memory.trim().parse().map_err(|_| {
                BerthError::InvalidConfiguration(
                    "Configured container memory limit must be an integer".to_string(),
                )
            })?;
            if mb > 0 {
                limits.memory_bytes = Some(ByteSize::mib(mb as u64).as_u64() as i64);
            }
        }

        if let Some(cpu) = &self.max_cpu {
            let cpus: f64 = cpu.trim().parse().map_err(|_| {
                BerthError::InvalidConfiguration(
                    "Configured container CPU limit must be a number".to_string(),
                )
            })?;
            if cpus > 0.0 {
                limits.cpu_quota = Some((cpus * CPU_PERIOD as f64) as i64);
                limits.cpu_period = Some(CPU_PERIOD);
            }
        }

        Ok(limits)
    }
}

/// Validate an admin settings update and normalize it for storage.
///
/// Every field in [`REQUIRED_FIELDS`] must be present and `docker_servers`
/// must be a JSON object. Extra keys are passed through untouched.
pub fn validate_update(blob: &HashMap<String, String>) -> Result<BTreeMap<String, String>> {
    for field in REQUIRED_FIELDS {
        if !blob.contains_key(field) {
            return Err(BerthError::InvalidConfiguration(format!(
                "{} is required.",
                field
            )));
        }
    }

    let servers = parse_servers(&blob[DOCKER_SERVERS])?;
    for (name, url) in &servers {
        check_endpoint_url(name, url)?;
    }

    let mut normalized: BTreeMap<String, String> = blob
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    normalized.insert(DOCKER_SERVERS.to_string(), serde_json::to_string(&servers)?);
    Ok(normalized)
}

fn parse_servers(json: &str) -> Result<BTreeMap<String, String>> {
    let value: serde_json::Value = serde_json::from_str(json).map_err(|e| {
        BerthError::InvalidConfiguration(format!("Invalid docker_servers JSON: {}", e))
    })?;

    let object = value.as_object().ok_or_else(|| {
        BerthError::InvalidConfiguration(
            "Invalid docker_servers JSON: docker_servers must be a JSON object".to_string(),
        )
    })?;

    object
        .iter()
        .map(|(name, url)| match url.as_str() {
            Some(url) => Ok((name.clone(), url.to_string())),
            None => Err(BerthError::InvalidConfiguration(format!(
                "Invalid docker_servers JSON: URL for '{}' must be a string",
                name
            ))),
        })
        .collect()
}

/// Schemes the Docker adapter can connect to
const ENDPOINT_SCHEMES: [&str; 4] = ["unix://", "tcp://", "http://", "https://"];

fn check_endpoint_url(name: &str, url: &str) -> Result<()> {
    if ENDPOINT_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
        return Ok(());
    }
    Err(BerthError::InvalidConfiguration(format!(
        "Docker endpoint '{}' has an unsupported URL '{}'; use unix://, tcp://, http:// or https://",
        name, url
    )))
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty()).cloned()
}
