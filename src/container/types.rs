//! Views returned by the container manager

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a request was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Created,
    AlreadyRunning,
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestStatus::Created => write!(f, "created"),
            RequestStatus::AlreadyRunning => write!(f, "already_running"),
        }
    }
}

/// Where and until when a player can reach their container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub status: RequestStatus,
    pub hostname: String,
    pub port: u16,
    /// Connection hint from the challenge (`tcp`, `ssh`, `web`, ...)
    pub connect: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expires: DateTime<Utc>,
    #[serde(skip)]
    pub runtime_id: String,
}

/// A tracked container as seen by administrators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningContainer {
    pub container_id: String,
    pub image: String,
    pub challenge: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    pub user: String,
    pub endpoint: String,
    pub port: u16,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expires: DateTime<Utc>,
    pub is_running: bool,
}

/// Dashboard view over every tracked container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningOverview {
    pub containers: Vec<RunningContainer>,
    pub connected: bool,
    /// Distinct owners, teams in team mode
    pub teams: Vec<String>,
    pub challenges: Vec<String>,
}
