//! Challenge metadata
//!
//! Challenges are owned by the hosting platform; the manager only reads the
//! fields it needs to start a container.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: u64,
    pub name: String,
    pub image: String,
    /// Port exposed inside the container; also the lowest host port handed out
    pub port: u16,
    #[serde(default)]
    pub command: Option<String>,
    /// How players connect, e.g. `tcp`, `ssh`, `web`
    #[serde(rename = "ctype", alias = "connect_type")]
    pub connect_type: String,
    /// Volume mapping as a JSON object string
    #[serde(default)]
    pub volumes: Option<String>,
    /// Name of the endpoint the challenge runs on
    pub server: String,
}

impl Challenge {
    /// The command split into arguments, `None` when the image default applies
    pub fn command_args(&self) -> Option<Vec<String>> {
        self.command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|c| c.split_whitespace().map(String::from).collect())
    }
}

/// Read access to challenge definitions
#[async_trait]
pub trait ChallengeCatalog: Send + Sync {
    async fn challenge(&self, id: u64) -> Result<Option<Challenge>>;
}

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    challenges: RwLock<BTreeMap<u64, Challenge>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_challenges(challenges: impl IntoIterator<Item = Challenge>) -> Self {
        let catalog = Self::new();
        for challenge in challenges {
            catalog.insert(challenge);
        }
        catalog
    }

    /// Load a JSON array of challenges
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let challenges: Vec<Challenge> = serde_json::from_str(&content)?;
        Ok(Self::with_challenges(challenges))
    }

    pub fn insert(&self, challenge: Challenge) {
        self.challenges.write().insert(challenge.id, challenge);
    }
}

#[async_trait]
impl ChallengeCatalog for MemoryCatalog {
    async fn challenge(&self, id: u64) -> Result<Option<Challenge>> {
        Ok(self.challenges.read().get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_challenge() {
        let json = r#"{
            "id": 4,
            "name": "heap-notes",
            "image": "ctf/pwn:1",
            "port": 9000,
            "command": "",
            "ctype": "tcp",
            "server": "main"
        }"#;
        let challenge: Challenge = serde_json::from_str(json).unwrap();
        assert_eq!(challenge.connect_type, "tcp");
        assert_eq!(challenge.command_args(), None);
        assert_eq!(challenge.volumes, None);
    }

    #[test]
    fn test_command_args() {
        let challenge = Challenge {
            id: 1,
            name: "shell".into(),
            image: "ctf/shell".into(),
            port: 22,
            command: Some("/usr/sbin/sshd -D -e".into()),
            connect_type: "ssh".into(),
            volumes: None,
            server: "main".into(),
        };
        assert_eq!(
            challenge.command_args().unwrap(),
            vec!["/usr/sbin/sshd", "-D", "-e"]
        );
    }

    #[tokio::test]
    async fn test_catalog_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("challenges.json");
        fs::write(
            &path,
            r#"[{"id": 1, "name": "a", "image": "i", "port": 80, "connect_type": "web", "server": "main"}]"#,
        )
        .unwrap();

        let catalog = MemoryCatalog::from_file(&path).unwrap();
        assert_eq!(catalog.challenge(1).await.unwrap().unwrap().connect_type, "web");
        assert!(catalog.challenge(2).await.unwrap().is_none());
    }
}
