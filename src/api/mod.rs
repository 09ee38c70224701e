//! JSON operation surface
//!
//! Thin adapters over [`ContainerManager`] that shape every outcome as a
//! `serde_json::Value`. Failures become `{"error": message}` so callers can
//! hand the value straight to a web layer.

use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::debug;

use crate::container::{ConnectionInfo, ContainerManager};
use crate::error::{BerthError, Result};
use crate::store::SubjectKey;

/// `{"error": message}` for any failure
pub fn error_value(err: &BerthError) -> Value {
    json!({ "error": err.to_string() })
}

fn respond(result: Result<Value>) -> Value {
    result.unwrap_or_else(|e| {
        debug!(error = %e, client = e.is_client_error(), "operation failed");
        error_value(&e)
    })
}

fn connection_value(info: &ConnectionInfo) -> Value {
    json!({
        "status": info.status.to_string(),
        "hostname": info.hostname,
        "port": info.port,
        "connect": info.connect,
        "expires": info.expires.timestamp(),
    })
}

pub async fn get_connect_type(manager: &ContainerManager, challenge_id: u64) -> Value {
    respond(
        manager
            .connect_type(challenge_id)
            .await
            .map(|connect| json!({ "status": "Ok", "connect": connect })),
    )
}

pub async fn view_info(manager: &ContainerManager, challenge_id: u64, subject: &SubjectKey) -> Value {
    respond(manager.inspect(challenge_id, subject).await.map(|info| match info {
        Some(info) => connection_value(&info),
        None => json!({ "status": "not started" }),
    }))
}

pub async fn request_container(
    manager: &ContainerManager,
    challenge_id: u64,
    subject: &SubjectKey,
) -> Value {
    respond(
        manager
            .request(challenge_id, subject)
            .await
            .map(|info| connection_value(&info)),
    )
}

pub async fn renew_container(
    manager: &ContainerManager,
    challenge_id: u64,
    subject: &SubjectKey,
) -> Value {
    respond(manager.renew(challenge_id, subject).await.map(|info| {
        json!({
            "success": "Container renewed",
            "expires": info.expires.timestamp(),
            "hostname": info.hostname,
            "port": info.port,
            "connect": info.connect,
        })
    }))
}

pub async fn stop_container(
    manager: &ContainerManager,
    challenge_id: u64,
    subject: &SubjectKey,
) -> Value {
    respond(
        manager
            .stop_for_subject(challenge_id, subject)
            .await
            .map(|()| json!({ "success": "Container stopped" })),
    )
}

pub async fn kill_container(manager: &ContainerManager, runtime_id: &str) -> Value {
    respond(
        manager
            .kill(runtime_id)
            .await
            .map(|()| json!({ "success": "Container killed" })),
    )
}

pub async fn purge_all(manager: &ContainerManager) -> Value {
    respond(
        manager
            .purge_all()
            .await
            .map(|purged| json!({ "success": "All containers purged", "purged": purged })),
    )
}

pub async fn list_images(manager: &ContainerManager) -> Value {
    respond(manager.list_images().await.map(|images| json!({ "images": images })))
}

pub async fn list_running_containers(manager: &ContainerManager) -> Value {
    respond(
        manager
            .list_running_containers()
            .await
            .and_then(|overview| Ok(serde_json::to_value(overview)?)),
    )
}

pub async fn list_running_endpoints(manager: &ContainerManager) -> Value {
    json!({ "endpoints": manager.list_running_endpoints() })
}

pub async fn update_settings(manager: &ContainerManager, blob: &HashMap<String, String>) -> Value {
    respond(
        manager
            .update_settings(blob)
            .await
            .map(|()| json!({ "success": "Settings updated" })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::{Challenge, MemoryCatalog};
    use crate::ports::PortAllocator;
    use crate::runtime::MemoryConnector;
    use crate::settings::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    async fn manager() -> ContainerManager {
        let catalog = MemoryCatalog::with_challenges([Challenge {
            id: 1,
            name: "pwn".into(),
            image: "ctf/pwn:1".into(),
            port: 9000,
            command: None,
            connect_type: "tcp".into(),
            volumes: None,
            server: "main".into(),
        }]);
        let manager = ContainerManager::new(
            Arc::new(MemoryConnector::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(catalog),
        )
        .with_settings_store(Arc::new(MemorySettings::with_entries([
            (DOCKER_SERVERS, r#"{"main": "tcp://host1:2376"}"#),
            (DOCKER_HOSTNAME, "ctf.example.org"),
            (CONTAINER_EXPIRATION, "10"),
            (CONTAINER_MAXMEMORY, "0"),
            (CONTAINER_MAXCPU, "0"),
        ])))
        .with_port_allocator(PortAllocator::with_probe(|_: u16| true));
        manager.initialize().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_request_and_view() {
        let manager = manager().await;
        let subject = SubjectKey::user(7);

        let view = view_info(&manager, 1, &subject).await;
        assert_eq!(view, json!({ "status": "not started" }));

        let created = request_container(&manager, 1, &subject).await;
        assert_eq!(created["status"], "created");
        assert_eq!(created["hostname"], "host1");
        assert_eq!(created["connect"], "tcp");
        assert!(created["expires"].is_i64());

        let view = view_info(&manager, 1, &subject).await;
        assert_eq!(view["status"], "already_running");
        assert_eq!(view["port"], created["port"]);
    }

    #[tokio::test]
    async fn test_errors_become_values() {
        let manager = manager().await;
        let subject = SubjectKey::user(7);

        assert_eq!(
            stop_container(&manager, 1, &subject).await,
            json!({ "error": "No container found" })
        );
        assert_eq!(
            get_connect_type(&manager, 5).await,
            json!({ "error": "Challenge not found" })
        );
        assert!(renew_container(&manager, 1, &subject).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_renew_and_stop() {
        let manager = manager().await;
        let subject = SubjectKey::user(7);
        request_container(&manager, 1, &subject).await;

        let renewed = renew_container(&manager, 1, &subject).await;
        assert_eq!(renewed["success"], "Container renewed");

        let stopped = stop_container(&manager, 1, &subject).await;
        assert_eq!(stopped, json!({ "success": "Container stopped" }));
    }

    #[tokio::test]
    async fn test_admin_surface() {
        let manager = manager().await;
        request_container(&manager, 1, &SubjectKey::user(7)).await;

        let listed = list_running_containers(&manager).await;
        assert_eq!(listed["containers"].as_array().unwrap().len(), 1);
        assert_eq!(listed["connected"], true);

        assert_eq!(list_running_endpoints(&manager).await, json!({ "endpoints": ["main"] }));
        assert_eq!(purge_all(&manager).await["purged"], 1);
        assert!(kill_container(&manager, "nope").await["error"].is_string());
        assert_eq!(get_connect_type(&manager, 1).await, json!({ "status": "Ok", "connect": "tcp" }));
    }

    #[tokio::test]
    async fn test_update_settings_missing_fields() {
        let manager = manager().await;
        let blob = HashMap::from([(DOCKER_HOSTNAME.to_string(), "x".to_string())]);
        let response = update_settings(&manager, &blob).await;
        assert!(response["error"].as_str().unwrap().contains("docker_servers"));
    }
}
