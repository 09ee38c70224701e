//! Reconnect-then-fail policy for runtime calls
//!
//! Every call against an endpoint goes through [`guarded`]. A lost
//! connection costs exactly one pool reconnect and fails the call in hand;
//! only the next call benefits from the fresh connection.

use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{BerthError, Result};
use crate::pool::EndpointPool;
use crate::runtime::{ContainerRuntime, FaultKind, RuntimeFault, RuntimeResult};

/// Run `op` against `endpoint`, pinging first.
///
/// A disconnected pool gets one reconnect attempt before the call proceeds
/// or fails with `Connection`. Connectivity faults from the ping or from `op`
/// trigger one reconnect and fail with `ConnectionLost`. Other faults are
/// mapped to their typed error.
pub async fn guarded<T, F, Fut>(pool: &EndpointPool, endpoint: &str, op: F) -> Result<T>
where
    F: FnOnce(Arc<dyn ContainerRuntime>) -> Fut,
    Fut: Future<Output = RuntimeResult<T>>,
{
    let client = match pool.endpoint(endpoint) {
        Ok(e) => e.client(),
        Err(BerthError::Connection { .. }) => {
            info!(endpoint, "pool disconnected, reconnecting");
            if let Err(e) = pool.reconnect().await {
                warn!(endpoint, error = %e, "reconnect failed");
            }
            pool.endpoint(endpoint)
                .map_err(|_| BerthError::connection(endpoint, "Docker is not connected"))?
                .client()
        }
        Err(e) => return Err(e),
    };

    if let Err(fault) = client.ping().await {
        return Err(connection_lost(pool, endpoint, fault).await);
    }

    match op(client).await {
        Ok(value) => Ok(value),
        Err(fault) if fault.is_connectivity() => Err(connection_lost(pool, endpoint, fault).await),
        Err(fault) => Err(fault.into()),
    }
}

async fn connection_lost(pool: &EndpointPool, endpoint: &str, fault: RuntimeFault) -> BerthError {
    warn!(endpoint, error = %fault, "Docker connection lost, reconnecting");
    match pool.reconnect().await {
        Ok(()) => info!(endpoint, "reconnected"),
        Err(e) => warn!(endpoint, error = %e, "reconnect failed"),
    }
    BerthError::ConnectionLost
}

/// Kill a container, treating "already gone" as success.
///
/// A container whose endpoint has been removed from the settings counts
/// as gone too.
pub async fn kill(pool: &EndpointPool, endpoint: &str, runtime_id: &str) -> Result<()> {
    let result = guarded(pool, endpoint, |client| async move {
        match client.kill_container(runtime_id).await {
            Err(fault) if fault.kind == FaultKind::NotFound => Ok(()),
            other => other,
        }
    })
    .await;

    match result {
        Err(BerthError::NotFound(reason)) => {
            warn!(endpoint, id = runtime_id, reason = %reason, "container already gone");
            Ok(())
        }
        other => other,
    }
}

/// Whether the runtime lists `runtime_id` as running
pub async fn is_running(pool: &EndpointPool, endpoint: &str, runtime_id: &str) -> Result<bool> {
    let filter = crate::runtime::ContainerFilter::running(runtime_id);
    guarded(pool, endpoint, |client| async move {
        let ids = client.list_containers(&filter).await?;
        Ok(ids.iter().any(|id| id == runtime_id))
    })
    .await
}
