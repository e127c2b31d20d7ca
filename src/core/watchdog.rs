//! No-session watchdog: unlocks a connector that reports `Preparing` or
//! `Occupied` but never gets a `StartTransaction` within the configured
//! window.

use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::info;

use super::actor::ChargePointActor;

/// Arm a watchdog for `connector_id`. The caller is responsible for storing
/// the returned handle so it can be cancelled if a session starts first.
pub fn spawn(actor: Arc<ChargePointActor>, connector_id: u32) -> JoinHandle<()> {
    let duration = actor.watchdog_duration();
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        fire(actor, connector_id).await;
    })
}

async fn fire(actor: Arc<ChargePointActor>, connector_id: u32) {
    if actor.is_busy(connector_id).await {
        return;
    }
    info!(
        charge_point_id = %actor.id,
        connector_id,
        "no-session watchdog expired, unlocking connector"
    );
    actor.clear_pending(connector_id).await;
    let _ = actor
        .call_with_timeout(
            "UnlockConnector",
            json!({"connectorId": connector_id}),
            actor.call_timeout(),
        )
        .await;
}
