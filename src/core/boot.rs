//! Boot configurator: after `BootNotification`, probe the charger's
//! configuration and push the settings the CSMS needs (remote-auth
//! enforcement, QR-code display). Fire-and-forget — failures are logged,
//! never surfaced to the charger or the operator.

use std::sync::Arc;

use serde_json::json;
use tracing::warn;

use super::actor::ChargePointActor;

const AUTHORIZE_REMOTE_TX_KEY: &str = "AuthorizeRemoteTxRequests";
const QR_CODE_KEY: &str = "QRcodeConnectorID1";

pub async fn run(actor: Arc<ChargePointActor>) {
    let known_keys = probe_configuration(&actor).await;

    if known_keys.iter().any(|k| k == AUTHORIZE_REMOTE_TX_KEY) {
        push_configuration(&actor, AUTHORIZE_REMOTE_TX_KEY, "true").await;
    }

    if known_keys.iter().any(|k| k == QR_CODE_KEY) {
        push_configuration(&actor, QR_CODE_KEY, &actor_qr_url(&actor)).await;
    } else {
        push_qr_code_via_data_transfer(&actor).await;
    }
}

async fn probe_configuration(actor: &Arc<ChargePointActor>) -> Vec<String> {
    let result = actor
        .call_with_timeout("GetConfiguration", json!({}), actor.boot_config_timeout())
        .await;

    match result {
        Ok(value) => value
            .get("configurationKey")
            .and_then(|v| v.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| entry.get("key").and_then(|k| k.as_str()))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
        Err(e) => {
            warn!(charge_point_id = %actor.id, error = %e, "GetConfiguration probe failed");
            Vec::new()
        }
    }
}

async fn push_configuration(actor: &Arc<ChargePointActor>, key: &str, value: &str) {
    let result = actor
        .call("ChangeConfiguration", json!({"key": key, "value": value}))
        .await;
    if let Err(e) = result {
        warn!(charge_point_id = %actor.id, key, error = %e, "ChangeConfiguration failed");
    }
}

async fn push_qr_code_via_data_transfer(actor: &Arc<ChargePointActor>) {
    let data = json!({"message_type": "QRCode", "uri": actor_qr_url(actor)}).to_string();
    let result = actor
        .call(
            "DataTransfer",
            json!({
                "vendorId": "com.yourcompany.payment",
                "messageId": "DisplayQRCode",
                "data": data,
            }),
        )
        .await;
    if let Err(e) = result {
        warn!(charge_point_id = %actor.id, error = %e, "QR-code DataTransfer fallback failed");
    }
}

fn actor_qr_url(actor: &ChargePointActor) -> String {
    actor.boot_qr_url().to_string()
}
