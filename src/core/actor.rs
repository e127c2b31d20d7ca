//! The charge-point actor: per-connection state and OCPP 1.6 handlers.
//!
//! All state mutation for one charge point happens under a single
//! `tokio::sync::Mutex`, giving single-threaded-per-connection semantics
//! without a hand-rolled channel-fed event loop: the per-connection read
//! task awaits each handler before reading the next frame, and
//! operator-façade calls from the HTTP side take the same lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::core::boot;
use crate::core::mux::CallMultiplexer;
use crate::core::session::{CompletedSession, PendingStartInfo, Session};
use crate::core::watchdog;
use crate::error::AppError;
use crate::wire::{parse_or_now, OcppFrame};

/// Mutable state owned by one charge point.
#[derive(Default)]
struct ActorState {
    active_tx: HashMap<u32, Session>,
    pending_remote: HashMap<u32, String>,
    pending_start: HashMap<u32, PendingStartInfo>,
    connector_status: HashMap<u32, String>,
    watchdogs: HashMap<u32, JoinHandle<()>>,
    completed: Vec<CompletedSession>,
}

pub struct ChargePointActor {
    pub id: String,
    mux: CallMultiplexer,
    state: Mutex<ActorState>,
    tx_counter: Arc<AtomicI64>,
    call_timeout: Duration,
    watchdog_duration: Duration,
    boot_config_timeout: Duration,
    boot_qr_url: String,
}

impl ChargePointActor {
    pub fn new(
        id: String,
        writer: mpsc::UnboundedSender<String>,
        tx_counter: Arc<AtomicI64>,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            mux: CallMultiplexer::new(writer),
            state: Mutex::new(ActorState::default()),
            tx_counter,
            call_timeout: config.call_timeout,
            watchdog_duration: config.watchdog_duration,
            boot_config_timeout: config.boot_config_timeout,
            boot_qr_url: config.boot_qr_url.clone(),
        })
    }

    pub fn watchdog_duration(&self) -> Duration {
        self.watchdog_duration
    }

    pub fn boot_config_timeout(&self) -> Duration {
        self.boot_config_timeout
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn boot_qr_url(&self) -> &str {
        &self.boot_qr_url
    }

    pub(crate) async fn call(&self, action: &str, payload: Value) -> Result<Value, AppError> {
        self.mux.call(action, payload, self.call_timeout).await
    }

    pub(crate) async fn call_with_timeout(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, AppError> {
        self.mux.call(action, payload, timeout).await
    }

    // ── Inbound dispatch ────────────────────────────────────────────

    /// Handle one raw text frame received from the charger. Replies (for
    /// `CALL`s) or correlates (for `CALLRESULT`/`CALLERROR`) as needed.
    pub async fn handle_text(self: &Arc<Self>, text: &str) {
        match OcppFrame::parse(text) {
            Ok(OcppFrame::Call {
                unique_id,
                action,
                payload,
            }) => {
                info!(charge_point_id = %self.id, action = %action, "received Call");
                let reply = match self.dispatch_call(&action, payload).await {
                    Ok(result) => OcppFrame::CallResult {
                        unique_id,
                        payload: result,
                    },
                    Err((code, description)) => OcppFrame::CallError {
                        unique_id,
                        error_code: code,
                        error_description: description,
                        error_details: json!({}),
                    },
                };
                let _ = self.mux.send_raw(reply.serialize());
            }
            Ok(OcppFrame::CallResult { unique_id, payload }) => {
                self.mux.resolve(&unique_id, payload);
            }
            Ok(OcppFrame::CallError {
                unique_id,
                error_code,
                error_description,
                ..
            }) => {
                self.mux.reject(&unique_id, &error_code, &error_description);
            }
            Err(e) => {
                warn!(charge_point_id = %self.id, error = %e, "malformed frame, dropping");
            }
        }
    }

    async fn dispatch_call(
        self: &Arc<Self>,
        action: &str,
        payload: Value,
    ) -> Result<Value, (String, String)> {
        match action {
            "BootNotification" => {
                let response = self.handle_boot_notification();
                let actor = Arc::clone(self);
                tokio::spawn(async move { boot::run(actor).await });
                Ok(response)
            }
            "Authorize" => Ok(Self::handle_authorize()),
            "Heartbeat" => Ok(Self::handle_heartbeat()),
            "StatusNotification" => Ok(self.handle_status_notification(payload).await),
            "MeterValues" => Ok(self.handle_meter_values(payload)),
            "DataTransfer" => Ok(Self::handle_data_transfer()),
            "StartTransaction" => Ok(self.handle_start_transaction(payload).await),
            "StopTransaction" => Ok(self.handle_stop_transaction(payload).await),
            other => Err((
                "NotImplemented".to_string(),
                format!("Action '{other}' is not supported"),
            )),
        }
    }

    fn handle_boot_notification(&self) -> Value {
        json!({
            "status": "Accepted",
            "currentTime": chrono::Utc::now().to_rfc3339(),
            "interval": 300,
        })
    }

    fn handle_authorize() -> Value {
        json!({"idTagInfo": {"status": "Accepted"}})
    }

    fn handle_heartbeat() -> Value {
        json!({"currentTime": chrono::Utc::now().to_rfc3339()})
    }

    fn handle_meter_values(&self, payload: Value) -> Value {
        info!(charge_point_id = %self.id, meter_values = %payload, "meter values");
        json!({})
    }

    fn handle_data_transfer() -> Value {
        json!({"status": "Accepted"})
    }

    async fn handle_status_notification(self: &Arc<Self>, payload: Value) -> Value {
        let connector_id = connector_id_of(&payload);
        let status = payload
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let mut state = self.state.lock().await;
        state.connector_status.insert(connector_id, status.clone());

        let unattended = matches!(status.as_str(), "Preparing" | "Occupied")
            && !state.active_tx.contains_key(&connector_id);

        if unattended {
            if !state.watchdogs.contains_key(&connector_id) {
                let handle = watchdog::spawn(Arc::clone(self), connector_id);
                state.watchdogs.insert(connector_id, handle);
            }
        } else if let Some(handle) = state.watchdogs.remove(&connector_id) {
            handle.abort();
        }

        json!({})
    }

    async fn handle_start_transaction(self: &Arc<Self>, payload: Value) -> Value {
        let connector_id = connector_id_of(&payload);
        let id_tag = payload
            .get("idTag")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let meter_start = payload.get("meterStart").and_then(|v| v.as_i64()).unwrap_or(0);
        let timestamp = payload.get("timestamp").and_then(|v| v.as_str()).unwrap_or("");
        let start_time = parse_or_now(timestamp);

        let mut state = self.state.lock().await;

        let mismatched_tag = state
            .pending_remote
            .get(&connector_id)
            .is_some_and(|expected| expected != &id_tag);

        if mismatched_tag {
            state.pending_remote.remove(&connector_id);
            state.pending_start.remove(&connector_id);
            drop(state);

            warn!(
                charge_point_id = %self.id,
                connector_id,
                "StartTransaction idTag mismatch against pending remote-start, rejecting"
            );
            let actor = Arc::clone(self);
            tokio::spawn(async move {
                let _ = actor
                    .call("UnlockConnector", json!({"connectorId": connector_id}))
                    .await;
            });
            return json!({"transactionId": 0, "idTagInfo": {"status": "Invalid"}});
        }

        let transaction_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        let pending = state.pending_start.remove(&connector_id);
        state.pending_remote.remove(&connector_id);
        if let Some(handle) = state.watchdogs.remove(&connector_id) {
            handle.abort();
        }
        let vid = pending.and_then(|p| p.vid);
        state.active_tx.insert(
            connector_id,
            Session {
                transaction_id,
                id_tag,
                meter_start,
                start_time,
                vid,
            },
        );
        drop(state);

        info!(charge_point_id = %self.id, connector_id, transaction_id, "transaction started");
        json!({"transactionId": transaction_id, "idTagInfo": {"status": "Accepted"}})
    }

    async fn handle_stop_transaction(&self, payload: Value) -> Value {
        let transaction_id = payload
            .get("transactionId")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let meter_stop = payload.get("meterStop").and_then(|v| v.as_i64()).unwrap_or(0);
        let timestamp = payload.get("timestamp").and_then(|v| v.as_str()).unwrap_or("");
        let stop_time = parse_or_now(timestamp);

        let mut state = self.state.lock().await;
        let matching_connector = state
            .active_tx
            .iter()
            .find(|(_, session)| session.transaction_id == transaction_id)
            .map(|(connector_id, _)| *connector_id);

        if let Some(connector_id) = matching_connector {
            let session = state.active_tx.remove(&connector_id).expect("just found");
            let energy = meter_stop - session.meter_start;
            let duration_secs = (stop_time - session.start_time).num_milliseconds() as f64 / 1000.0;
            state.completed.push(CompletedSession {
                connector_id,
                transaction_id,
                id_tag: session.id_tag,
                meter_start: session.meter_start,
                meter_stop,
                energy,
                start_time: session.start_time,
                stop_time,
                duration_secs,
            });
            info!(charge_point_id = %self.id, connector_id, transaction_id, energy, "transaction stopped");
        } else {
            warn!(
                charge_point_id = %self.id,
                transaction_id,
                "StopTransaction for unknown transaction, acknowledging anyway"
            );
        }

        json!({"idTagInfo": {"status": "Accepted"}})
    }

    // ── Operator-façade surface ─────────────────────────────────────

    pub async fn remote_start(self: &Arc<Self>, connector_id: u32, id_tag: &str) -> Result<(), AppError> {
        {
            let mut state = self.state.lock().await;
            state.pending_start.insert(
                connector_id,
                PendingStartInfo {
                    id_tag: id_tag.to_string(),
                    vid: None,
                },
            );
        }

        let result = self
            .call(
                "RemoteStartTransaction",
                json!({"idTag": id_tag, "connectorId": connector_id}),
            )
            .await;

        match result {
            Ok(value) => {
                let status = value.get("status").and_then(|v| v.as_str()).unwrap_or("");
                if status == "Accepted" {
                    let mut state = self.state.lock().await;
                    state.pending_remote.insert(connector_id, id_tag.to_string());
                    Ok(())
                } else {
                    let mut state = self.state.lock().await;
                    state.pending_start.remove(&connector_id);
                    Err(AppError::RemoteRejected(status.to_string()))
                }
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                state.pending_start.remove(&connector_id);
                Err(e)
            }
        }
    }

    pub async fn remote_stop(&self, transaction_id: i64) -> Result<(), AppError> {
        let result = self
            .call("RemoteStopTransaction", json!({"transactionId": transaction_id}))
            .await?;
        let status = result.get("status").and_then(|v| v.as_str()).unwrap_or("");
        if status == "Accepted" {
            Ok(())
        } else {
            Err(AppError::RemoteRejected(status.to_string()))
        }
    }

    pub async fn release(self: &Arc<Self>, connector_id: u32) -> Result<(), AppError> {
        {
            let mut state = self.state.lock().await;
            if state.active_tx.contains_key(&connector_id) {
                return Err(AppError::Busy);
            }
            if let Some(handle) = state.watchdogs.remove(&connector_id) {
                handle.abort();
            }
            state.pending_remote.remove(&connector_id);
            state.pending_start.remove(&connector_id);
        }
        self.call("UnlockConnector", json!({"connectorId": connector_id}))
            .await?;
        Ok(())
    }

    pub async fn transaction_id_for_connector(&self, connector_id: u32) -> Option<i64> {
        self.state
            .lock()
            .await
            .active_tx
            .get(&connector_id)
            .map(|s| s.transaction_id)
    }

    pub async fn active_sessions(&self) -> Vec<(u32, Session)> {
        self.state
            .lock()
            .await
            .active_tx
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect()
    }

    pub async fn completed_sessions(&self) -> Vec<CompletedSession> {
        self.state.lock().await.completed.clone()
    }

    pub async fn connector_statuses(&self) -> Vec<(u32, String)> {
        self.state
            .lock()
            .await
            .connector_status
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect()
    }

    /// Called once on WebSocket close: cancels every watchdog and fails
    /// every outstanding awaiter with `Disconnected`.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        for (_, handle) in state.watchdogs.drain() {
            handle.abort();
        }
        drop(state);
        self.mux.fail_all();
    }

    /// True if the connector currently has an active transaction.
    pub async fn is_busy(&self, connector_id: u32) -> bool {
        self.state.lock().await.active_tx.contains_key(&connector_id)
    }

    /// Clear any pending remote-start bookkeeping for a connector. Used by
    /// the watchdog when it fires with no session having started.
    pub async fn clear_pending(&self, connector_id: u32) {
        let mut state = self.state.lock().await;
        state.pending_remote.remove(&connector_id);
        state.pending_start.remove(&connector_id);
    }
}

fn connector_id_of(payload: &Value) -> u32 {
    payload
        .get("connectorId")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::OcppFrame;

    fn new_actor() -> (Arc<ChargePointActor>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = ChargePointActor::new(
            "CP-TEST".to_string(),
            tx,
            Arc::new(AtomicI64::new(1)),
            &Config::default(),
        );
        (actor, rx)
    }

    /// Pops the next outbound frame and replies on the actor's behalf, as
    /// if a real charger had answered a CSMS-initiated `CALL`.
    async fn answer_next_call(
        actor: &Arc<ChargePointActor>,
        rx: &mut mpsc::UnboundedReceiver<String>,
        result: Value,
    ) {
        let text = rx.recv().await.expect("expected an outbound call");
        let OcppFrame::Call { unique_id, .. } = OcppFrame::parse(&text).unwrap() else {
            panic!("expected a Call frame");
        };
        let reply = OcppFrame::CallResult {
            unique_id,
            payload: result,
        };
        actor.handle_text(&reply.serialize()).await;
    }

    #[tokio::test]
    async fn boot_notification_is_accepted() {
        let (actor, mut rx) = new_actor();
        let frame = OcppFrame::Call {
            unique_id: "1".to_string(),
            action: "BootNotification".to_string(),
            payload: json!({"chargePointModel": "X", "chargePointVendor": "Y"}),
        };
        actor.handle_text(&frame.serialize()).await;

        let reply = OcppFrame::parse(&rx.recv().await.unwrap()).unwrap();
        match reply {
            OcppFrame::CallResult { payload, .. } => {
                assert_eq!(payload["status"], "Accepted");
            }
            _ => panic!("expected CallResult"),
        }
    }

    #[tokio::test]
    async fn unknown_action_returns_not_implemented_call_error() {
        let (actor, mut rx) = new_actor();
        let frame = OcppFrame::Call {
            unique_id: "1".to_string(),
            action: "FirmwareStatusNotification".to_string(),
            payload: json!({}),
        };
        actor.handle_text(&frame.serialize()).await;

        let reply = OcppFrame::parse(&rx.recv().await.unwrap()).unwrap();
        match reply {
            OcppFrame::CallError { error_code, .. } => assert_eq!(error_code, "NotImplemented"),
            _ => panic!("expected CallError"),
        }
    }

    #[tokio::test]
    async fn start_transaction_without_pending_remote_is_accepted() {
        let (actor, mut rx) = new_actor();
        let frame = OcppFrame::Call {
            unique_id: "1".to_string(),
            action: "StartTransaction".to_string(),
            payload: json!({
                "connectorId": 1,
                "idTag": "WALK_UP_TAG",
                "meterStart": 0,
                "timestamp": "2026-01-01T00:00:00Z",
            }),
        };
        actor.handle_text(&frame.serialize()).await;

        let reply = OcppFrame::parse(&rx.recv().await.unwrap()).unwrap();
        let OcppFrame::CallResult { payload, .. } = reply else {
            panic!("expected CallResult");
        };
        assert_eq!(payload["idTagInfo"]["status"], "Accepted");
        assert!(payload["transactionId"].as_i64().unwrap() > 0);

        let sessions = actor.active_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].0, 1);
    }

    #[tokio::test]
    async fn start_transaction_rejects_mismatched_remote_start_tag() {
        let (actor, mut rx) = new_actor();

        let remote_actor = Arc::clone(&actor);
        let remote_start = tokio::spawn(async move { remote_actor.remote_start(1, "EXPECTED_TAG").await });
        answer_next_call(&actor, &mut rx, json!({"status": "Accepted"})).await;
        remote_start.await.unwrap().unwrap();

        let frame = OcppFrame::Call {
            unique_id: "2".to_string(),
            action: "StartTransaction".to_string(),
            payload: json!({
                "connectorId": 1,
                "idTag": "SOMEONE_ELSES_TAG",
                "meterStart": 0,
                "timestamp": "2026-01-01T00:00:00Z",
            }),
        };
        actor.handle_text(&frame.serialize()).await;

        let reply = OcppFrame::parse(&rx.recv().await.unwrap()).unwrap();
        let OcppFrame::CallResult { payload, .. } = reply else {
            panic!("expected CallResult");
        };
        assert_eq!(payload["idTagInfo"]["status"], "Invalid");
        assert_eq!(payload["transactionId"], 0);
        assert!(actor.active_sessions().await.is_empty());

        // The mismatch also fires a fire-and-forget UnlockConnector.
        let unlock = rx.recv().await.unwrap();
        let OcppFrame::Call { action, payload, .. } = OcppFrame::parse(&unlock).unwrap() else {
            panic!("expected Call");
        };
        assert_eq!(action, "UnlockConnector");
        assert_eq!(payload["connectorId"], 1);
    }

    #[tokio::test]
    async fn stop_transaction_records_completed_session() {
        let (actor, mut rx) = new_actor();
        let start = OcppFrame::Call {
            unique_id: "1".to_string(),
            action: "StartTransaction".to_string(),
            payload: json!({
                "connectorId": 1,
                "idTag": "TAG1",
                "meterStart": 100,
                "timestamp": "2026-01-01T00:00:00Z",
            }),
        };
        actor.handle_text(&start.serialize()).await;
        let reply = OcppFrame::parse(&rx.recv().await.unwrap()).unwrap();
        let OcppFrame::CallResult { payload, .. } = reply else {
            panic!("expected CallResult");
        };
        let transaction_id = payload["transactionId"].as_i64().unwrap();

        let stop = OcppFrame::Call {
            unique_id: "2".to_string(),
            action: "StopTransaction".to_string(),
            payload: json!({
                "transactionId": transaction_id,
                "meterStop": 500,
                "timestamp": "2026-01-01T01:00:00Z",
            }),
        };
        actor.handle_text(&stop.serialize()).await;
        let _ = rx.recv().await.unwrap();

        assert!(actor.active_sessions().await.is_empty());
        let completed = actor.completed_sessions().await;
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].energy, 400);
    }

    #[tokio::test]
    async fn release_rejects_when_connector_busy() {
        let (actor, mut rx) = new_actor();
        let start = OcppFrame::Call {
            unique_id: "1".to_string(),
            action: "StartTransaction".to_string(),
            payload: json!({
                "connectorId": 1,
                "idTag": "TAG1",
                "meterStart": 0,
                "timestamp": "2026-01-01T00:00:00Z",
            }),
        };
        actor.handle_text(&start.serialize()).await;
        let _ = rx.recv().await.unwrap();

        let result = actor.release(1).await;
        assert!(matches!(result, Err(AppError::Busy)));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_unlocks_after_timeout_with_no_session() {
        let (actor, mut rx) = new_actor();
        let status = OcppFrame::Call {
            unique_id: "1".to_string(),
            action: "StatusNotification".to_string(),
            payload: json!({"connectorId": 1, "errorCode": "NoError", "status": "Preparing"}),
        };
        actor.handle_text(&status.serialize()).await;
        let _ = rx.recv().await.unwrap();

        tokio::time::advance(Duration::from_secs(91)).await;

        let unlock = rx.recv().await.unwrap();
        let OcppFrame::Call { action, payload, .. } = OcppFrame::parse(&unlock).unwrap() else {
            panic!("expected Call");
        };
        assert_eq!(action, "UnlockConnector");
        assert_eq!(payload["connectorId"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_is_cancelled_by_start_transaction() {
        let (actor, mut rx) = new_actor();
        let status = OcppFrame::Call {
            unique_id: "1".to_string(),
            action: "StatusNotification".to_string(),
            payload: json!({"connectorId": 1, "errorCode": "NoError", "status": "Preparing"}),
        };
        actor.handle_text(&status.serialize()).await;
        let _ = rx.recv().await.unwrap();

        let start = OcppFrame::Call {
            unique_id: "2".to_string(),
            action: "StartTransaction".to_string(),
            payload: json!({
                "connectorId": 1,
                "idTag": "TAG1",
                "meterStart": 0,
                "timestamp": "2026-01-01T00:00:00Z",
            }),
        };
        actor.handle_text(&start.serialize()).await;
        let _ = rx.recv().await.unwrap();

        tokio::time::advance(Duration::from_secs(91)).await;
        tokio::task::yield_now().await;

        // No UnlockConnector should have been issued: the session started.
        assert!(rx.try_recv().is_err());
    }
}
