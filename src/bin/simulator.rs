//! Companion charge-point simulator: connects to the CSMS as an OCPP 1.6J
//! client and exposes a small local HTTP control surface for plugging,
//! unplugging, and starting/stopping sessions without real hardware.
//!
//! Reuses the crate's own `wire::OcppFrame` and `core::mux::CallMultiplexer`
//! rather than a separate client implementation, so both sides of the
//! connection speak exactly one wire codec.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use ocpp_csms::core::mux::CallMultiplexer;
use ocpp_csms::wire::OcppFrame;

#[derive(Clone)]
struct SimConfig {
    csms_url: String,
    cpid: String,
    connectors: u32,
    meter_start_wh: i64,
    meter_rate_w: i64,
    meter_period: Duration,
    heartbeat_period: Duration,
    http_port: u16,
}

impl SimConfig {
    fn from_env() -> Self {
        Self {
            csms_url: env_or("CSMS_URL", "ws://127.0.0.1:9000/ocpp"),
            cpid: env_or("CPID", "TestCP01"),
            connectors: env_parse_or("CONNECTORS", 1),
            meter_start_wh: env_parse_or("METER_START_WH", 0),
            meter_rate_w: env_parse_or("METER_RATE_W", 7000),
            meter_period: Duration::from_secs(env_parse_or("METER_PERIOD_SEC", 10)),
            heartbeat_period: Duration::from_secs(env_parse_or("SEND_HEARTBEAT_SEC", 60)),
            http_port: env_parse_or("HTTP_PORT", 7071),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone)]
struct ConnectorSim {
    status: &'static str,
    plugged: bool,
    session_active: bool,
    id_tag: Option<String>,
    meter_wh: i64,
    transaction_id: Option<i64>,
}

impl ConnectorSim {
    fn new(meter_start_wh: i64) -> Self {
        Self {
            status: "Available",
            plugged: false,
            session_active: false,
            id_tag: None,
            meter_wh: meter_start_wh,
            transaction_id: None,
        }
    }
}

/// One simulated charge point's live connection: the outbound-call
/// multiplexer plus connector state, mirroring `core::actor::ChargePointActor`
/// on the CSMS side but from the charger's point of view.
struct Simulator {
    cpid: String,
    mux: CallMultiplexer,
    connectors: Mutex<HashMap<u32, ConnectorSim>>,
    config: SimConfig,
}

impl Simulator {
    fn new(config: SimConfig, writer: mpsc::UnboundedSender<String>) -> Arc<Self> {
        let mut connectors = HashMap::new();
        for id in 1..=config.connectors {
            connectors.insert(id, ConnectorSim::new(config.meter_start_wh));
        }
        Arc::new(Self {
            cpid: config.cpid.clone(),
            mux: CallMultiplexer::new(writer),
            connectors: Mutex::new(connectors),
            config,
        })
    }

    async fn send_status(&self, connector_id: u32) {
        let status = {
            let connectors = self.connectors.lock().await;
            connectors.get(&connector_id).map(|c| c.status).unwrap_or("Available")
        };
        let payload = json!({
            "connectorId": connector_id,
            "errorCode": "NoError",
            "status": status,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Err(e) = self.mux.call("StatusNotification", payload, Duration::from_secs(10)).await {
            warn!(cpid = %self.cpid, error = %e, "StatusNotification failed");
        }
    }

    async fn start_session(&self, connector_id: u32, id_tag: String) {
        let meter_start = {
            let mut connectors = self.connectors.lock().await;
            let Some(c) = connectors.get_mut(&connector_id) else { return };
            c.id_tag = Some(id_tag.clone());
            c.session_active = true;
            c.status = "Charging";
            c.meter_wh
        };
        self.send_status(connector_id).await;

        let payload = json!({
            "connectorId": connector_id,
            "idTag": id_tag,
            "meterStart": meter_start,
            "timestamp": Utc::now().to_rfc3339(),
        });
        match self.mux.call("StartTransaction", payload, Duration::from_secs(30)).await {
            Ok(result) => {
                let transaction_id = result.get("transactionId").and_then(|v| v.as_i64()).unwrap_or(0);
                let mut connectors = self.connectors.lock().await;
                if let Some(c) = connectors.get_mut(&connector_id) {
                    c.transaction_id = Some(transaction_id);
                }
                info!(cpid = %self.cpid, connector_id, transaction_id, "transaction started");
            }
            Err(e) => warn!(cpid = %self.cpid, connector_id, error = %e, "StartTransaction failed"),
        }
    }

    async fn stop_session_by_transaction(&self, transaction_id: i64, meter_stop: Option<i64>) {
        let connector_id = {
            let connectors = self.connectors.lock().await;
            connectors
                .iter()
                .find(|(_, c)| c.session_active && c.transaction_id == Some(transaction_id))
                .map(|(id, _)| *id)
        };
        let Some(connector_id) = connector_id else {
            warn!(cpid = %self.cpid, transaction_id, "no active session for this transaction");
            return;
        };

        let meter_stop = match meter_stop {
            Some(value) => value,
            None => self.connectors.lock().await.get(&connector_id).map(|c| c.meter_wh).unwrap_or(0),
        };

        let payload = json!({
            "transactionId": transaction_id,
            "meterStop": meter_stop,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Err(e) = self.mux.call("StopTransaction", payload, Duration::from_secs(30)).await {
            warn!(cpid = %self.cpid, transaction_id, error = %e, "StopTransaction failed");
        }

        {
            let mut connectors = self.connectors.lock().await;
            if let Some(c) = connectors.get_mut(&connector_id) {
                c.session_active = false;
                c.status = "Finishing";
            }
        }
        self.send_status(connector_id).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        {
            let mut connectors = self.connectors.lock().await;
            if let Some(c) = connectors.get_mut(&connector_id) {
                c.status = "Available";
                c.transaction_id = None;
                c.id_tag = None;
            }
        }
        self.send_status(connector_id).await;
    }

    /// Handle a `CALL` from the CSMS: `RemoteStartTransaction`,
    /// `RemoteStopTransaction`, `GetConfiguration`, `ChangeConfiguration`,
    /// `UnlockConnector`, `DataTransfer`.
    async fn dispatch_inbound_call(self: &Arc<Self>, action: &str, payload: Value) -> Value {
        match action {
            "RemoteStartTransaction" => {
                let connector_id = payload.get("connectorId").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
                let id_tag = payload.get("idTag").and_then(|v| v.as_str()).unwrap_or("REMOTE_TAG").to_string();
                let plugged = self.connectors.lock().await.get(&connector_id).map(|c| c.plugged).unwrap_or(false);
                if !plugged {
                    return json!({"status": "Rejected"});
                }
                let sim = Arc::clone(self);
                tokio::spawn(async move { sim.start_session(connector_id, id_tag).await });
                json!({"status": "Accepted"})
            }
            "RemoteStopTransaction" => {
                let transaction_id = payload.get("transactionId").and_then(|v| v.as_i64()).unwrap_or(0);
                let sim = Arc::clone(self);
                tokio::spawn(async move { sim.stop_session_by_transaction(transaction_id, None).await });
                json!({"status": "Accepted"})
            }
            "UnlockConnector" => json!({"status": "Unlocked"}),
            "GetConfiguration" => json!({"configurationKey": [], "unknownKey": []}),
            "ChangeConfiguration" => json!({"status": "Accepted"}),
            "DataTransfer" => json!({"status": "Accepted"}),
            other => {
                warn!(cpid = %self.cpid, action = other, "unsupported incoming action, replying empty");
                json!({})
            }
        }
    }

    async fn handle_text(self: &Arc<Self>, text: &str) {
        match OcppFrame::parse(text) {
            Ok(OcppFrame::Call { unique_id, action, payload }) => {
                let result = self.dispatch_inbound_call(&action, payload).await;
                let frame = OcppFrame::CallResult { unique_id, payload: result };
                let _ = self.mux.send_raw(frame.serialize());
            }
            Ok(OcppFrame::CallResult { unique_id, payload }) => self.mux.resolve(&unique_id, payload),
            Ok(OcppFrame::CallError { unique_id, error_code, error_description, .. }) => {
                self.mux.reject(&unique_id, &error_code, &error_description);
            }
            Err(e) => warn!(cpid = %self.cpid, error = %e, "malformed frame from CSMS"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = SimConfig::from_env();
    let current: Arc<Mutex<Option<Arc<Simulator>>>> = Arc::new(Mutex::new(None));

    let http_current = Arc::clone(&current);
    let http_port = config.http_port;
    tokio::spawn(async move {
        let app = control_router(http_current);
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", http_port)).await.expect("bind control port");
        info!(port = http_port, "simulator control API listening");
        axum::serve(listener, app).await.expect("control API crashed");
    });

    connection_loop(config, current).await;
    Ok(())
}

async fn connection_loop(config: SimConfig, current: Arc<Mutex<Option<Arc<Simulator>>>>) {
    loop {
        let url = format!("{}/{}", config.csms_url, config.cpid);
        info!(url = %url, "connecting to CSMS");
        match connect_and_run(config.clone(), &current).await {
            Ok(()) => info!("connection closed"),
            Err(e) => error!(error = %e, "connection error"),
        }
        *current.lock().await = None;
        info!("reconnecting in 5s");
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

async fn connect_and_run(
    config: SimConfig,
    current: &Arc<Mutex<Option<Arc<Simulator>>>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/{}", config.csms_url, config.cpid);
    let mut request = url.clone().into_client_request()?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", "ocpp1.6".parse().unwrap());

    let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
    let (mut sink, mut source) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let simulator = Simulator::new(config.clone(), tx);
    *current.lock().await = Some(Arc::clone(&simulator));

    let write_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let boot = Arc::clone(&simulator);
    tokio::spawn(async move {
        let _ = boot
            .mux
            .call(
                "BootNotification",
                json!({"chargePointModel": "sim", "chargePointVendor": "ocpp-csms"}),
                Duration::from_secs(10),
            )
            .await;
        for id in 1..=boot.config.connectors {
            boot.send_status(id).await;
        }
    });

    let heartbeat_sim = Arc::clone(&simulator);
    let heartbeat_period = config.heartbeat_period;
    let heartbeat_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(heartbeat_period).await;
            let _ = heartbeat_sim.mux.call("Heartbeat", json!({}), Duration::from_secs(10)).await;
        }
    });

    let meter_sim = Arc::clone(&simulator);
    let meter_period = config.meter_period;
    let meter_rate_w = config.meter_rate_w;
    let meter_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(meter_period).await;
            let added_wh = (meter_rate_w * meter_period.as_secs() as i64) / 3600;
            let ids: Vec<u32> = {
                let mut connectors = meter_sim.connectors.lock().await;
                let mut charging = Vec::new();
                for (id, c) in connectors.iter_mut() {
                    if c.session_active {
                        c.meter_wh += added_wh;
                        charging.push(*id);
                    }
                }
                charging
            };
            for id in ids {
                let meter_wh = meter_sim.connectors.lock().await.get(&id).map(|c| c.meter_wh).unwrap_or(0);
                let payload = json!({
                    "connectorId": id,
                    "meterValue": [{
                        "timestamp": Utc::now().to_rfc3339(),
                        "sampledValue": [{"value": meter_wh.to_string(), "measurand": "Energy.Active.Import.Register"}],
                    }],
                });
                let _ = meter_sim.mux.call("MeterValues", payload, Duration::from_secs(10)).await;
            }
        }
    });

    while let Some(msg) = source.next().await {
        match msg {
            Ok(Message::Text(text)) => simulator.handle_text(&text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "receive error");
                break;
            }
        }
    }

    heartbeat_task.abort();
    meter_task.abort();
    drop(write_task);
    simulator.mux.fail_all();
    Ok(())
}

// ── HTTP control surface ────────────────────────────────────────────

#[derive(Clone)]
struct ControlState {
    current: Arc<Mutex<Option<Arc<Simulator>>>>,
}

fn control_router(current: Arc<Mutex<Option<Arc<Simulator>>>>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/plug/{connector_id}", post(plug))
        .route("/unplug/{connector_id}", post(unplug))
        .route("/local_start/{connector_id}", post(local_start))
        .route("/local_stop/{connector_id}", post(local_stop))
        .with_state(ControlState { current })
}

async fn health() -> impl IntoResponse {
    Json(json!({"ok": true}))
}

#[derive(Debug, Deserialize)]
struct LocalStartQuery {
    #[serde(default = "default_local_tag")]
    id_tag: String,
}

fn default_local_tag() -> String {
    "LOCAL_TAG".to_string()
}

async fn plug(State(state): State<ControlState>, Path(connector_id): Path<u32>) -> impl IntoResponse {
    let Some(sim) = state.current.lock().await.clone() else {
        return Json(json!({"ok": false, "error": "not connected"}));
    };
    {
        let mut connectors = sim.connectors.lock().await;
        if let Some(c) = connectors.get_mut(&connector_id) {
            c.plugged = true;
            c.status = "Preparing";
        }
    }
    sim.send_status(connector_id).await;
    Json(json!({"ok": true, "connector": connector_id, "plugged": true}))
}

async fn unplug(State(state): State<ControlState>, Path(connector_id): Path<u32>) -> impl IntoResponse {
    let Some(sim) = state.current.lock().await.clone() else {
        return Json(json!({"ok": false, "error": "not connected"}));
    };
    {
        let mut connectors = sim.connectors.lock().await;
        if let Some(c) = connectors.get_mut(&connector_id) {
            c.plugged = false;
            c.session_active = false;
            c.status = "Available";
            c.transaction_id = None;
            c.id_tag = None;
        }
    }
    sim.send_status(connector_id).await;
    Json(json!({"ok": true, "connector": connector_id, "plugged": false}))
}

async fn local_start(
    State(state): State<ControlState>,
    Path(connector_id): Path<u32>,
    Query(query): Query<LocalStartQuery>,
) -> impl IntoResponse {
    let Some(sim) = state.current.lock().await.clone() else {
        return Json(json!({"ok": false, "error": "not connected"}));
    };
    let plugged = sim.connectors.lock().await.get(&connector_id).map(|c| c.plugged).unwrap_or(false);
    if !plugged {
        return Json(json!({"ok": false, "error": "not plugged"}));
    }
    sim.start_session(connector_id, query.id_tag).await;
    Json(json!({"ok": true}))
}

async fn local_stop(State(state): State<ControlState>, Path(connector_id): Path<u32>) -> impl IntoResponse {
    let Some(sim) = state.current.lock().await.clone() else {
        return Json(json!({"ok": false, "error": "not connected"}));
    };
    let (active, transaction_id, meter_wh) = {
        let connectors = sim.connectors.lock().await;
        match connectors.get(&connector_id) {
            Some(c) => (c.session_active, c.transaction_id, c.meter_wh),
            None => (false, None, 0),
        }
    };
    if !active {
        return Json(json!({"ok": false, "error": "no active session"}));
    }
    if let Some(transaction_id) = transaction_id {
        sim.stop_session_by_transaction(transaction_id, Some(meter_wh)).await;
    }
    Json(json!({"ok": true}))
}
