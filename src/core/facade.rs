//! Operator façade: the surface the HTTP API drives. Translates operator
//! intent (start/stop/release/list) into actor calls and flattens the
//! per-connector bookkeeping into response-shaped views.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::core::registry::Registry;
use crate::core::session::CompletedSession;
use crate::error::AppError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSessionView {
    #[serde(rename = "cpid")]
    pub charge_point_id: String,
    pub connector_id: u32,
    pub transaction_id: i64,
    pub id_tag: String,
    pub meter_start: i64,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedSessionView {
    #[serde(rename = "cpid")]
    pub charge_point_id: String,
    #[serde(flatten)]
    pub session: CompletedSession,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorStatusView {
    #[serde(rename = "cpid")]
    pub charge_point_id: String,
    pub connector_id: u32,
    pub status: String,
}

pub struct OperatorFacade {
    registry: std::sync::Arc<Registry>,
}

impl OperatorFacade {
    pub fn new(registry: std::sync::Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn config(&self) -> &Config {
        self.registry.config()
    }

    pub async fn start(
        &self,
        charge_point_id: &str,
        connector_id: u32,
        id_tag: Option<String>,
    ) -> Result<(), AppError> {
        let actor = self.require(charge_point_id)?;
        let id_tag = id_tag.unwrap_or_else(|| self.config().default_id_tag.clone());
        actor.remote_start(connector_id, &id_tag).await
    }

    /// Stop by `transaction_id` if given, else resolve the active
    /// transaction on `connector_id`.
    pub async fn stop(
        &self,
        charge_point_id: &str,
        transaction_id: Option<i64>,
        connector_id: Option<u32>,
    ) -> Result<i64, AppError> {
        let actor = self.require(charge_point_id)?;

        let transaction_id = match transaction_id {
            Some(id) => id,
            None => {
                let connector_id = connector_id.ok_or(AppError::NoActiveTransaction)?;
                actor
                    .transaction_id_for_connector(connector_id)
                    .await
                    .ok_or(AppError::NoActiveTransaction)?
            }
        };

        actor.remote_stop(transaction_id).await?;
        Ok(transaction_id)
    }

    pub async fn release(&self, charge_point_id: &str, connector_id: u32) -> Result<(), AppError> {
        let actor = self.require(charge_point_id)?;
        actor.release(connector_id).await
    }

    pub async fn list_active(&self) -> Vec<ActiveSessionView> {
        let mut views = Vec::new();
        for (charge_point_id, actor) in self.registry.all() {
            for (connector_id, session) in actor.active_sessions().await {
                views.push(ActiveSessionView {
                    charge_point_id: charge_point_id.clone(),
                    connector_id,
                    transaction_id: session.transaction_id,
                    id_tag: session.id_tag,
                    meter_start: session.meter_start,
                    start_time: session.start_time,
                });
            }
        }
        views
    }

    pub async fn list_completed(&self) -> Vec<CompletedSessionView> {
        let mut views = Vec::new();
        for (charge_point_id, actor) in self.registry.all() {
            for session in actor.completed_sessions().await {
                views.push(CompletedSessionView {
                    charge_point_id: charge_point_id.clone(),
                    session,
                });
            }
        }
        views
    }

    pub async fn list_status(&self) -> Vec<ConnectorStatusView> {
        let mut views = Vec::new();
        for (charge_point_id, actor) in self.registry.all() {
            for (connector_id, status) in actor.connector_statuses().await {
                views.push(ConnectorStatusView {
                    charge_point_id: charge_point_id.clone(),
                    connector_id,
                    status,
                });
            }
        }
        views
    }

    fn require(&self, charge_point_id: &str) -> Result<std::sync::Arc<crate::core::actor::ChargePointActor>, AppError> {
        self.registry
            .get(charge_point_id)
            .ok_or_else(|| AppError::NotConnected(charge_point_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::OcppFrame;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn start_on_unknown_charge_point_is_not_connected() {
        let registry = Registry::new(Config::default());
        let facade = OperatorFacade::new(registry);

        let result = facade.start("GHOST", 1, None).await;
        assert!(matches!(result, Err(AppError::NotConnected(_))));
    }

    #[tokio::test]
    async fn stop_with_no_active_transaction_is_no_active_transaction() {
        let registry = Registry::new(Config::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.connect("CP1".to_string(), tx);
        let facade = OperatorFacade::new(registry);

        let result = facade.stop("CP1", None, Some(1)).await;
        assert!(matches!(result, Err(AppError::NoActiveTransaction)));
    }

    #[tokio::test]
    async fn start_uses_default_id_tag_when_none_given() {
        let mut config = Config::default();
        config.default_id_tag = "DEFAULT_TAG".to_string();
        let registry = Registry::new(config);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let actor = registry.connect("CP1".to_string(), tx);
        let facade = OperatorFacade::new(registry);

        let start = tokio::spawn(async move { facade.start("CP1", 1, None).await });

        let sent = rx.recv().await.unwrap();
        let OcppFrame::Call { unique_id, payload, .. } = OcppFrame::parse(&sent).unwrap() else {
            panic!("expected Call");
        };
        assert_eq!(payload["idTag"], "DEFAULT_TAG");

        let reply = OcppFrame::CallResult {
            unique_id,
            payload: serde_json::json!({"status": "Accepted"}),
        };
        actor.handle_text(&reply.serialize()).await;

        start.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn list_active_aggregates_across_charge_points() {
        let registry = Registry::new(Config::default());
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let actor1 = registry.connect("CP1".to_string(), tx1);
        let actor2 = registry.connect("CP2".to_string(), tx2);

        let frame = OcppFrame::Call {
            unique_id: "1".to_string(),
            action: "StartTransaction".to_string(),
            payload: serde_json::json!({
                "connectorId": 1,
                "idTag": "TAG1",
                "meterStart": 0,
                "timestamp": "2026-01-01T00:00:00Z",
            }),
        };
        actor1.handle_text(&frame.serialize()).await;
        actor2.handle_text(&frame.serialize()).await;

        let facade = OperatorFacade::new(registry);
        let active = facade.list_active().await;
        assert_eq!(active.len(), 2);
    }
}
