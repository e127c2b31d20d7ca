//! Process-wide map from charge-point id to its live actor.
//!
//! A single `DashMap` injected into whatever needs to look up a connection,
//! rather than ambient global state. Inserting under an id already present
//! replaces the previous actor — a reconnect from the same charge point
//! wins over its stale predecessor.

use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::Config;
use crate::core::actor::ChargePointActor;

pub struct Registry {
    actors: DashMap<String, Arc<ChargePointActor>>,
    tx_counter: Arc<AtomicI64>,
    config: Config,
}

impl Registry {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            actors: DashMap::new(),
            tx_counter: Arc::new(AtomicI64::new(1)),
            config,
        })
    }

    /// Create and register a new actor for `charge_point_id`, replacing any
    /// existing connection for the same id.
    pub fn connect(
        &self,
        charge_point_id: String,
        writer: mpsc::UnboundedSender<String>,
    ) -> Arc<ChargePointActor> {
        let actor = ChargePointActor::new(
            charge_point_id.clone(),
            writer,
            Arc::clone(&self.tx_counter),
            &self.config,
        );
        if let Some((_, previous)) = self.actors.remove(&charge_point_id) {
            info!(charge_point_id = %charge_point_id, "replacing existing connection");
            let previous = previous;
            tokio::spawn(async move { previous.shutdown().await });
        }
        self.actors.insert(charge_point_id, Arc::clone(&actor));
        actor
    }

    /// Remove `charge_point_id` from the registry. Call on WebSocket close.
    pub fn disconnect(&self, charge_point_id: &str) {
        self.actors.remove(charge_point_id);
    }

    pub fn get(&self, charge_point_id: &str) -> Option<Arc<ChargePointActor>> {
        self.actors.get(charge_point_id).map(|e| Arc::clone(e.value()))
    }

    pub fn connected_ids(&self) -> Vec<String> {
        self.actors.iter().map(|e| e.key().clone()).collect()
    }

    pub fn all(&self) -> Vec<(String, Arc<ChargePointActor>)> {
        self.actors
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
