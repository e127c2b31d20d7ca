//! Outbound call correlation: `call(action, payload)` generates a message
//! id, records an awaiter, writes the `CALL`, and suspends until a matching
//! `CALLRESULT`/`CALLERROR` arrives or a timeout fires.
//!
//! A `DashMap` keyed by message id holds a `oneshot` completion, resolved
//! by the inbound-dispatch side on `CallResult`/`CallError`, or by
//! `tokio::time::timeout` on expiry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::warn;

use crate::error::AppError;
use crate::wire::OcppFrame;

struct PendingCall {
    action: String,
    reply: oneshot::Sender<Result<Value, AppError>>,
}

/// Per-actor outbound-call multiplexer.
///
/// Message ids only need to be unique within one connection's lifetime, so
/// each actor owns its own counter and awaiter table rather than sharing a
/// process-wide one.
pub struct CallMultiplexer {
    writer: mpsc::UnboundedSender<String>,
    pending: DashMap<String, PendingCall>,
    counter: AtomicU64,
}

impl CallMultiplexer {
    pub fn new(writer: mpsc::UnboundedSender<String>) -> Self {
        Self {
            writer,
            pending: DashMap::new(),
            counter: AtomicU64::new(1),
        }
    }

    fn next_message_id(&self) -> String {
        format!("CS-{}", self.counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Issue a `CALL` and await the matching reply, or time out.
    ///
    /// A reply that arrives after the timeout has already fired finds no
    /// awaiter in `pending` and is silently discarded by `resolve`/`fail`.
    pub async fn call(&self, action: &str, payload: Value, deadline: Duration) -> Result<Value, AppError> {
        let message_id = self.next_message_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            message_id.clone(),
            PendingCall {
                action: action.to_string(),
                reply: tx,
            },
        );

        let frame = OcppFrame::Call {
            unique_id: message_id.clone(),
            action: action.to_string(),
            payload,
        };

        if self.writer.send(frame.serialize()).is_err() {
            self.pending.remove(&message_id);
            return Err(AppError::Disconnected);
        }

        match timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                // Sender dropped without a reply — connection tore down.
                self.pending.remove(&message_id);
                Err(AppError::Disconnected)
            }
            Err(_) => {
                self.pending.remove(&message_id);
                warn!(message_id = %message_id, action, "call timed out");
                Err(AppError::CallTimeout)
            }
        }
    }

    /// Resolve the awaiter for an inbound `CALLRESULT`.
    pub fn resolve(&self, unique_id: &str, payload: Value) {
        if let Some((_, pending)) = self.pending.remove(unique_id) {
            let _ = pending.reply.send(Ok(payload));
        } else {
            warn!(message_id = unique_id, "CallResult for unknown/expired request");
        }
    }

    /// Resolve the awaiter for an inbound `CALLERROR`.
    pub fn reject(&self, unique_id: &str, error_code: &str, error_description: &str) {
        if let Some((_, pending)) = self.pending.remove(unique_id) {
            warn!(
                message_id = unique_id,
                action = pending.action.as_str(),
                error_code,
                "CallError received"
            );
            let _ = pending
                .reply
                .send(Err(AppError::RemoteRejected(format!(
                    "{error_code}: {error_description}"
                ))));
        }
    }

    /// Fail every outstanding awaiter with `Disconnected`. Called once on
    /// connection close.
    pub fn fail_all(&self) {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, pending)) = self.pending.remove(&key) {
                let _ = pending.reply.send(Err(AppError::Disconnected));
            }
        }
    }

    /// Send a fire-and-forget frame (a `CALLRESULT`/`CALLERROR` reply to an
    /// inbound `CALL`, or any message with no awaiter).
    pub fn send_raw(&self, text: String) -> Result<(), AppError> {
        self.writer.send(text).map_err(|_| AppError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn call_resolves_on_matching_result() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mux = Arc::new(CallMultiplexer::new(tx));

        let call = {
            let mux = Arc::clone(&mux);
            tokio::spawn(async move { mux.call("Heartbeat", json!({}), Duration::from_secs(5)).await })
        };

        let sent = rx.recv().await.unwrap();
        let frame = OcppFrame::parse(&sent).unwrap();
        let OcppFrame::Call { unique_id, .. } = frame else {
            panic!("expected Call");
        };
        mux.resolve(&unique_id, json!({"currentTime": "now"}));

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["currentTime"], "now");
    }

    #[tokio::test(start_paused = true)]
    async fn call_times_out_when_unanswered() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mux = Arc::new(CallMultiplexer::new(tx));

        let call_mux = Arc::clone(&mux);
        let call = tokio::spawn(async move {
            call_mux.call("Heartbeat", json!({}), Duration::from_secs(5)).await
        });

        // Wait for the outbound frame, which means the timeout is armed.
        let _ = rx.recv().await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;

        let result = call.await.unwrap();
        assert!(matches!(result, Err(AppError::CallTimeout)));
    }

    #[tokio::test]
    async fn reject_surfaces_remote_rejected_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mux = Arc::new(CallMultiplexer::new(tx));

        let call_mux = Arc::clone(&mux);
        let call = tokio::spawn(async move {
            call_mux
                .call("ChangeConfiguration", json!({}), Duration::from_secs(5))
                .await
        });

        let sent = rx.recv().await.unwrap();
        let OcppFrame::Call { unique_id, .. } = OcppFrame::parse(&sent).unwrap() else {
            panic!("expected Call");
        };
        mux.reject(&unique_id, "NotSupported", "unsupported key");

        let result = call.await.unwrap();
        assert!(matches!(result, Err(AppError::RemoteRejected(_))));
    }

    #[tokio::test]
    async fn fail_all_rejects_every_pending_awaiter() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mux = Arc::new(CallMultiplexer::new(tx));

        let first = {
            let mux = Arc::clone(&mux);
            tokio::spawn(async move { mux.call("Heartbeat", json!({}), Duration::from_secs(5)).await })
        };
        let second = {
            let mux = Arc::clone(&mux);
            tokio::spawn(async move { mux.call("Heartbeat", json!({}), Duration::from_secs(5)).await })
        };
        let _ = rx.recv().await.unwrap();
        let _ = rx.recv().await.unwrap();

        mux.fail_all();

        assert!(matches!(first.await.unwrap(), Err(AppError::Disconnected)));
        assert!(matches!(second.await.unwrap(), Err(AppError::Disconnected)));
    }
}
