//! WebSocket listener for charge-point connections.
//!
//! Subprotocol negotiation via `accept_hdr_async`, charge-point id pulled
//! from the request path, split sender/receiver tasks joined with
//! `tokio::select!`, registry cleanup on close.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::core::Registry;
use super::shutdown::ShutdownSignal;

const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

pub async fn run(
    registry: Arc<Registry>,
    shutdown: ShutdownSignal,
) -> std::io::Result<()> {
    let addr = registry.config().ws_address();
    let listener = TcpListener::bind(&addr).await?;
    info!(address = %addr, "OCPP WebSocket listener started");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => spawn_connection(Arc::clone(&registry), stream, peer),
                    Err(e) => error!(error = %e, "failed to accept connection"),
                }
            }
            _ = shutdown.notified() => {
                info!("WebSocket listener shutting down");
                return Ok(());
            }
        }
    }
}

fn spawn_connection(registry: Arc<Registry>, stream: TcpStream, peer: SocketAddr) {
    tokio::spawn(async move {
        if let Err(e) = handle_connection(registry, stream, peer).await {
            error!(peer = %peer, error = %e, "connection error");
        }
    });
}

/// Path forms accepted: `/ocpp/{charge_point_id}` or `/{charge_point_id}`.
fn extract_charge_point_id(path: &str, peer: SocketAddr) -> String {
    let trimmed = path.trim_start_matches('/');
    if let Some(id) = trimmed.strip_prefix("ocpp/") {
        if !id.is_empty() {
            return id.to_string();
        }
    } else if !trimmed.is_empty() && !trimmed.contains('/') {
        return trimmed.to_string();
    }
    format!("CP_{}", peer.port())
}

async fn handle_connection(
    registry: Arc<Registry>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let mut charge_point_id = String::new();

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, mut response: Response| {
        let path = req.uri().path();
        charge_point_id = extract_charge_point_id(path, peer);

        let requested = req
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if requested.split(',').map(str::trim).any(|p| p == OCPP_SUBPROTOCOL) {
            response
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", OCPP_SUBPROTOCOL.parse().unwrap());
        } else if !requested.is_empty() {
            warn!(peer = %peer, requested, "charger did not offer ocpp1.6 subprotocol, accepting anyway");
        }

        Ok(response)
    })
    .await?;

    info!(charge_point_id = %charge_point_id, peer = %peer, "charge point connected");

    let (mut ws_sink, mut ws_source) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let actor = registry.connect(charge_point_id.clone(), tx);

    let send_id = charge_point_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = ws_sink.send(Message::Text(text)).await {
                error!(charge_point_id = %send_id, error = %e, "send failed");
                break;
            }
        }
    });

    let recv_actor = Arc::clone(&actor);
    let recv_id = charge_point_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_source.next().await {
            match msg {
                Ok(Message::Text(text)) => recv_actor.handle_text(&text).await,
                Ok(Message::Close(frame)) => {
                    info!(charge_point_id = %recv_id, ?frame, "close frame received");
                    break;
                }
                Ok(Message::Binary(data)) => {
                    warn!(charge_point_id = %recv_id, bytes = data.len(), "ignoring binary frame");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(charge_point_id = %recv_id, error = %e, "receive error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    registry.disconnect(&charge_point_id);
    actor.shutdown().await;
    info!(charge_point_id = %charge_point_id, "charge point disconnected");

    Ok(())
}
