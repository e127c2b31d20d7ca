//! Network edges: the OCPP WebSocket listener and the operator HTTP API,
//! plus the graceful-shutdown signal shared between them.

pub mod http;
pub mod shutdown;
pub mod websocket;

pub use shutdown::ShutdownSignal;
