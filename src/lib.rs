//! Charging-station management system: OCPP 1.6J over WebSocket plus an
//! operator HTTP API.
//!
//! See `wire` for the transport codec, `core` for the per-charge-point
//! actor and call multiplexing, and `server` for the network edges.

pub mod config;
pub mod core;
pub mod error;
pub mod server;
pub mod wire;

pub use config::Config;
pub use error::AppError;
