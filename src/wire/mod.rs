//! OCPP 1.6J transport framing.
//!
//! The wire is JSON-over-WebSocket; every text frame carries exactly one
//! `CALL` / `CALLRESULT` / `CALLERROR` array, never fragmented or binary.

pub mod frame;
pub mod timestamp;

pub use frame::{OcppFrame, OcppFrameError};
pub use timestamp::parse_or_now;
