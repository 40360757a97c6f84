//! HTTP surface of the RPC.
//!
//! One method, `send_email`, exposed as `POST /rpc/send_email` with a JSON
//! body, plus a health check. RPC-level failures (unknown key, corrupted
//! email) are regular `200` replies carrying `{"err": ..}`.

pub mod handlers;

pub use handlers::{app, health, send_email, AppState, HealthResponse};
