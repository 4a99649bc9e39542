pub mod api;
pub mod error_payload;
pub mod request_meta;
pub mod state;
pub mod telemetry;
