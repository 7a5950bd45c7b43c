//! Transport layer for the operator API.
//!
//! HTTP via axum. The LDR wire protocol itself lives in `bridge`.

pub mod http;

pub use http::{ServerConfig, serve};
