//! LDR wire bridge between the farm and its render clients.
//!
//! # Architecture
//!
//! - **protocol**: Message types and wire constants
//! - **codec**: Binary framing codec for AsyncRead/AsyncWrite
//! - **auth**: HMAC-SHA1 challenge-response
//! - **handshake**: Server and client halves of connection setup

pub mod auth;
pub mod codec;
pub mod handshake;
pub mod protocol;
