//! CSI over QUIC.
//!
//! [`server::CsiServer`] answers one [`CsiMessage`](crate::CsiMessage) per
//! bi-stream on behalf of a backend; [`client::ArStorClient`] is the typed
//! caller used by tooling and tests.

pub mod client;
pub mod server;
