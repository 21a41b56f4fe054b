//! JSON-RPC 2.0 over WebSocket hub client

mod client;

pub use client::WsSignalingClient;
