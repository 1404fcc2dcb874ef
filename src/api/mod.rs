//! Development relay: signaling WebSocket, capability document and a
//! local sink for segment uploads.

pub mod relay_routes;
pub mod relay_websocket;

pub use relay_routes::{capability_from_env, routes};
pub use relay_websocket::{handle_relay_websocket, RelayHub};
