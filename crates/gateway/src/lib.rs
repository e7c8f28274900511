//! The broker core: connection lifecycle, channel management, event
//! dispatch, fleet coordination and the signed control API.
//!
//! Lifecycle:
//! 1. Load + validate config (crate `reverb-config`)
//! 2. Build the application registry and shared state
//! 3. Connect the pub/sub provider, attach bus handlers
//! 4. Start the HTTP server with the WebSocket upgrade route
//! 5. Start the ping/prune maintenance timers
//!
//! Channel semantics live in `reverb-channels`; this crate wires them to
//! transports, tenants and the fleet.

pub mod apps;
pub mod bus;
pub mod channel_manager;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod http_api;
pub mod jobs;
pub mod metrics_handler;
pub mod server;
pub mod signature;
pub mod state;
pub mod telemetry;
pub mod ws;
