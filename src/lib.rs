#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::unused_async)]

//! # tunld
//!
//! Reverse HTTP tunneling gateway: a public-facing server that accepts HTTP
//! requests on vanity subdomains and multiplexes them over long-lived
//! control channels to remote client agents, which deliver them to a local
//! HTTP server and stream the response back over the same channel.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap CLI, router setup, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! error.rs         — closed error-code taxonomy, JSON error replies
//! protocol.rs      — control-message codec (framed JSON over the channel)
//! ids.rs           — subdomain/request/tunnel identifier generators
//! registry/
//!   mod.rs         — tunnel registry (subdomain / id / channel indices)
//!   tunnel.rs      — Tunnel record and counters
//!   pending.rs     — per-tunnel in-flight request table
//! forward.rs       — request correlator / forwarder (hot path)
//! channel.rs       — control-channel sessions, liveness, dispatch
//! inspector.rs     — bounded traffic capture, filtering, curl synthesis
//! ingress.rs       — host-based dispatch, apex banner
//! state.rs         — shared GatewayState
//! routes/
//!   health.rs      — GET /health
//!   tunnels.rs     — GET /api/tunnels, /api/tunnels/{id}, /api/stats
//!   traffic.rs     — GET /api/traffic…
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod forward;
pub mod ids;
pub mod ingress;
pub mod inspector;
pub mod protocol;
pub mod registry;
pub mod routes;
pub mod state;
pub mod util;

// Re-export key types at crate root for convenience.
pub use channel::{ChannelHandle, ChannelTable};
pub use config::Config;
pub use error::{ErrorCode, GatewayError};
pub use inspector::InspectorStore;
pub use registry::TunnelRegistry;
pub use state::GatewayState;
