//! TDM Daemon - node broker for Thymio robots
//!
//! This crate provides the broker core:
//! - `registry` - node registry actor: owns all node state, enforces the
//!   lock discipline, fans out change streams
//! - `server` - TCP and WebSocket listeners plus the per-client endpoint
//! - `backend` - the node backend contract and a simulated backend
//! - `compiler` - the program compiler contract
//! - `token` - access tokens for non-local clients
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐      ┌──────────────────────────────┐
//! │   BrokerServer   │─────▶│      NodeRegistryActor       │
//! │  (TCP + WS)      │      │   (node state owner)         │
//! └────────┬─────────┘      └───────┬──────────────▲───────┘
//!          │ connections            │ NodeEvent    │ BackendEvent
//!          ▼                        ▼              │
//! ┌──────────────────┐      ┌──────────────┐ ┌─────┴────────┐
//! │  ClientEndpoint  │◀─────│  broadcast   │ │ NodeBackend  │
//! │  (per client)    │      │  (fanout)    │ │ (devices)    │
//! └──────────────────┘      └──────────────┘ └──────────────┘
//! ```
//!
//! All production code follows the panic-free policy: no `.unwrap()`,
//! `.expect()`, `panic!()`, `unreachable!()`, `todo!()`.

pub mod backend;
pub mod compiler;
pub mod registry;
pub mod server;
pub mod token;
