//! # LILITH bridge
//!
//! Screen vision and input control for automation agents, negotiated
//! against whatever the host can actually do.
//!
//! This library provides:
//! - Startup probing of native capture, input, window and OCR tools
//! - Ordered fallback across backends for every action, with per-attempt
//!   deadlines
//! - Permission and rate gating with an append-only audit trail
//! - A JSON-RPC 2.0 surface over local HTTP and stdio
//!
//! ## Request Flow
//!
//! ```text
//!   JSON-RPC ──► RpcGateway ──► SafetyGovernor ──► BackendRouter
//!                   ▲               (allow/deny)        │
//!                   │                                   ├─► CoordinateMapper
//!                   │                                   ▼
//!               TaskRunner                       scrot / xdotool / ...
//!                                                       │
//!                       AuditLog ◄──────────────────────┘
//! ```
//!
//! ## Modules
//! - `probe`: which backends work on this host
//! - `geometry`: monitor enumeration and coordinate resolution
//! - `router`: backend selection and fallback
//! - `vision`: pixel sampling and UI-element detection on screenshots
//! - `safety`: permissions and rate windows
//! - `api`: JSON-RPC dispatch and HTTP transport
//! - `task`: multi-step automation

pub mod api;
pub mod audit;
pub mod backends;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod geometry;
pub mod probe;
pub mod router;
pub mod safety;
pub mod task;
pub mod types;
pub mod vision;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use coordinator::Bridge;
pub use error::BridgeError;
