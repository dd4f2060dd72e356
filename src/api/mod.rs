//! Transports for the bridge.
//!
//! ## Endpoints
//!
//! - `POST /rpc` - JSON-RPC 2.0 (`204 No Content` for notifications)
//! - `GET /health` - Health check
//!
//! The same [`RpcGateway`] backs the `lilith-stdio` binary.

pub mod rpc;
mod routes;

pub use routes::{router, serve, AppState, HealthResponse};
pub use rpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, Method, RpcGateway};
