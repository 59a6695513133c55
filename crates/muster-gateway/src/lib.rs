//! HTTP and WebSocket surface for the orchestration engine.
//!
//! The gateway is a thin adapter: every handler validates its input, calls
//! one engine method, and maps the domain error onto an HTTP status. No
//! orchestration logic lives here.

pub mod router;
pub mod server;

pub use router::ApiError;
pub use server::GatewayServer;
