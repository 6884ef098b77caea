//! Canopy transport gateway.
//!
//! One listener fronts a chat backend. Requests are routed by path prefix
//! to one of three protocol classes:
//!
//! - `upgrade`: the socket is spliced frame by frame to an upstream socket
//!   ([`socket_relay`]).
//! - `streaming_post`: the POST is forwarded and the chunked event-stream
//!   answer is relayed back as it arrives ([`stream_relay`]).
//! - `passthrough`: plain request/response forwarding ([`rest`]).
//!
//! Anything else goes to an injectable presentation router.

pub mod error;
pub mod rest;
pub mod route;
pub mod server;
pub mod session;
pub mod socket_relay;
pub mod stream_relay;
pub mod upload;

pub use error::{ErrorResponse, GatewayError, Result};
pub use route::{ProxyRoute, RouteMatch, RouteTable, UpstreamTarget};
pub use server::{Gateway, GatewayState};
pub use session::{SessionGuard, SessionInfo, SessionRegistry, SessionState};
pub use stream_relay::RelayBody;
