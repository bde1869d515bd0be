//! Server side of the http-public reverse tunnel
//!
//! Clients register a public hostname, then keep a pool of raw tunnel sockets
//! open to the server. Visitor requests for that hostname are forwarded over
//! the pooled sockets to the client's local service.

pub mod agent;
pub mod registry;
pub mod server;

pub use agent::{AgentError, Tunnel, TunnelAgent};
pub use registry::{generate_key, RegisteredTunnel, RegistryError, TunnelRegistry};
pub use server::{ServerConfig, ServerError, ServerHandle, TunnelServer};
