//! Wire protocol for the http-public reverse tunnel
//!
//! This crate defines the constants both sides of a tunnel agree on, hostname
//! normalization, raw HTTP/1.x request-head handling, and the byte relay used
//! once two sockets are spliced together.

pub mod head;
pub mod hostname;
pub mod prebuffered;
pub mod relay;

pub use head::{read_request_head, serialize_request_head, HeadError, RequestHead};
pub use hostname::parse_hostname;
pub use prebuffered::Prebuffered;
pub use relay::splice;

use std::time::Duration;

/// Upgrade token a client uses to supply a tunnel socket
pub const TUNNEL_PROTOCOL: &str = "@http-public/tunnel";

/// Single byte a client sends right after the 101 response
pub const CLIENT_ACK: u8 = 0x00;

/// Default idle window before an agent with no tunnels is expired
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared secret required to register a hostname
pub const TOKEN_HEADER: &str = "x-tunnel-token";

/// Hostname being registered or supplied with tunnels
pub const HOST_HEADER: &str = "x-tunnel-host";

/// Registration key returned on 201 and required on tunnel supply
pub const KEY_HEADER: &str = "x-tunnel-key";

/// Upper bound for a raw request head (request line + headers)
pub const MAX_HEAD_LEN: usize = 16 * 1024;

/// Maximum number of headers parsed from a raw request head
pub const MAX_HEADERS: usize = 100;
