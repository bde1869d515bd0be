//! Client side of the http-public reverse tunnel
//!
//! Registers a public hostname with the tunnel server, then keeps a pool of
//! tunnel connections open, each spliced to the local service while a
//! visitor request is in flight.

pub mod cluster;
pub mod config;
pub mod connect;
pub mod register;

pub use cluster::{ClusterEvent, TunnelCluster};
pub use config::ClientConfig;
pub use register::{register, Registration};

use http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Invalid request: {0}")]
    Request(#[from] http::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("proxy server responded with status \"{status}\"")]
    Rejected { status: StatusCode },

    #[error("proxy server did not return a registration key")]
    MissingKey,

    #[error("proxy server refused the tunnel upgrade with status \"{status}\"")]
    UpgradeRefused { status: StatusCode },
}
