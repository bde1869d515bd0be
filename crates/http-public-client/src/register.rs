//! Hostname registration with the tunnel server

use crate::connect::{dial, Target};
use crate::{ClientConfig, ClientError};
use bytes::Bytes;
use http::header::HOST;
use http::{Method, Request, StatusCode};
use http_body_util::Empty;
use http_public_proto::{HOST_HEADER, KEY_HEADER, TOKEN_HEADER};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tracing::{debug, info};
use url::Url;

/// A hostname the server has agreed to route to this client
#[derive(Debug, Clone)]
pub struct Registration {
    pub hostname: String,
    /// Secret required to supply tunnels for `hostname`
    pub key: String,
    pub public_url: Url,
}

/// Ask the proxy to register `<subdomain>.<proxy hostname>`.
///
/// Anything but `201 Created` is returned as [`ClientError::Rejected`].
pub async fn register(config: &ClientConfig) -> Result<Registration, ClientError> {
    config.validate()?;
    let hostname = config.public_hostname()?;
    let proxy = Target::from_url(&config.proxy_url)?;

    let stream = dial(&proxy, !config.insecure).await?;
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Registration connection error: {}", e);
        }
    });

    let request = Request::builder()
        .method(Method::GET)
        .uri(config.proxy_url.path())
        .header(HOST, proxy.authority())
        .header(TOKEN_HEADER, &config.token)
        .header(HOST_HEADER, &hostname)
        .body(Empty::<Bytes>::new())?;

    let response = sender.send_request(request).await?;
    if response.status() != StatusCode::CREATED {
        return Err(ClientError::Rejected {
            status: response.status(),
        });
    }

    let key = response
        .headers()
        .get(KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|key| !key.is_empty())
        .ok_or(ClientError::MissingKey)?
        .to_string();

    let public_url = config.public_url()?;
    info!("Registered {} with {}", hostname, config.proxy_url);
    Ok(Registration {
        hostname,
        key,
        public_url,
    })
}
