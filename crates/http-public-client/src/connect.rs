//! Dialing the proxy and the local service over TCP or TLS

use crate::ClientError;
use rustls::pki_types::ServerName;
use std::sync::{Arc, Once};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

/// Byte stream returned by [`dial`]
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

pub type BoxedConnection = Box<dyn Connection>;

/// Where to connect, derived from an `http:`/`https:` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Target {
    pub fn from_url(url: &Url) -> Result<Self, ClientError> {
        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(ClientError::InvalidConfig(format!(
                    "url protocols must be \"http\" or \"https\", got \"{}\"",
                    other
                )))
            }
        };
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ClientError::InvalidConfig(format!("url has no host: {}", url)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ClientError::InvalidConfig(format!("url has no port: {}", url)))?;

        Ok(Self { host, port, tls })
    }

    /// Value for a `Host` header: the port is omitted when it is the scheme default
    pub fn authority(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

/// Open a connection to `target`, wrapping it in TLS for `https` targets.
///
/// `verify` controls certificate validation against the webpki roots.
pub async fn dial(target: &Target, verify: bool) -> Result<BoxedConnection, ClientError> {
    let tcp = TcpStream::connect((target.host.as_str(), target.port)).await?;
    tcp.set_nodelay(true)?;

    if !target.tls {
        debug!("Connected to {}:{}", target.host, target.port);
        return Ok(Box::new(tcp));
    }

    let server_name = ServerName::try_from(target.host.clone())
        .map_err(|e| ClientError::Tls(format!("Invalid server name {}: {}", target.host, e)))?;
    let tls = tls_connector(verify)
        .connect(server_name, tcp)
        .await
        .map_err(|e| ClientError::Tls(format!("Handshake with {} failed: {}", target.host, e)))?;

    debug!("TLS connection established to {}:{}", target.host, target.port);
    Ok(Box::new(tls))
}

static CRYPTO_PROVIDER_INIT: Once = Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("Rustls crypto provider already installed");
        }
    });
}

fn tls_connector(verify: bool) -> TlsConnector {
    ensure_crypto_provider();

    let config = if verify {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipVerification))
            .with_no_client_auth()
    };

    TlsConnector::from(Arc::new(config))
}

// Accepts any server certificate (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(url: &str) -> Result<Target, ClientError> {
        Target::from_url(&Url::parse(url).unwrap())
    }

    #[test]
    fn test_default_ports() {
        let http = target("http://tunnel.example.com").unwrap();
        assert_eq!(http.port, 80);
        assert!(!http.tls);
        assert_eq!(http.authority(), "tunnel.example.com");

        let https = target("https://tunnel.example.com/").unwrap();
        assert_eq!(https.port, 443);
        assert!(https.tls);
        assert_eq!(https.authority(), "tunnel.example.com");
    }

    #[test]
    fn test_explicit_port() {
        let t = target("http://localhost:1111").unwrap();
        assert_eq!(t.host, "localhost");
        assert_eq!(t.port, 1111);
        assert_eq!(t.authority(), "localhost:1111");
    }

    #[test]
    fn test_ipv6_host() {
        let t = target("http://[::1]:3000").unwrap();
        assert_eq!(t.host, "::1");
        assert_eq!(t.authority(), "[::1]:3000");
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert!(matches!(
            target("ftp://localhost"),
            Err(ClientError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let t = Target {
            host: "127.0.0.1".to_string(),
            port,
            tls: false,
        };
        assert!(matches!(dial(&t, true).await, Err(ClientError::Io(_))));
    }
}
