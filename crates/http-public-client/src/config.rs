//! Client configuration

use crate::ClientError;
use http_public_proto::parse_hostname;
use url::Url;

pub const DEFAULT_CONNECTIONS: usize = 10;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Public origin of the tunnel server
    pub proxy_url: Url,
    /// Origin of the service being exposed
    pub local_url: Url,
    pub token: String,
    pub subdomain: String,
    /// Tunnel sockets kept open to the server
    pub connections: usize,
    /// Log the request line of every request arriving through a tunnel
    pub log_requests: bool,
    /// Skip certificate validation when the proxy is `https`
    pub insecure: bool,
}

impl ClientConfig {
    pub fn new(
        proxy_url: Url,
        local_url: Url,
        token: impl Into<String>,
        subdomain: impl Into<String>,
    ) -> Self {
        Self {
            proxy_url,
            local_url,
            token: token.into(),
            subdomain: subdomain.into(),
            connections: DEFAULT_CONNECTIONS,
            log_requests: false,
            insecure: false,
        }
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        for url in [&self.proxy_url, &self.local_url] {
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(ClientError::InvalidConfig(
                    "url protocols must be \"http:\" or \"https:\"".to_string(),
                ));
            }
        }
        if self.connections == 0 {
            return Err(ClientError::InvalidConfig(
                "connections must be at least 1".to_string(),
            ));
        }
        if self.subdomain.trim().is_empty() {
            return Err(ClientError::InvalidConfig(
                "subdomain must not be empty".to_string(),
            ));
        }
        self.public_hostname().map(|_| ())
    }

    /// `<subdomain>.<proxy hostname>`, normalized
    pub fn public_hostname(&self) -> Result<String, ClientError> {
        let proxy_host = self
            .proxy_url
            .host_str()
            .ok_or_else(|| ClientError::InvalidConfig("proxy url has no host".to_string()))?;
        let candidate = format!("{}.{}", self.subdomain.trim(), proxy_host);
        parse_hostname(&candidate)
            .ok_or_else(|| ClientError::InvalidConfig(format!("invalid hostname: {}", candidate)))
    }

    /// Proxy origin with the host swapped for the public hostname
    pub fn public_url(&self) -> Result<Url, ClientError> {
        let hostname = self.public_hostname()?;
        let mut url = self.proxy_url.clone();
        url.set_path("/");
        url.set_query(None);
        url.set_fragment(None);
        url.set_host(Some(&hostname))
            .map_err(|e| ClientError::InvalidConfig(format!("invalid hostname {}: {}", hostname, e)))?;
        Ok(url)
    }
}
