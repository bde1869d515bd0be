//! Hostname registry
//!
//! Maps each public hostname to its [`TunnelAgent`] and the key that proves a
//! client owns the registration.

use crate::agent::TunnelAgent;
use base64::{engine::general_purpose::STANDARD, Engine};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Hostname already registered: {0}")]
    AlreadyRegistered(String),
}

#[derive(Debug, Clone)]
pub struct RegisteredTunnel {
    pub key: String,
    pub agent: TunnelAgent,
}

/// Random registration key: 8 bytes, base64
pub fn generate_key() -> String {
    STANDARD.encode(rand::random::<[u8; 8]>())
}

#[derive(Default)]
pub struct TunnelRegistry {
    entries: DashMap<String, RegisteredTunnel>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hostname` with a fresh key, building its agent with `make`.
    ///
    /// `make` receives the new key and only runs when the hostname is free;
    /// check and insert are atomic.
    pub fn register_with<F>(&self, hostname: &str, make: F) -> Result<RegisteredTunnel, RegistryError>
    where
        F: FnOnce(&str) -> TunnelAgent,
    {
        match self.entries.entry(hostname.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyRegistered(hostname.to_string())),
            Entry::Vacant(slot) => {
                let key = generate_key();
                let agent = make(&key);
                let registered = RegisteredTunnel { key, agent };
                slot.insert(registered.clone());
                info!("Registered hostname {}", hostname);
                Ok(registered)
            }
        }
    }

    pub fn lookup(&self, hostname: &str) -> Option<TunnelAgent> {
        self.entries
            .get(hostname)
            .map(|entry| entry.agent.clone())
    }

    /// The agent for `hostname` if `key` matches its registration.
    ///
    /// An unknown hostname and a wrong key are indistinguishable.
    pub fn authorize(&self, hostname: &str, key: &str) -> Option<TunnelAgent> {
        self.entries
            .get(hostname)
            .filter(|entry| entry.key == key && !entry.agent.is_closed())
            .map(|entry| entry.agent.clone())
    }

    /// Remove `hostname` only while it is still registered under `key`.
    pub fn remove_if_key(&self, hostname: &str, key: &str) -> bool {
        let removed = self
            .entries
            .remove_if(hostname, |_, entry| entry.key == key)
            .is_some();
        if removed {
            info!("Unregistered hostname {}", hostname);
        }
        removed
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.entries.contains_key(hostname)
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Remove and destroy every registered agent
    pub fn destroy_all(&self) {
        for hostname in self.hostnames() {
            if let Some((_, registered)) = self.entries.remove(&hostname) {
                debug!("Destroying agent for {}", hostname);
                registered.agent.destroy();
            }
        }
    }
}
