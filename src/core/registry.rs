//! The routing table: which hostnames go to which backend.
//!
//! Readers load a snapshot through [`ArcSwap`] and never block. Writers go through
//! [`ServiceRegistry::reconcile`], which is serialized by a mutex, persists the new
//! table first and only then swaps it in.
use std::{
    collections::HashSet,
    sync::{Arc, LazyLock},
};

use arc_swap::ArcSwap;
use regex::Regex;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    config::{HostConflictPolicy, RegistryConfig},
    core::{
        service::{ServiceAddress, ServiceLink, generate_service_id},
        telemetry::TelemetryStore,
    },
    ports::kv_store::{KeyValueStore, StoreError},
};

/// List holding the ids of all links, in registry order.
pub const SERVICE_LINKS_KEY: &str = "ServiceLinks";

// DNS name or IPv4 address, optionally with a port.
static INCOMING_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?)*(:\d{1,5})?$")
        .expect("valid incoming address pattern")
});

/// Key holding one link as JSON.
pub fn service_link_key(id: &str) -> String {
    format!("ServiceLink:{}", id)
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("No service found for {0}")]
    NotFound(String),

    #[error("Incoming address '{address}' is claimed by both '{first}' and '{second}'")]
    HostConflict {
        address: String,
        first: String,
        second: String,
    },

    #[error("Service '{service}' has a malformed incoming address '{address}'")]
    InvalidAddress { service: String, address: String },

    #[error("Registry persistence failed: {0}")]
    Store(#[from] StoreError),
}

pub struct ServiceRegistry {
    links: ArcSwap<Vec<ServiceLink>>,
    store: Arc<dyn KeyValueStore>,
    telemetry: TelemetryStore,
    config: RegistryConfig,
    write_lock: Mutex<()>,
}

impl ServiceRegistry {
    /// An empty registry.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        telemetry: TelemetryStore,
        config: RegistryConfig,
    ) -> Self {
        Self {
            links: ArcSwap::from_pointee(Vec::new()),
            store,
            telemetry,
            config,
            write_lock: Mutex::new(()),
        }
    }

    /// Restore the registry persisted in `store`. Ids without a readable record are
    /// skipped with a warning.
    pub async fn load(
        store: Arc<dyn KeyValueStore>,
        telemetry: TelemetryStore,
        config: RegistryConfig,
    ) -> Result<Self, RegistryError> {
        let ids = store.list_range(SERVICE_LINKS_KEY).await?;
        let mut links = Vec::with_capacity(ids.len());
        for id in ids {
            let key = service_link_key(&id);
            let Some(raw) = store.get(&key).await? else {
                warn!("Service {} is listed but has no record, skipping", id);
                continue;
            };
            match serde_json::from_str::<ServiceLink>(&raw) {
                Ok(mut link) => {
                    link.id = id;
                    links.push(link);
                }
                Err(e) => warn!("Service record {} is unreadable, skipping: {}", key, e),
            }
        }

        if links.is_empty() {
            info!("No persisted services found, starting with an empty registry");
        } else {
            info!("Loaded {} services", links.len());
            for link in &links {
                for incoming in &link.incoming_addresses {
                    info!("  {} → {}", incoming, link.outgoing_address);
                }
            }
        }

        let registry = Self::new(store, telemetry, config);
        registry.links.store(Arc::new(links));
        Ok(registry)
    }

    /// Current routing table
    pub fn snapshot(&self) -> Arc<Vec<ServiceLink>> {
        self.links.load_full()
    }

    pub fn len(&self) -> usize {
        self.links.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First link listing `host` as an incoming address.
    ///
    /// Matching ignores ASCII case; when the full value matches nothing, the value
    /// without its `:port` suffix is tried.
    pub fn resolve_by_incoming_host(&self, host: &str) -> Result<ServiceLink, RegistryError> {
        let links = self.links.load();
        let find = |candidate: &str| links.iter().find(|l| l.answers_for(candidate)).cloned();

        find(host)
            .or_else(|| strip_port(host).and_then(find))
            .ok_or_else(|| RegistryError::NotFound(host.to_string()))
    }

    pub fn resolve_by_id(&self, id: &str) -> Result<ServiceLink, RegistryError> {
        self.links
            .load()
            .iter()
            .find(|l| l.id == id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn resolve_by_outgoing_address(
        &self,
        address: &ServiceAddress,
    ) -> Result<ServiceLink, RegistryError> {
        self.links
            .load()
            .iter()
            .find(|l| &l.outgoing_address == address)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(address.to_string()))
    }

    /// Incoming host first, then id.
    pub fn resolve(&self, host_or_id: &str) -> Result<ServiceLink, RegistryError> {
        self.resolve_by_incoming_host(host_or_id)
            .or_else(|_| self.resolve_by_id(host_or_id))
    }

    /// Make the registry match `desired`, keyed by id.
    ///
    /// Current links missing from `desired` are removed, entries with an unknown or
    /// empty id get a fresh id and are appended, and known ids are updated in place.
    /// Nothing changes in memory unless the new table was persisted.
    pub async fn reconcile(
        &self,
        desired: Vec<ServiceLink>,
    ) -> Result<Vec<ServiceLink>, RegistryError> {
        let _guard = self.write_lock.lock().await;
        let current = self.links.load_full();

        let desired_ids: HashSet<&str> = desired.iter().map(|l| l.id.as_str()).collect();
        let (mut next, removed): (Vec<ServiceLink>, Vec<ServiceLink>) = current
            .iter()
            .cloned()
            .partition(|l| desired_ids.contains(l.id.as_str()));

        for mut wanted in desired {
            wanted.dedup_incoming();
            if let Some(address) = wanted
                .incoming_addresses
                .iter()
                .find(|a| !INCOMING_ADDRESS.is_match(a))
            {
                return Err(RegistryError::InvalidAddress {
                    service: wanted.title.clone(),
                    address: address.clone(),
                });
            }
            let known = next
                .iter()
                .position(|l| !wanted.id.is_empty() && l.id == wanted.id);
            match known {
                Some(index) => {
                    let existing = &mut next[index];
                    existing.title = wanted.title;
                    existing.incoming_addresses = wanted.incoming_addresses;
                    existing.outgoing_address = wanted.outgoing_address;
                }
                None => {
                    wanted.id = self.fresh_id(&current, &next);
                    next.push(wanted);
                }
            }
        }

        if self.config.host_conflicts == HostConflictPolicy::Reject {
            check_conflicts(&next)?;
        }

        self.persist(&next, &removed).await?;
        self.links.store(Arc::new(next.clone()));
        info!(
            "Reconciled service registry: {} services, {} removed",
            next.len(),
            removed.len()
        );

        for link in removed {
            let telemetry = self.telemetry.clone();
            tokio::spawn(async move {
                if let Err(e) = telemetry.purge_current(&link.id).await {
                    warn!(
                        "Failed to purge current analytics of removed service {}: {}",
                        link.id, e
                    );
                }
            });
        }

        Ok(next)
    }

    // Ids are never reused, including ids of links removed in this same pass.
    fn fresh_id(&self, current: &[ServiceLink], next: &[ServiceLink]) -> String {
        loop {
            let id = generate_service_id(self.config.id_length);
            let taken = current.iter().chain(next).any(|l| l.id == id);
            if !taken {
                return id;
            }
        }
    }

    async fn persist(
        &self,
        links: &[ServiceLink],
        removed: &[ServiceLink],
    ) -> Result<(), RegistryError> {
        for link in links {
            let json = serde_json::to_string(link).map_err(|e| StoreError::Corrupt {
                key: service_link_key(&link.id),
                message: e.to_string(),
            })?;
            self.store.set(&service_link_key(&link.id), &json).await?;
        }

        let ids: Vec<String> = links.iter().map(|l| l.id.clone()).collect();
        self.store.list_replace(SERVICE_LINKS_KEY, &ids).await?;

        if !removed.is_empty() {
            let keys: Vec<String> = removed.iter().map(|l| service_link_key(&l.id)).collect();
            self.store.delete(&keys).await?;
        }
        Ok(())
    }
}

fn strip_port(host: &str) -> Option<&str> {
    let (name, port) = host.rsplit_once(':')?;
    (!name.is_empty() && port.bytes().all(|b| b.is_ascii_digit())).then_some(name)
}

fn check_conflicts(links: &[ServiceLink]) -> Result<(), RegistryError> {
    let mut owners: Vec<(String, &str)> = Vec::new();
    for link in links {
        for address in &link.incoming_addresses {
            let lowered = address.to_ascii_lowercase();
            if let Some((_, first)) = owners.iter().find(|(a, _)| *a == lowered) {
                return Err(RegistryError::HostConflict {
                    address: address.clone(),
                    first: first.to_string(),
                    second: link.title.clone(),
                });
            }
            owners.push((lowered, link.title.as_str()));
        }
    }
    Ok(())
}
