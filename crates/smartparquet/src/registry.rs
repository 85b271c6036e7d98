// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Per-URL state shared by readers in one process
//!
//! Readers pointing at the same URL with the same transport settings share
//! one transport (and so one connection pool). Readers of a URL share the
//! decoded footer of each version. Transports are held weakly and leased:
//! the pool is closed once the last reader leasing it closes.

use crate::footer::LoadedFooter;
use crate::Result;
use diagnostics::*;
use rangefs::{RangeTransport, TransportConfig};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, Weak};

static SHARED: LazyLock<Arc<ResourceRegistry>> =
    LazyLock::new(|| Arc::new(ResourceRegistry::new()));

#[derive(Debug)]
struct Lease {
    transport: Weak<RangeTransport>,
    readers: usize,
}

impl Lease {
    fn live(&self) -> Option<Arc<RangeTransport>> {
        self.transport.upgrade().filter(|t| !t.is_closed())
    }
}

#[derive(Debug, Default)]
struct Entry {
    /// One per distinct transport configuration
    leases: Vec<Lease>,
    /// Footer of the most recently seen version
    footer: Option<Arc<LoadedFooter>>,
    /// Use counts of columns compared with `=` or `IN`
    equality_columns: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct ResourceRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ResourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used when a reader is not given one.
    #[must_use]
    pub fn shared() -> Arc<ResourceRegistry> {
        Arc::clone(&SHARED)
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease the live transport for `url` built from an equal `config`,
    /// or a new one. Each lease is given back with [`Self::release`].
    pub fn transport(&self, url: &str, config: &TransportConfig) -> Result<Arc<RangeTransport>> {
        let mut entries = self.entries();
        let entry = entries.entry(url.to_string()).or_default();
        entry.leases.retain(|lease| lease.live().is_some());
        for lease in &mut entry.leases {
            if let Some(existing) = lease.live().filter(|t| t.config() == config) {
                lease.readers += 1;
                return Ok(existing);
            }
        }
        if !entry.leases.is_empty() {
            debug!(
                "opening another transport for {url} with different settings",
                url: url
            );
        }
        let transport = Arc::new(RangeTransport::new(url, config.clone())?);
        entry.leases.push(Lease {
            transport: Arc::downgrade(&transport),
            readers: 1,
        });
        Ok(transport)
    }

    /// Give back a lease taken with [`Self::transport`]. The transport is
    /// closed when no lease on it remains. Returns whether it was closed.
    pub fn release(&self, url: &str, transport: &Arc<RangeTransport>) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(url) else {
            return false;
        };
        let Some(index) = entry
            .leases
            .iter()
            .position(|lease| std::ptr::eq(lease.transport.as_ptr(), Arc::as_ptr(transport)))
        else {
            return false;
        };
        let lease = &mut entry.leases[index];
        lease.readers = lease.readers.saturating_sub(1);
        if lease.readers > 0 {
            return false;
        }
        _ = entry.leases.swap_remove(index);
        transport.close();
        true
    }

    /// Footer for `url` if it was decoded for `validator`.
    #[must_use]
    pub fn footer(&self, url: &str, validator: &str) -> Option<Arc<LoadedFooter>> {
        self.entries()
            .get(url)
            .and_then(|e| e.footer.clone())
            .filter(|f| f.index.validator == validator)
    }

    pub fn store_footer(&self, url: &str, footer: Arc<LoadedFooter>) {
        self.entries().entry(url.to_string()).or_default().footer = Some(footer);
    }

    pub fn forget_footer(&self, url: &str) {
        if let Some(entry) = self.entries().get_mut(url) {
            entry.footer = None;
        }
    }

    pub fn record_equality_columns(&self, url: &str, columns: &[String]) {
        if columns.is_empty() {
            return;
        }
        let mut entries = self.entries();
        let counts = &mut entries.entry(url.to_string()).or_default().equality_columns;
        for column in columns {
            *counts.entry(column.clone()).or_default() += 1;
        }
    }

    #[must_use]
    pub fn equality_columns(&self, url: &str) -> BTreeMap<String, usize> {
        self.entries()
            .get(url)
            .map(|e| e.equality_columns.clone())
            .unwrap_or_default()
    }

    /// Drop everything known about `url`. Readers already holding the
    /// transport keep using it, and their release no longer closes it.
    pub fn remove(&self, url: &str) -> bool {
        self.entries().remove(url).is_some()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    /// URLs with a live transport
    #[must_use]
    pub fn live_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .entries()
            .iter()
            .filter(|(_, e)| e.leases.iter().any(|lease| lease.live().is_some()))
            .map(|(url, _)| url.clone())
            .collect();
        urls.sort();
        urls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "http://127.0.0.1:1/data.parquet";

    #[test]
    fn test_transport_is_shared_while_alive() {
        let registry = ResourceRegistry::new();
        let config = TransportConfig::default();
        let a = registry.transport(URL, &config).unwrap();
        let b = registry.transport(URL, &config).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.live_urls(), vec![URL.to_string()]);

        drop(a);
        drop(b);
        assert!(registry.live_urls().is_empty());
        let c = registry.transport(URL, &config).unwrap();
        assert!(!c.is_closed());
    }

    #[test]
    fn test_closed_transport_is_replaced() {
        let registry = ResourceRegistry::new();
        let config = TransportConfig::default();
        let a = registry.transport(URL, &config).unwrap();
        a.close();
        let b = registry.transport(URL, &config).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!b.is_closed());
    }

    #[test]
    fn test_each_config_gets_its_own_transport() {
        let registry = ResourceRegistry::new();
        let patient = TransportConfig {
            retries: 7,
            ..TransportConfig::default()
        };
        let a = registry.transport(URL, &patient).unwrap();
        let b = registry
            .transport(URL, &TransportConfig::default())
            .unwrap();
        let c = registry.transport(URL, &patient).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(a.config().retries, 7);
        assert_eq!(b.config(), &TransportConfig::default());
    }

    #[test]
    fn test_last_release_closes_the_transport() {
        let registry = ResourceRegistry::new();
        let config = TransportConfig::default();
        let a = registry.transport(URL, &config).unwrap();
        let b = registry.transport(URL, &config).unwrap();

        assert!(!registry.release(URL, &a));
        assert!(!b.is_closed());
        assert_eq!(registry.live_urls(), vec![URL.to_string()]);

        assert!(registry.release(URL, &b));
        assert!(a.is_closed());
        assert!(registry.live_urls().is_empty());
        assert!(!registry.release(URL, &b));

        let c = registry.transport(URL, &config).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(!c.is_closed());
    }

    #[test]
    fn test_release_after_remove_keeps_transport_open() {
        let registry = ResourceRegistry::new();
        let a = registry
            .transport(URL, &TransportConfig::default())
            .unwrap();
        assert!(registry.remove(URL));
        assert!(!registry.release(URL, &a));
        assert!(!a.is_closed());
    }

    #[test]
    fn test_equality_columns_and_remove() {
        let registry = ResourceRegistry::new();
        registry.record_equality_columns(URL, &["key".to_string()]);
        registry.record_equality_columns(URL, &["key".to_string(), "name".to_string()]);
        let counts = registry.equality_columns(URL);
        assert_eq!(counts.get("key"), Some(&2));
        assert_eq!(counts.get("name"), Some(&1));

        assert!(registry.remove(URL));
        assert!(!registry.remove(URL));
        assert!(registry.equality_columns(URL).is_empty());

        registry.record_equality_columns(URL, &["key".to_string()]);
        registry.clear();
        assert!(registry.equality_columns(URL).is_empty());
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let registry = ResourceRegistry::new();
        assert!(registry
            .transport("ftp://host/file", &TransportConfig::default())
            .is_err());
    }
}
