//! Shared per-identity cache of last-known domain values.
//!
//! One entry per `(domain, fingerprint)`. Entries are immutable `Arc`s that
//! are swapped wholesale, so a reader holds either the old entry or the new
//! one and never a mix. Every entry records the cache version it was written
//! under; a mismatch with the running version drops it on read and on load.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::bus::{BusEvent, EventBus};
use crate::error::{DomainError, SyncError};
use crate::types::{Domain, DomainPayload, FetchKey, IdentityFingerprint, RunId};
use crate::util;

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "body", rename_all = "camelCase")]
pub enum EntryOutcome {
    Value(DomainPayload),
    Error(DomainError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    outcome: EntryOutcome,
    pub fetched_at: DateTime<Utc>,
    pub invalidation_version: String,
    /// False for an optimistic local write awaiting the server's answer.
    pub confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
}

impl CacheEntry {
    pub fn success(payload: DomainPayload, version: &str, run_id: Option<RunId>) -> Self {
        Self {
            outcome: EntryOutcome::Value(payload),
            fetched_at: Utc::now(),
            invalidation_version: version.to_string(),
            confirmed: true,
            run_id,
        }
    }

    pub fn failure(error: DomainError, version: &str, run_id: Option<RunId>) -> Self {
        Self {
            outcome: EntryOutcome::Error(error),
            fetched_at: Utc::now(),
            invalidation_version: version.to_string(),
            confirmed: true,
            run_id,
        }
    }

    pub fn tentative(payload: DomainPayload, version: &str) -> Self {
        Self {
            outcome: EntryOutcome::Value(payload),
            fetched_at: Utc::now(),
            invalidation_version: version.to_string(),
            confirmed: false,
            run_id: None,
        }
    }

    pub fn value(&self) -> Option<&DomainPayload> {
        match &self.outcome {
            EntryOutcome::Value(payload) => Some(payload),
            EntryOutcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&DomainError> {
        match &self.outcome {
            EntryOutcome::Value(_) => None,
            EntryOutcome::Error(error) => Some(error),
        }
    }

    pub fn outcome(&self) -> &EntryOutcome {
        &self.outcome
    }
}

// ---------------------------------------------------------------------------
// Snapshot view for the deriver
// ---------------------------------------------------------------------------

/// What the deriver can know about one domain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DomainState<'a> {
    /// No entry yet: the fetch is pending or never started.
    Loading,
    Unavailable(&'a DomainError),
    Ready(&'a DomainPayload),
}

/// Point-in-time copy of every entry for one identity.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    entries: HashMap<Domain, Arc<CacheEntry>>,
}

impl CacheSnapshot {
    pub fn from_entries(entries: impl IntoIterator<Item = (Domain, CacheEntry)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(domain, entry)| (domain, Arc::new(entry)))
                .collect(),
        }
    }

    pub fn state(&self, domain: Domain) -> DomainState<'_> {
        match self.entries.get(&domain).map(|e| e.outcome()) {
            None => DomainState::Loading,
            Some(EntryOutcome::Error(error)) => DomainState::Unavailable(error),
            Some(EntryOutcome::Value(payload)) => DomainState::Ready(payload),
        }
    }

    pub fn entry(&self, domain: Domain) -> Option<&Arc<CacheEntry>> {
        self.entries.get(&domain)
    }

    pub fn is_settled(&self, domain: Domain) -> bool {
        self.entries.contains_key(&domain)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Persistence format
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedCache {
    version: String,
    saved_at: DateTime<Utc>,
    entries: Vec<PersistedEntry>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedEntry {
    key: FetchKey,
    entry: CacheEntry,
}

// ---------------------------------------------------------------------------
// Shared cache
// ---------------------------------------------------------------------------

/// Session-scoped cache service. Constructed once and shared by `Arc`.
pub struct SharedCache {
    entries: DashMap<FetchKey, Arc<CacheEntry>>,
    version: String,
    bus: Option<EventBus>,
}

impl SharedCache {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            entries: DashMap::new(),
            version: version.into(),
            bus: None,
        }
    }

    /// Publish `CacheChanged` on every write and removal.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn read(&self, domain: Domain, fingerprint: &IdentityFingerprint) -> Option<Arc<CacheEntry>> {
        let key = FetchKey::new(domain, fingerprint.clone());
        // Clone the Arc out before touching the map again
        let entry = self.entries.get(&key).map(|e| Arc::clone(e.value()))?;
        if entry.invalidation_version != self.version {
            log::info!(
                "Cache: dropping {} written under version {} (current {})",
                key,
                entry.invalidation_version,
                self.version
            );
            self.entries
                .remove_if(&key, |_, e| e.invalidation_version != self.version);
            self.notify(domain, fingerprint);
            return None;
        }
        Some(entry)
    }

    /// Replace the entry for `(domain, fingerprint)` with a fetch outcome.
    pub fn write(
        &self,
        domain: Domain,
        fingerprint: &IdentityFingerprint,
        outcome: Result<DomainPayload, DomainError>,
        run_id: Option<RunId>,
    ) {
        let entry = match outcome {
            Ok(payload) => CacheEntry::success(payload, &self.version, run_id),
            Err(error) => CacheEntry::failure(error, &self.version, run_id),
        };
        self.put(domain, fingerprint, entry);
    }

    /// Optimistic local value, replaced wholesale by the next authoritative write.
    pub fn write_tentative(
        &self,
        domain: Domain,
        fingerprint: &IdentityFingerprint,
        payload: DomainPayload,
    ) {
        let entry = CacheEntry::tentative(payload, &self.version);
        self.put(domain, fingerprint, entry);
    }

    fn put(&self, domain: Domain, fingerprint: &IdentityFingerprint, entry: CacheEntry) {
        let key = FetchKey::new(domain, fingerprint.clone());
        log::debug!(
            "Cache: write {} ({}{})",
            key,
            if entry.error().is_some() { "error" } else { "value" },
            if entry.confirmed { "" } else { ", unconfirmed" }
        );
        self.entries.insert(key, Arc::new(entry));
        self.notify(domain, fingerprint);
    }

    /// Remove one entry so the next read triggers a fetch.
    pub fn invalidate(&self, domain: Domain, fingerprint: &IdentityFingerprint) -> bool {
        let key = FetchKey::new(domain, fingerprint.clone());
        let removed = self.entries.remove(&key).is_some();
        if removed {
            log::debug!("Cache: invalidated {}", key);
            self.notify(domain, fingerprint);
        }
        removed
    }

    /// Remove every entry for an identity. Used when the resolved user changes.
    pub fn invalidate_all(&self, fingerprint: &IdentityFingerprint) -> usize {
        let mut removed = Vec::new();
        self.entries.retain(|key, _| {
            if &key.fingerprint == fingerprint {
                removed.push(key.domain);
                false
            } else {
                true
            }
        });
        for domain in &removed {
            self.notify(*domain, fingerprint);
        }
        if !removed.is_empty() {
            log::info!(
                "Cache: cleared {} entr{} for {}",
                removed.len(),
                if removed.len() == 1 { "y" } else { "ies" },
                fingerprint
            );
        }
        removed.len()
    }

    /// Every current-version entry for one identity.
    pub fn snapshot(&self, fingerprint: &IdentityFingerprint) -> CacheSnapshot {
        let entries = Domain::ALL
            .iter()
            .filter_map(|domain| self.read(*domain, fingerprint).map(|e| (*domain, e)))
            .collect();
        CacheSnapshot { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist confirmed entries so a reload starts warm.
    pub fn save_snapshot(&self, path: &Path) -> Result<usize, SyncError> {
        let mut entries: Vec<PersistedEntry> = self
            .entries
            .iter()
            .filter(|e| e.value().confirmed)
            .map(|e| PersistedEntry {
                key: e.key().clone(),
                entry: CacheEntry::clone(e.value()),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        let count = entries.len();

        let persisted = PersistedCache {
            version: self.version.clone(),
            saved_at: Utc::now(),
            entries,
        };
        util::write_json_atomic(path, &persisted)?;
        log::info!("Cache: saved {} entries to {}", count, path.display());
        Ok(count)
    }

    /// Load a snapshot, skipping entries recorded under another cache version.
    ///
    /// Existing in-memory entries win over persisted ones.
    pub fn load_snapshot(&self, path: &Path) -> Result<usize, SyncError> {
        let persisted: PersistedCache = match util::read_json(path)? {
            Some(p) => p,
            None => return Ok(0),
        };
        if persisted.version != self.version {
            log::info!(
                "Cache: snapshot version {} does not match {}, discarding",
                persisted.version,
                self.version
            );
            return Ok(0);
        }

        let mut loaded = 0;
        for item in persisted.entries {
            if item.entry.invalidation_version != self.version {
                continue;
            }
            if let Some(payload) = item.entry.value() {
                if !payload.fits(item.key.domain) {
                    log::warn!("Cache: snapshot entry {} has wrong payload shape", item.key);
                    continue;
                }
            }
            let domain = item.key.domain;
            let fingerprint = item.key.fingerprint.clone();
            let inserted = match self.entries.entry(item.key) {
                dashmap::mapref::entry::Entry::Occupied(_) => false,
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(Arc::new(item.entry));
                    true
                }
            };
            if inserted {
                loaded += 1;
                self.notify(domain, &fingerprint);
            }
        }
        log::info!("Cache: loaded {} entries from {}", loaded, path.display());
        Ok(loaded)
    }

    fn notify(&self, domain: Domain, fingerprint: &IdentityFingerprint) {
        if let Some(bus) = &self.bus {
            bus.publish(BusEvent::CacheChanged {
                domain,
                fingerprint: fingerprint.clone(),
            });
        }
    }
}
