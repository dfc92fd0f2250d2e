//! Credential cache
//!
//! One async mutex per `tenant:service` key inside a sharded map. Callers for
//! the same key serialize on that key's mutex; callers for different keys
//! never contend. Administrative reads use `try_lock` so they never wait on an
//! in-flight assumption.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::model::{CallerIdentity, ScopedCredentials};

/// Cached credentials plus bookkeeping
#[derive(Debug, Clone)]
pub struct CredentialCacheEntry {
    pub credentials: ScopedCredentials,
    pub inserted_at: DateTime<Utc>,
    /// Identity resolved right after assumption, when verification is on
    pub identity: Option<CallerIdentity>,
}

/// Cache entry as reported by `status`
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryStatus {
    pub expiration: DateTime<Utc>,
    pub inserted_at: DateTime<Utc>,
    pub remaining_secs: u64,
    pub role_arn: String,
}

pub(crate) type Slot = Arc<Mutex<Option<CredentialCacheEntry>>>;

/// Per-key locked credential cache
#[derive(Debug, Default)]
pub struct CredentialCache {
    slots: DashMap<String, Slot>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock slot for a key, created on first use
    pub(crate) fn slot(&self, key: &str) -> Slot {
        if let Some(slot) = self.slots.get(key) {
            return slot.clone();
        }
        self.slots.entry(key.to_string()).or_default().clone()
    }

    /// Current entry without waiting. `None` while the key is being refreshed.
    pub fn peek(&self, key: &str) -> Option<CredentialCacheEntry> {
        let slot = self.slots.get(key)?.clone();
        let guard = slot.try_lock().ok()?;
        guard.clone()
    }

    /// Drop the entry if it still holds credentials with `access_key_id`
    pub(crate) fn evict_if(&self, key: &str, access_key_id: &str) -> bool {
        let Some(slot) = self.slots.get(key).map(|s| s.clone()) else {
            return false;
        };
        let Ok(mut guard) = slot.try_lock() else {
            return false;
        };
        match guard.as_ref() {
            Some(entry) if entry.credentials.access_key_id == access_key_id => {
                *guard = None;
                true
            }
            _ => false,
        }
    }

    /// Empty a key's slot. The slot itself stays in the map so callers
    /// already waiting on it keep serializing with new ones. A slot that is
    /// mid-refresh is left to that refresh.
    pub fn remove(&self, key: &str) -> bool {
        let Some(slot) = self.slots.get(key).map(|s| s.clone()) else {
            return false;
        };
        let taken = match slot.try_lock() {
            Ok(mut guard) => guard.take().is_some(),
            Err(_) => false,
        };
        taken
    }

    /// Empty every slot that is not mid-refresh, returning the number of
    /// entries dropped
    pub fn clear(&self) -> usize {
        let slots: Vec<Slot> = self.slots.iter().map(|entry| entry.value().clone()).collect();
        slots
            .iter()
            .filter(|slot| match slot.try_lock() {
                Ok(mut guard) => guard.take().is_some(),
                Err(_) => false,
            })
            .count()
    }

    /// Populated entries for one tenant
    pub fn entries_for_tenant(&self, tenant: &str) -> Vec<CredentialCacheEntry> {
        let prefix = format!("{}:", tenant);
        let slots: Vec<Slot> = self
            .slots
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.value().clone())
            .collect();

        slots
            .iter()
            .filter_map(|slot| slot.try_lock().ok().and_then(|guard| guard.clone()))
            .collect()
    }

    /// Expiry per populated key
    pub fn status(&self, now: DateTime<Utc>) -> BTreeMap<String, CacheEntryStatus> {
        let slots: Vec<(String, Slot)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut status = BTreeMap::new();
        for (key, slot) in slots {
            let Ok(guard) = slot.try_lock() else {
                continue;
            };
            if let Some(entry) = guard.as_ref() {
                status.insert(
                    key,
                    CacheEntryStatus {
                        expiration: entry.credentials.expiration,
                        inserted_at: entry.inserted_at,
                        remaining_secs: entry.credentials.remaining_at(now).as_secs(),
                        role_arn: entry.credentials.role_arn.clone(),
                    },
                );
            }
        }
        status
    }

    /// Number of populated entries not currently being refreshed
    pub fn len(&self) -> usize {
        let slots: Vec<Slot> = self.slots.iter().map(|entry| entry.value().clone()).collect();
        slots
            .iter()
            .filter(|slot| slot.try_lock().map(|guard| guard.is_some()).unwrap_or(false))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
