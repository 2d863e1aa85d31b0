use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::cache::{Cache, CacheKey};
use crate::error::StoreError;
use crate::resolver::EffectivePermissions;
use crate::types::{OrganizationId, PrincipalId};

/// In-memory cache for resolved permissions.
///
/// Entries live in a sharded [`DashMap`], so lookups for different keys do
/// not contend on one lock. Capacity is a soft bound: on overflow, expired
/// entries are pruned first, then the oldest entry is evicted.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    entries: Arc<DashMap<CacheKey, CacheEntry>>,
    capacity: usize,
    ttl: Option<Duration>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Arc<EffectivePermissions>,
    stored_at: Instant,
}

impl MemoryCache {
    /// Creates a new cache with the given capacity.
    ///
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            capacity,
            ttl: None,
        }
    }

    /// Configures a time-to-live for cache entries.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_expired(entry: &CacheEntry, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(entry.stored_at) > ttl
    }

    fn evict_if_needed(&self, now: Instant) {
        if self.entries.len() <= self.capacity {
            return;
        }
        if let Some(ttl) = self.ttl {
            self.entries
                .retain(|_, entry| !Self::is_expired(entry, ttl, now));
        }
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().stored_at)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(
        &self,
        key: &CacheKey,
    ) -> std::result::Result<Option<Arc<EffectivePermissions>>, StoreError> {
        if self.capacity == 0 {
            return Ok(None);
        }
        if let Some(ttl) = self.ttl {
            let now = Instant::now();
            self.entries
                .remove_if(key, |_, entry| Self::is_expired(entry, ttl, now));
        }
        Ok(self.entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(
        &self,
        key: CacheKey,
        value: Arc<EffectivePermissions>,
    ) -> std::result::Result<(), StoreError> {
        if self.capacity == 0 {
            return Ok(());
        }
        let now = Instant::now();
        self.entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: now,
            },
        );
        self.evict_if_needed(now);
        Ok(())
    }

    async fn invalidate_principal(
        &self,
        principal: &PrincipalId,
    ) -> std::result::Result<(), StoreError> {
        self.entries.retain(|key, _| &key.principal != principal);
        Ok(())
    }

    async fn invalidate_organization(
        &self,
        organization: &OrganizationId,
    ) -> std::result::Result<(), StoreError> {
        self.entries
            .retain(|key, _| key.organization.as_ref() != Some(organization));
        Ok(())
    }

    async fn invalidate_all(&self) -> std::result::Result<(), StoreError> {
        self.entries.clear();
        Ok(())
    }
}
