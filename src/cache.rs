//! Local product lookup cache.
//!
//! The whole catalog is stored as one JSON file with a single `savedAt` timestamp. The blob is
//! either fresh or stale as a unit; there is no per-item expiry, eviction, or size bound.
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    error::JobsiteError,
    inventory::{Catalog, InventoryItem},
    properties::DocId,
    store::{Document, DocumentStore, TypedStore},
};

pub const PRODUCT_CACHE_FILE: &str = "product_cache.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheBlob {
    saved_at: i64,
    items: BTreeMap<DocId, InventoryItem>,
}

#[derive(Debug, Clone)]
pub struct ProductCache {
    path: PathBuf,
    ttl: Duration,
    blob: Option<CacheBlob>,
}

impl ProductCache {
    /// Read the cache file. A missing or unreadable file yields an empty cache.
    pub fn open<P: AsRef<Path>>(path: P, ttl: Duration) -> ProductCache {
        let path = path.as_ref().to_path_buf();
        let blob = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<CacheBlob>(&text) {
                Ok(blob) => {
                    tracing::debug!("Loaded {} cached products from {:?}", blob.items.len(), path);
                    Some(blob)
                }
                Err(e) => {
                    tracing::warn!("Ignoring corrupt product cache {:?}: {e}", path);
                    None
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("No product cache at {:?}", path);
                None
            }
            Err(e) => {
                tracing::warn!("Could not read product cache {:?}: {e}", path);
                None
            }
        };
        ProductCache { path, ttl, blob }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn saved_at(&self) -> Option<i64> {
        self.blob.as_ref().map(|b| b.saved_at)
    }

    pub fn len(&self) -> usize {
        self.blob.as_ref().map(|b| b.items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_fresh(&self, now: i64) -> bool {
        match &self.blob {
            Some(blob) => now.saturating_sub(blob.saved_at) < self.ttl.as_millis() as i64,
            None => false,
        }
    }

    /// Cached item regardless of freshness; single lookups tolerate a stale blob.
    pub fn get(&self, id: &DocId) -> Option<&InventoryItem> {
        self.blob.as_ref().and_then(|b| b.items.get(id))
    }

    /// Every cached item, or None when the blob is stale or missing.
    pub fn all(&self, now: i64) -> Option<Vec<InventoryItem>> {
        if !self.is_fresh(now) {
            return None;
        }
        self.blob
            .as_ref()
            .map(|b| b.items.values().cloned().collect())
    }

    pub fn replace_all(&mut self, items: Vec<InventoryItem>, now: i64) -> Result<(), JobsiteError> {
        self.blob = Some(CacheBlob {
            saved_at: now,
            items: items.into_iter().map(|i| (i.id.clone(), i)).collect(),
        });
        self.save()
    }

    /// Insert or replace one item without touching `savedAt`.
    pub fn upsert(&mut self, item: InventoryItem) -> Result<(), JobsiteError> {
        match self.blob.as_mut() {
            Some(blob) => {
                blob.items.insert(item.id.clone(), item);
                self.save()
            }
            // No blob yet: nothing to keep consistent, the next refresh picks the item up.
            None => Ok(()),
        }
    }

    pub fn invalidate(&mut self) -> Result<(), JobsiteError> {
        self.blob = None;
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!("Removed product cache {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self) -> Result<(), JobsiteError> {
        let Some(blob) = self.blob.as_ref() else {
            return Ok(());
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, serde_json::to_string(blob)?)?;
        fs::rename(&tmp, &self.path)?;
        tracing::debug!("Saved {} products to {:?}", blob.items.len(), self.path);
        Ok(())
    }
}

/// Catalog from a fresh cache, otherwise from the `inventory` collection (refreshing the cache).
/// Returns the catalog and whether the store was consulted.
pub async fn load_catalog<S: DocumentStore>(
    store: &S,
    cache: &mut ProductCache,
    now: i64,
) -> Result<(Catalog, bool), JobsiteError> {
    if let Some(items) = cache.all(now) {
        return Ok((Catalog::new(items), false));
    }
    tracing::info!(
        "Product cache is stale, reloading '{}' from the store",
        InventoryItem::COLLECTION
    );
    let items: Vec<InventoryItem> = store.list(Vec::new()).await?;
    if let Err(e) = cache.replace_all(items.clone(), now) {
        tracing::warn!("Could not refresh product cache: {e}");
    }
    Ok((Catalog::new(items), true))
}
