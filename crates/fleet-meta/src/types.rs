use std::pin::Pin;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_core::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    /// None for deletions.
    pub value: Option<Vec<u8>>,
    pub revision: u64,
}

pub type WatchStream = Pin<Box<dyn Stream<Item = WatchEvent> + Send>>;

/// Revisioned key/value store backing fleet records.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64>;
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>>;
    async fn delete(&self, key: &str) -> Result<u64>;
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>>;

    /// Write `value` only if the key's mod revision is still `expected_revision`
    /// (0 meaning "absent"). Returns whether it applied and the current revision.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)>;

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision_exclusive: Option<u64>,
    ) -> Result<WatchStream>;
}

const MAX_CAS_ATTEMPTS: usize = 16;

/// JSON helpers over any [`MetaStore`].
#[async_trait]
pub trait MetaStoreExt: MetaStore {
    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<(T, u64)>> {
        match self.get(key).await? {
            Some((bytes, rev)) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("decoding {key}"))?;
                Ok(Some((value, rev)))
            }
            None => Ok(None),
        }
    }

    async fn put_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<u64> {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, bytes).await
    }

    /// Decode every record under `prefix`, skipping entries that fail to parse.
    async fn list_json<T: DeserializeOwned + Send>(&self, prefix: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for (key, bytes, _) in self.list_prefix(prefix).await? {
            match serde_json::from_slice(&bytes) {
                Ok(v) => out.push(v),
                Err(e) => tracing::warn!(%key, error=%e, "skipping undecodable record"),
            }
        }
        Ok(out)
    }

    /// Read-modify-write with compare-and-swap, retried on contention.
    ///
    /// `f` receives the current value (None when absent) and returns the new
    /// one; returning None leaves the record untouched.
    async fn update_json<T, F>(&self, key: &str, mut f: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnMut(Option<T>) -> Option<T> + Send,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (current, rev) = match self.get_json::<T>(key).await? {
                Some((v, rev)) => (Some(v), rev),
                None => (None, 0),
            };
            let Some(next) = f(current) else {
                return Ok(None);
            };
            let bytes = serde_json::to_vec(&next)?;
            let (applied, _) = self.compare_and_swap(key, rev, bytes).await?;
            if applied {
                return Ok(Some(next));
            }
        }
        anyhow::bail!("too much contention updating {key}")
    }
}

impl<S: MetaStore + ?Sized> MetaStoreExt for S {}
