use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::types::{MetaStore, WatchEvent, WatchStream};

/// Process-local store for tests and dry runs.
#[derive(Debug, Clone)]
pub struct MemoryMetaStore {
    inner: Arc<RwLock<Inner>>,
    tx: broadcast::Sender<WatchEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, (Vec<u8>, u64)>,
}

impl Inner {
    fn next_revision(&mut self) -> u64 {
        self.revision = self.revision.saturating_add(1);
        self.revision
    }
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            tx,
        }
    }

    fn emit(&self, event: WatchEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for MemoryMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MetaStore for MemoryMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let rev = {
            let mut inner = self.inner.write().await;
            let rev = inner.next_revision();
            inner.kv.insert(key.to_string(), (value.clone(), rev));
            rev
        };
        self.emit(WatchEvent {
            key: key.to_string(),
            value: Some(value),
            revision: rev,
        });
        Ok(rev)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        Ok(inner.kv.get(key).map(|(v, rev)| (v.clone(), *rev)))
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let (rev, existed) = {
            let mut inner = self.inner.write().await;
            let existed = inner.kv.remove(key).is_some();
            (inner.next_revision(), existed)
        };
        if existed {
            self.emit(WatchEvent {
                key: key.to_string(),
                value: None,
                revision: rev,
            });
        }
        Ok(rev)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, rev))| (k.clone(), v.clone(), *rev))
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)> {
        let rev = {
            let mut inner = self.inner.write().await;
            let current_rev = inner.kv.get(key).map(|(_, rev)| *rev).unwrap_or(0);
            if current_rev != expected_revision {
                return Ok((false, current_rev));
            }
            let rev = inner.next_revision();
            inner.kv.insert(key.to_string(), (value.clone(), rev));
            rev
        };
        self.emit(WatchEvent {
            key: key.to_string(),
            value: Some(value),
            revision: rev,
        });
        Ok((true, rev))
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision_exclusive: Option<u64>,
    ) -> Result<WatchStream> {
        let prefix = prefix.to_string();
        let min_rev = start_revision_exclusive.unwrap_or(0);
        let rx = self.tx.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(move |msg| match msg {
            Ok(ev) if ev.revision > min_rev && ev.key.starts_with(&prefix) => Some(ev),
            _ => None,
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetaStoreExt;

    #[tokio::test]
    async fn list_prefix_is_bounded_and_sorted() {
        let store = MemoryMetaStore::new();
        store.put("/fleet/pools/ng-2", b"b".to_vec()).await.unwrap();
        store.put("/fleet/pools/ng-1", b"a".to_vec()).await.unwrap();
        store.put("/fleet/workloads/x", b"c".to_vec()).await.unwrap();

        let keys: Vec<String> = store
            .list_prefix("/fleet/pools/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _, _)| k)
            .collect();
        assert_eq!(keys, vec!["/fleet/pools/ng-1", "/fleet/pools/ng-2"]);
    }

    #[tokio::test]
    async fn cas_with_zero_creates_only_when_absent() {
        let store = MemoryMetaStore::new();
        let (ok, rev) = store.compare_and_swap("/k", 0, b"1".to_vec()).await.unwrap();
        assert!(ok);
        let (ok, current) = store.compare_and_swap("/k", 0, b"2".to_vec()).await.unwrap();
        assert!(!ok);
        assert_eq!(current, rev);
        let (value, _) = store.get("/k").await.unwrap().unwrap();
        assert_eq!(value, b"1");
    }

    #[tokio::test]
    async fn update_json_applies_closure() {
        let store = MemoryMetaStore::new();
        store.put_json("/counter", &1u32).await.unwrap();
        let next = store
            .update_json::<u32, _>("/counter", |v| v.map(|n| n + 1))
            .await
            .unwrap();
        assert_eq!(next, Some(2));
        let untouched = store
            .update_json::<u32, _>("/missing", |v| v.map(|n| n + 1))
            .await
            .unwrap();
        assert_eq!(untouched, None);
        assert!(store.get("/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watch_filters_by_prefix() {
        let store = MemoryMetaStore::new();
        let mut stream = store.watch_prefix("/fleet/topology/", None).await.unwrap();
        store.put("/fleet/pools/a", b"x".to_vec()).await.unwrap();
        store.put("/fleet/topology/target", b"t".to_vec()).await.unwrap();
        let ev = stream.next().await.unwrap();
        assert_eq!(ev.key, "/fleet/topology/target");
        assert_eq!(ev.value.as_deref(), Some(&b"t"[..]));
    }
}
