use std::sync::Arc;

use anyhow::Result;
use etcd_client::{Client, Compare, CompareOp, EventType, GetOptions, Txn, TxnOp, WatchOptions};
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;

use crate::types::{MetaStore, WatchEvent, WatchStream};

/// etcd-backed store shared by the orchestrator and the simulated providers.
#[derive(Clone)]
pub struct EtcdMetaStore {
    client: Arc<Mutex<Client>>,
}

impl EtcdMetaStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let c = Client::connect(endpoints, None).await?;
        Ok(Self {
            client: Arc::new(Mutex::new(c)),
        })
    }
}

#[async_trait::async_trait]
impl MetaStore for EtcdMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let mut cli = self.client.lock().await;
        let resp = cli.put(key, value, None).await?;
        let rev = resp.header().map(|h| h.revision()).unwrap_or_default();
        Ok(rev as u64)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let mut cli = self.client.lock().await;
        let resp = cli.get(key, None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| (kv.value().to_vec(), kv.mod_revision() as u64)))
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut cli = self.client.lock().await;
        let resp = cli.delete(key, None).await?;
        let rev = resp.header().map(|h| h.revision()).unwrap_or_default();
        Ok(rev as u64)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let mut cli = self.client.lock().await;
        let resp = cli.get(prefix, Some(GetOptions::new().with_prefix())).await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.key()).to_string(),
                    kv.value().to_vec(),
                    kv.mod_revision() as u64,
                )
            })
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)> {
        let mut cli = self.client.lock().await;

        // An absent key has mod_revision 0 in etcd comparisons.
        let cmp = Compare::mod_revision(key, CompareOp::Equal, expected_revision as i64);
        let txn = Txn::new()
            .when([cmp])
            .and_then([TxnOp::put(key, value, None)])
            .or_else([TxnOp::get(key, None)]);
        let resp = cli.txn(txn).await?;
        let rev = resp.header().map(|h| h.revision()).unwrap_or_default() as u64;

        if resp.succeeded() {
            return Ok((true, rev));
        }

        let current = cli.get(key, None).await?;
        let current_rev = current
            .kvs()
            .first()
            .map(|kv| kv.mod_revision() as u64)
            .unwrap_or(0);
        Ok((false, current_rev))
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision_exclusive: Option<u64>,
    ) -> Result<WatchStream> {
        let mut cli = self.client.lock().await;

        let mut opts = WatchOptions::new().with_prefix();
        if let Some(min_rev) = start_revision_exclusive {
            // etcd's start revision is inclusive.
            opts = opts.with_start_revision(min_rev.saturating_add(1) as i64);
        }

        let (watcher, mut stream) = cli.watch(prefix, Some(opts)).await?;

        let (tx, rx) = tokio::sync::mpsc::channel::<WatchEvent>(256);
        tokio::spawn(async move {
            // Dropping the watcher cancels the server-side watch.
            let _watcher = watcher;
            while let Ok(Some(resp)) = stream.message().await {
                for ev in resp.events() {
                    let Some(kv) = ev.kv() else { continue };
                    let value = match ev.event_type() {
                        EventType::Put => Some(kv.value().to_vec()),
                        EventType::Delete => None,
                    };
                    let event = WatchEvent {
                        key: String::from_utf8_lossy(kv.key()).to_string(),
                        value,
                        revision: kv.mod_revision() as u64,
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
