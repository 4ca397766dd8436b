use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{document_id, is_collection_path, parent_path, Document, DocumentStore, Snapshot, StoreSubscription};
use crate::error::StoreError;

/// Store operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    Set,
    Delete,
    Query,
    Subscribe,
}

struct Fault {
    op: Op,
    prefix: String,
}

struct Watcher {
    path: String,
    tx: mpsc::UnboundedSender<Snapshot>,
    token: CancellationToken,
}

impl Watcher {
    fn is_live(&self) -> bool {
        !self.token.is_cancelled() && !self.tx.is_closed()
    }
}

/// In-process document store with change notification and fault injection.
///
/// Notifications are sent while the document lock is held, so every watcher
/// observes changes in commit order.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    docs: Mutex<BTreeMap<String, Value>>,
    watchers: Mutex<Vec<Watcher>>,
    faults: Mutex<Vec<Fault>>,
    available: AtomicBool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            docs: Mutex::new(BTreeMap::new()),
            watchers: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }
}

fn snapshot_of(docs: &BTreeMap<String, Value>, path: &str) -> Snapshot {
    let documents = if is_collection_path(path) {
        docs.iter()
            .filter(|(doc_path, _)| parent_path(doc_path) == Some(path))
            .map(|(doc_path, data)| Document {
                id: document_id(doc_path).to_string(),
                path: doc_path.clone(),
                data: data.clone(),
            })
            .collect()
    } else {
        docs.get(path)
            .map(|data| Document {
                id: document_id(path).to_string(),
                path: path.to_string(),
                data: data.clone(),
            })
            .into_iter()
            .collect()
    };
    Snapshot {
        path: path.to_string(),
        documents,
    }
}

fn affects(watched: &str, changed: &str) -> bool {
    watched == changed || parent_path(changed) == Some(watched)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation on paths starting with `prefix` fail until cleared.
    pub async fn fail_on(&self, op: Op, prefix: &str) {
        self.inner.faults.lock().await.push(Fault {
            op,
            prefix: prefix.to_string(),
        });
    }

    pub async fn clear_faults(&self) {
        self.inner.faults.lock().await.clear();
    }

    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Release);
    }

    /// Live subscriptions whose path starts with `prefix`.
    pub async fn watcher_count(&self, prefix: &str) -> usize {
        self.inner
            .watchers
            .lock()
            .await
            .iter()
            .filter(|w| w.is_live() && w.path.starts_with(prefix))
            .count()
    }

    /// Stored documents whose path starts with `prefix`.
    pub async fn document_count(&self, prefix: &str) -> usize {
        self.inner
            .docs
            .lock()
            .await
            .keys()
            .filter(|path| path.starts_with(prefix))
            .count()
    }

    async fn check(&self, op: Op, path: &str) -> Result<(), StoreError> {
        if !self.inner.available.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        let faults = self.inner.faults.lock().await;
        if faults.iter().any(|f| f.op == op && path.starts_with(&f.prefix)) {
            return Err(StoreError::Unavailable(format!(
                "injected {op:?} failure at {path}"
            )));
        }
        Ok(())
    }

    async fn notify(&self, docs: &BTreeMap<String, Value>, changed: &str) {
        let mut watchers = self.inner.watchers.lock().await;
        watchers.retain(Watcher::is_live);
        for watcher in watchers.iter().filter(|w| affects(&w.path, changed)) {
            let _ = watcher.tx.send(snapshot_of(docs, &watcher.path));
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        self.check(Op::Get, path).await?;
        Ok(self.inner.docs.lock().await.get(path).cloned())
    }

    async fn set(&self, path: &str, doc: Value) -> Result<(), StoreError> {
        self.check(Op::Set, path).await?;
        if is_collection_path(path) || !doc.is_object() {
            return Err(StoreError::Malformed(path.to_string()));
        }
        let mut docs = self.inner.docs.lock().await;
        docs.insert(path.to_string(), doc);
        self.notify(&docs, path).await;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.check(Op::Delete, path).await?;
        let mut docs = self.inner.docs.lock().await;
        if docs.remove(path).is_some() {
            self.notify(&docs, path).await;
        }
        Ok(())
    }

    async fn query(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        self.check(Op::Query, collection).await?;
        let docs = self.inner.docs.lock().await;
        Ok(snapshot_of(&docs, collection).documents)
    }

    async fn subscribe(&self, path: &str) -> Result<StoreSubscription, StoreError> {
        self.check(Op::Subscribe, path).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        // Hold the document lock so no change slips between the initial
        // snapshot and the watcher registration.
        let docs = self.inner.docs.lock().await;
        let _ = tx.send(snapshot_of(&docs, path));
        self.inner.watchers.lock().await.push(Watcher {
            path: path.to_string(),
            tx,
            token: token.clone(),
        });
        drop(docs);

        debug!("Store subscription opened: path={}", path);
        Ok(StoreSubscription::new(rx, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_collection_subscription_sees_changes_in_order() {
        let store = MemoryStore::new();
        store.set("users/op/cameras/a", json!({"n": 1})).await.unwrap();

        let mut sub = store.subscribe("users/op/cameras").await.unwrap();
        let initial = sub.recv().await.unwrap();
        assert_eq!(initial.documents.len(), 1);

        store.set("users/op/cameras/b", json!({"n": 2})).await.unwrap();
        store.delete("users/op/cameras/a").await.unwrap();

        let after_add = sub.recv().await.unwrap();
        assert_eq!(after_add.documents.len(), 2);
        let after_delete = sub.recv().await.unwrap();
        assert_eq!(after_delete.documents.len(), 1);
        assert_eq!(after_delete.documents[0].id, "b");
    }

    #[tokio::test]
    async fn test_nested_documents_do_not_notify_parent_collection() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("users/op/cameras").await.unwrap();
        sub.recv().await.unwrap();

        store
            .set("users/op/cameras/a/fire_detection/e1", json!({"timestamp": 1}))
            .await
            .unwrap();
        assert!(sub.updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_subscription_is_not_counted() {
        let store = MemoryStore::new();
        let sub = store.subscribe("users/op/cameras/a/fire_detection").await.unwrap();
        assert_eq!(store.watcher_count("users/op/cameras/a/").await, 1);
        sub.cancel();
        assert_eq!(store.watcher_count("users/op/cameras/a/").await, 0);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryStore::new();
        store.fail_on(Op::Delete, "users/op/cameras/a/fire_detection").await;
        assert!(store.delete("users/op/cameras/a/fire_detection/e1").await.is_err());
        assert!(store.delete("users/op/cameras/a").await.is_ok());

        store.clear_faults().await;
        store.set_available(false);
        assert!(matches!(
            store.get("users/op/cameras/a").await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_set_rejects_non_documents() {
        let store = MemoryStore::new();
        assert_eq!(
            store.set("users/op/cameras/a", json!(3)).await,
            Err(StoreError::Malformed("users/op/cameras/a".to_string()))
        );
        assert!(matches!(
            store.set("users/op/cameras", json!({"n": 1})).await,
            Err(StoreError::Malformed(_))
        ));
        assert_eq!(store.document_count("users/").await, 0);
    }
}
