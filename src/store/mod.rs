//! # Document store boundary.
//!
//! The console treats a remote change-notifying document store as its source of
//! truth. Paths are `/`-separated; a path with an odd number of segments names a
//! collection (`users/{op}/cameras`), an even number names a document
//! (`users/{op}/cameras/{id}`).
//!
//! Subscriptions deliver a fully materialized [`Snapshot`] immediately and then
//! again after every change under the watched path.

pub mod memory;

pub use memory::{MemoryStore, Op};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub path: String,
    pub data: Value,
}

/// Full contents of a watched path at one point in time.
///
/// A document subscription yields zero (absent) or one entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub path: String,
    pub documents: Vec<Document>,
}

impl Snapshot {
    pub fn first(&self) -> Option<&Document> {
        self.documents.first()
    }
}

/// A live store subscription. Cancelling stops future deliveries; a snapshot
/// already queued may still be received.
#[derive(Debug)]
pub struct StoreSubscription {
    updates: mpsc::UnboundedReceiver<Snapshot>,
    token: CancellationToken,
}

impl StoreSubscription {
    pub fn new(updates: mpsc::UnboundedReceiver<Snapshot>, token: CancellationToken) -> Self {
        Self { updates, token }
    }

    pub async fn recv(&mut self) -> Option<Snapshot> {
        self.updates.recv().await
    }

    /// Token that ends this subscription when cancelled.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Fails with `Malformed` unless `doc` is a JSON object at a document path.
    async fn set(&self, path: &str, doc: Value) -> Result<(), StoreError>;

    /// Deleting an absent document succeeds. Sub-collections are not touched.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    async fn query(&self, collection: &str) -> Result<Vec<Document>, StoreError>;

    async fn subscribe(&self, path: &str) -> Result<StoreSubscription, StoreError>;
}

pub fn is_collection_path(path: &str) -> bool {
    path.split('/').count() % 2 == 1
}

/// Parent collection of a document path.
pub fn parent_path(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

pub fn document_id(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, id)| id).unwrap_or(path)
}
