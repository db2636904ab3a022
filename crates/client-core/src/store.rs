use std::future::Future;

use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::{
    error::{AppError, AppErrorCategory},
    types::{Document, DocumentPath, FieldUpdate},
};

/// Errors reported by a document store backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("document store unavailable: {0}")]
    Unavailable(String),
    #[error("document store backend failure: {0}")]
    Backend(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(path) => AppError::new(
                AppErrorCategory::InvalidArgument,
                "document_not_found",
                format!("document not found: {path}"),
            ),
            StoreError::Unavailable(message) => AppError::remote_unavailable(message),
            StoreError::Backend(message) => AppError::new(
                AppErrorCategory::RemoteUnavailable,
                "remote_backend_failure",
                message,
            ),
        }
    }
}

impl StoreError {
    /// Mapping for failed writes. A write target that vanished is a remote
    /// failure, not a bad argument.
    pub fn into_write_error(self) -> AppError {
        match self {
            StoreError::NotFound(path) => AppError::new(
                AppErrorCategory::RemoteUnavailable,
                "remote_document_missing",
                format!("write target no longer exists: {path}"),
            ),
            other => other.into(),
        }
    }
}

/// Remote document database addressed by `(collection, id)`.
///
/// `update` applies all field updates of one call atomically to one
/// document. Array union/remove never touch other fields or other elements,
/// so concurrent writers to the same set converge.
pub trait DocumentStore: Send + Sync {
    fn get(
        &self,
        path: &DocumentPath,
    ) -> impl Future<Output = Result<Option<Document>, StoreError>> + Send;

    fn list(
        &self,
        collection: &str,
    ) -> impl Future<Output = Result<Vec<(String, Document)>, StoreError>> + Send;

    fn set(
        &self,
        path: &DocumentPath,
        document: Document,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Insert under a generated id and return that id.
    fn add(
        &self,
        collection: &str,
        document: Document,
    ) -> impl Future<Output = Result<String, StoreError>> + Send;

    /// Fails with [`StoreError::NotFound`] when the document does not exist.
    fn update(
        &self,
        path: &DocumentPath,
        updates: Vec<FieldUpdate>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn delete(&self, path: &DocumentPath) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Live-subscribe to one document.
    fn subscribe(&self, path: &DocumentPath) -> Result<Subscription, StoreError>;
}

/// Live view of one document. Dropping the handle unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    path: DocumentPath,
    rx: watch::Receiver<Option<Document>>,
}

impl Subscription {
    pub fn new(path: DocumentPath, rx: watch::Receiver<Option<Document>>) -> Self {
        debug!(%path, "subscription acquired");
        Self { path, rx }
    }

    /// Wait for the next change. `None` once the store has gone away.
    pub async fn changed(&mut self) -> Option<Option<Document>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        debug!(path = %self.path, "subscription released");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn maps_store_errors_into_app_errors() {
        let err: AppError = StoreError::Unavailable("offline".into()).into();
        assert_eq!(err.category, AppErrorCategory::RemoteUnavailable);
        assert_eq!(err.code, "remote_unavailable");

        let err: AppError = StoreError::NotFound("events/e404".into()).into();
        assert_eq!(err.category, AppErrorCategory::InvalidArgument);
        assert_eq!(err.code, "document_not_found");
    }

    #[test]
    fn missing_write_target_is_a_remote_failure() {
        let err = StoreError::NotFound("users/u9".into()).into_write_error();
        assert_eq!(err.category, AppErrorCategory::RemoteUnavailable);
        assert_eq!(err.code, "remote_document_missing");
        assert!(err.category.is_transient());

        let err = StoreError::Unavailable("offline".into()).into_write_error();
        assert_eq!(err.code, "remote_unavailable");
    }

    #[tokio::test]
    async fn subscription_redelivers_latest_value() {
        let (tx, rx) = watch::channel(None);
        let mut subscription = Subscription::new(DocumentPath::event("e1"), rx);

        let mut doc = Document::new();
        doc.insert("title".into(), json!("Night market"));
        tx.send_replace(Some(doc.clone()));

        assert_eq!(subscription.changed().await, Some(Some(doc)));
        drop(tx);
        assert_eq!(subscription.changed().await, None);
    }

    #[test]
    fn dropping_subscription_releases_receiver() {
        let (tx, rx) = watch::channel(None);
        let subscription = Subscription::new(DocumentPath::user("u1"), rx);
        assert_eq!(tx.receiver_count(), 1);
        drop(subscription);
        assert_eq!(tx.receiver_count(), 0);
    }
}
