use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock, RwLockWriteGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use client_core::{
    AuthError, AuthProvider, Document, DocumentPath, DocumentStore, FieldUpdate, StoreError,
    Subscription, UserIdentity,
};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use uuid::Uuid;

#[derive(Default)]
struct StoreState {
    documents: HashMap<DocumentPath, Document>,
    watchers: HashMap<DocumentPath, watch::Sender<Option<Document>>>,
    write_log: Vec<(DocumentPath, FieldUpdate)>,
}

impl StoreState {
    fn publish(&mut self, path: &DocumentPath) {
        let Some(tx) = self.watchers.get(path) else {
            return;
        };
        if tx.receiver_count() == 0 {
            self.watchers.remove(path);
            return;
        }
        tx.send_replace(self.documents.get(path).cloned());
    }
}

/// Process-local document store with field-level set operations and
/// live subscriptions. Supports injected outages for tests.
#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    state: Arc<RwLock<StoreState>>,
    failing_calls: Arc<AtomicUsize>,
    offline: Arc<AtomicBool>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` store calls fail with `Unavailable`.
    pub fn fail_next_calls(&self, count: usize) {
        self.failing_calls.store(count, Ordering::SeqCst);
    }

    /// Fail every call until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Field updates applied so far, in order.
    pub fn write_log(&self) -> Vec<(DocumentPath, FieldUpdate)> {
        self.state
            .read()
            .map(|state| state.write_log.clone())
            .unwrap_or_default()
    }

    /// Live subscriptions currently held on `path`.
    pub fn subscriber_count(&self, path: &DocumentPath) -> usize {
        self.state
            .read()
            .ok()
            .and_then(|state| state.watchers.get(path).map(watch::Sender::receiver_count))
            .unwrap_or(0)
    }

    fn check_available(&self, operation: &str) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            warn!(operation, "document store offline");
            return Err(StoreError::Unavailable("store offline".to_owned()));
        }
        let injected = self
            .failing_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            warn!(operation, "injected document store outage");
            return Err(StoreError::Unavailable("injected outage".to_owned()));
        }
        Ok(())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreState>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))
    }
}

impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, path: &DocumentPath) -> Result<Option<Document>, StoreError> {
        self.check_available("get")?;
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        trace!(%path, "get");
        Ok(state.documents.get(path).cloned())
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>, StoreError> {
        self.check_available("list")?;
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        let mut documents: Vec<(String, Document)> = state
            .documents
            .iter()
            .filter(|(path, _)| path.collection == collection)
            .map(|(path, document)| (path.id.clone(), document.clone()))
            .collect();
        documents.sort_by(|a, b| a.0.cmp(&b.0));
        trace!(collection, count = documents.len(), "list");
        Ok(documents)
    }

    async fn set(&self, path: &DocumentPath, document: Document) -> Result<(), StoreError> {
        self.check_available("set")?;
        let mut state = self.write()?;
        state.documents.insert(path.clone(), document);
        state.publish(path);
        debug!(%path, "document set");
        Ok(())
    }

    async fn add(&self, collection: &str, document: Document) -> Result<String, StoreError> {
        self.check_available("add")?;
        let id = Uuid::new_v4().simple().to_string();
        let path = DocumentPath::new(collection, id.clone());
        let mut state = self.write()?;
        state.documents.insert(path.clone(), document);
        state.publish(&path);
        debug!(%path, "document added");
        Ok(id)
    }

    async fn update(
        &self,
        path: &DocumentPath,
        updates: Vec<FieldUpdate>,
    ) -> Result<(), StoreError> {
        self.check_available("update")?;
        let mut state = self.write()?;
        let document = state
            .documents
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        for update in &updates {
            apply_field_update(document, update);
        }
        state
            .write_log
            .extend(updates.into_iter().map(|update| (path.clone(), update)));
        state.publish(path);
        debug!(%path, "document updated");
        Ok(())
    }

    async fn delete(&self, path: &DocumentPath) -> Result<(), StoreError> {
        self.check_available("delete")?;
        let mut state = self.write()?;
        let existed = state.documents.remove(path).is_some();
        state.publish(path);
        debug!(%path, existed, "document deleted");
        Ok(())
    }

    fn subscribe(&self, path: &DocumentPath) -> Result<Subscription, StoreError> {
        self.check_available("subscribe")?;
        let mut state = self.write()?;
        let current = state.documents.get(path).cloned();
        let rx = state
            .watchers
            .entry(path.clone())
            .or_insert_with(|| watch::Sender::new(current))
            .subscribe();
        Ok(Subscription::new(path.clone(), rx))
    }
}

fn apply_field_update(document: &mut Document, update: &FieldUpdate) {
    match update {
        FieldUpdate::Set { field, value } => {
            document.insert(field.clone(), value.clone());
        }
        FieldUpdate::ArrayUnion { field, elements } => {
            let slot = document
                .entry(field.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            if let Value::Array(items) = slot {
                for element in elements {
                    let value = Value::String(element.clone());
                    if !items.contains(&value) {
                        items.push(value);
                    }
                }
            }
        }
        FieldUpdate::ArrayRemove { field, elements } => {
            if let Some(Value::Array(items)) = document.get_mut(field) {
                items.retain(|item| {
                    item.as_str()
                        .is_none_or(|item| !elements.iter().any(|element| element == item))
                });
            }
        }
    }
}

/// Auth provider whose identity is set directly, for tests and demos.
#[derive(Clone)]
pub struct InMemoryAuthProvider {
    identity: Arc<watch::Sender<Option<UserIdentity>>>,
}

impl InMemoryAuthProvider {
    pub fn new(identity: Option<UserIdentity>) -> Self {
        Self {
            identity: Arc::new(watch::Sender::new(identity)),
        }
    }

    pub fn sign_in(&self, identity: UserIdentity) {
        debug!(user_id = %identity, "signed in");
        self.identity.send_replace(Some(identity));
    }

    pub fn subscriber_count(&self) -> usize {
        self.identity.receiver_count()
    }
}

impl Default for InMemoryAuthProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

impl AuthProvider for InMemoryAuthProvider {
    fn current_identity(&self) -> Option<UserIdentity> {
        self.identity.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<UserIdentity>> {
        self.identity.subscribe()
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        debug!("signed out");
        self.identity.send_replace(None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    fn union(field: &str, element: &str) -> FieldUpdate {
        FieldUpdate::ArrayUnion {
            field: field.to_owned(),
            elements: vec![element.to_owned()],
        }
    }

    fn remove(field: &str, element: &str) -> FieldUpdate {
        FieldUpdate::ArrayRemove {
            field: field.to_owned(),
            elements: vec![element.to_owned()],
        }
    }

    #[tokio::test]
    async fn set_get_delete_roundtrip() {
        let store = InMemoryDocumentStore::new();
        let path = DocumentPath::user("u1");
        store
            .set(&path, doc(json!({ "name": "Ada" })))
            .await
            .expect("set should work");

        let got = store.get(&path).await.expect("get should work");
        assert_eq!(got, Some(doc(json!({ "name": "Ada" }))));

        store.delete(&path).await.expect("delete should work");
        assert_eq!(store.get(&path).await.expect("get should work"), None);
    }

    #[tokio::test]
    async fn union_and_remove_are_idempotent_set_operations() {
        let store = InMemoryDocumentStore::new();
        let path = DocumentPath::event("e1");
        store
            .set(&path, doc(json!({ "title": "Walk", "participants": ["u1"] })))
            .await
            .expect("set should work");

        for update in [
            union("participants", "u2"),
            union("participants", "u2"),
            remove("participants", "u1"),
            remove("participants", "u9"),
        ] {
            store
                .update(&path, vec![update])
                .await
                .expect("update should work");
        }

        let got = store.get(&path).await.expect("get").expect("exists");
        assert_eq!(got["participants"], json!(["u2"]));
        assert_eq!(got["title"], json!("Walk"));
    }

    #[tokio::test]
    async fn concurrent_writers_to_different_elements_converge() {
        let store = InMemoryDocumentStore::new();
        let path = DocumentPath::user("u1");
        store
            .set(&path, doc(json!({ "favorites": [] })))
            .await
            .expect("set should work");

        let a = store.clone();
        let b = store.clone();
        let (pa, pb) = (path.clone(), path.clone());
        let (ra, rb) = tokio::join!(
            async move { a.update(&pa, vec![union("favorites", "https://x/a.jpg")]).await },
            async move { b.update(&pb, vec![union("favorites", "https://x/b.jpg")]).await },
        );
        ra.expect("writer a");
        rb.expect("writer b");

        let got = store.get(&path).await.expect("get").expect("exists");
        let favorites = got["favorites"].as_array().expect("array field");
        assert_eq!(favorites.len(), 2);
    }

    #[tokio::test]
    async fn union_replaces_non_array_field() {
        let store = InMemoryDocumentStore::new();
        let path = DocumentPath::user("u1");
        store
            .set(&path, doc(json!({ "favorites": "oops" })))
            .await
            .expect("set should work");
        store
            .update(&path, vec![union("favorites", "https://x/a.jpg")])
            .await
            .expect("update should work");

        let got = store.get(&path).await.expect("get").expect("exists");
        assert_eq!(got["favorites"], json!(["https://x/a.jpg"]));
    }

    #[tokio::test]
    async fn update_of_missing_document_fails() {
        let store = InMemoryDocumentStore::new();
        let err = store
            .update(&DocumentPath::event("nope"), vec![union("participants", "u1")])
            .await
            .expect_err("missing document");
        assert_eq!(err, StoreError::NotFound("events/nope".to_owned()));
        assert!(store.write_log().is_empty());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let store = InMemoryDocumentStore::new();
        store.fail_next_calls(2);

        assert!(store.list("users").await.is_err());
        assert!(store.list("users").await.is_err());
        assert!(store.list("users").await.is_ok());
    }

    #[tokio::test]
    async fn add_generates_distinct_ids() {
        let store = InMemoryDocumentStore::new();
        let a = store.add("events", Document::new()).await.expect("add a");
        let b = store.add("events", Document::new()).await.expect("add b");
        assert_ne!(a, b);

        let listed = store.list("events").await.expect("list");
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn subscription_sees_updates_and_releases_on_drop() {
        let store = InMemoryDocumentStore::new();
        let path = DocumentPath::event("e1");
        store
            .set(&path, doc(json!({ "participants": [] })))
            .await
            .expect("set should work");

        let mut subscription = store.subscribe(&path).expect("subscribe works");
        assert_eq!(store.subscriber_count(&path), 1);

        store
            .update(&path, vec![union("participants", "u1")])
            .await
            .expect("update should work");
        let next = subscription.changed().await.expect("store alive");
        assert_eq!(next, Some(doc(json!({ "participants": ["u1"] }))));

        drop(subscription);
        assert_eq!(store.subscriber_count(&path), 0);
    }

    #[tokio::test]
    async fn auth_provider_publishes_identity_changes() {
        let provider = InMemoryAuthProvider::default();
        let mut rx = provider.subscribe();
        assert_eq!(provider.current_identity(), None);

        provider.sign_in(UserIdentity::new("u1").expect("valid identity"));
        rx.changed().await.expect("sender alive");
        assert_eq!(
            rx.borrow().as_ref().map(UserIdentity::as_str),
            Some("u1")
        );

        provider.sign_out().await.expect("sign out works");
        assert_eq!(provider.current_identity(), None);
    }

    #[tokio::test]
    async fn same_id_in_different_collections_is_distinct() {
        let store = InMemoryDocumentStore::new();
        store
            .set(&DocumentPath::user("x"), doc(json!({ "name": "user" })))
            .await
            .expect("set user");
        store
            .set(&DocumentPath::todo("x"), doc(json!({ "name": "pack lenses" })))
            .await
            .expect("set to-do");

        let user = store
            .get(&DocumentPath::user("x"))
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(user["name"], json!("user"));
        assert_eq!(store.list("users").await.expect("list").len(), 1);
        assert_eq!(store.list("todoList").await.expect("list").len(), 1);
        assert!(store.list("events").await.expect("list").is_empty());
    }
}
