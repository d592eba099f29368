//! The persistence/watch substrate interface.
//!
//! The real substrate -- a Kubernetes API server reached through `kube::Client`
//! -- is an external collaborator; the core only depends on this trait, the
//! same way `stackable_operator::client::Client` wraps `kube::Client` behind a
//! typed `get`/`create`/`patch`/`update` surface instead of calling
//! `kube::Api` directly from business logic. Keeping the dependency behind a
//! trait is what lets `controller.rs`'s driver be tested against
//! [`InMemoryStore`] without a running API server.

use std::{collections::BTreeMap, fmt, pin::Pin};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use kube::{Resource, ResourceExt};
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use crate::{error::store::StoreError, model::ObjectKey};

/// An opaque optimistic-concurrency token: writes carry one in, and a
/// mismatch at write time is a [`StoreError::Conflict`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceVersion(pub String);

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub enum WatchEvent<T> {
    Added { new: T },
    Modified { old: T, new: T },
    Deleted { old: T },
}

pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + 'a>>;

/// Typed get/list/create/update/delete over one entity kind, with label
/// selectors and optimistic concurrency.
#[async_trait]
pub trait ObjectStore<T>: Send + Sync
where
    T: Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<(T, ResourceVersion), StoreError>;

    async fn list(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<T>, StoreError>;

    /// The server may assign the final name from `generate_name`; the
    /// returned object carries whatever name it was actually given.
    async fn create(&self, obj: T) -> Result<T, StoreError>;

    async fn update(&self, obj: T, expected_version: &ResourceVersion) -> Result<T, StoreError>;

    async fn update_status(
        &self,
        obj: T,
        expected_version: &ResourceVersion,
    ) -> Result<T, StoreError>;

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;
}

/// Change-feed over one entity kind, optionally scoped to a namespace.
#[async_trait]
pub trait Watch<T>: Send + Sync
where
    T: Resource + Clone + Send + Sync + 'static,
{
    async fn watch(&self, namespace: Option<&str>) -> BoxStream<'static, WatchEvent<T>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// Structured event sink recording `(object, type, reason, message)` tuples.
/// Warning events accompany propagation failures.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, object: &ObjectKey, event_type: EventType, reason: &str, message: &str);
}

/// An [`EventSink`] that swallows everything -- used by tests that don't
/// care about the event trail, mirroring how `stackable_operator`'s own
/// doctest examples stub out the event recorder.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn record(
        &self,
        _object: &ObjectKey,
        _event_type: EventType,
        _reason: &str,
        _message: &str,
    ) {
    }
}

/// A tracing-backed [`EventSink`] for production use when no richer event
/// recorder is wired up.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn record(
        &self,
        object: &ObjectKey,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        match event_type {
            EventType::Normal => {
                tracing::info!(object = %object, reason, message, "event")
            }
            EventType::Warning => {
                tracing::warn!(object = %object, reason, message, "event")
            }
        }
    }
}

struct Entry<T> {
    object: T,
    version: u64,
}

/// An in-memory [`ObjectStore`]/[`Watch`] fake keyed by (namespace, name),
/// used by the end-to-end reconciler tests. Not a production substrate: it
/// exists purely so placement, overrides, diffing, rolling updates, and
/// status aggregation can be exercised together without a Kubernetes API
/// server, the same role `stackable_operator::client::Client` leaves to
/// integration tests that spin up `envtest`.
pub struct InMemoryStore<T> {
    objects: Mutex<BTreeMap<(String, String), Entry<T>>>,
    events: broadcast::Sender<WatchEvent<T>>,
    generate_suffix: Mutex<u64>,
}

impl<T> Default for InMemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            objects: Mutex::new(BTreeMap::new()),
            events,
            generate_suffix: Mutex::new(0),
        }
    }
}

impl<T> InMemoryStore<T>
where
    T: Resource + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: seed an object directly, bypassing `create`.
    pub async fn seed(&self, obj: T) {
        let key = (
            obj.namespace().unwrap_or_default(),
            obj.name_any(),
        );
        let mut objects = self.objects.lock().await;
        objects.insert(key, Entry { object: obj, version: 1 });
    }

    pub async fn all(&self) -> Vec<T> {
        self.objects
            .lock()
            .await
            .values()
            .map(|e| e.object.clone())
            .collect()
    }
}

#[async_trait]
impl<T> ObjectStore<T> for InMemoryStore<T>
where
    T: Resource + ResourceExt + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<(T, ResourceVersion), StoreError> {
        let objects = self.objects.lock().await;
        objects
            .get(&(key.namespace.clone(), key.name.clone()))
            .map(|e| (e.object.clone(), ResourceVersion(e.version.to_string())))
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        _label_selector: Option<&str>,
    ) -> Result<Vec<T>, StoreError> {
        let objects = self.objects.lock().await;
        Ok(objects
            .iter()
            .filter(|((ns, _), _)| namespace.map(|n| n == ns).unwrap_or(true))
            .map(|(_, e)| e.object.clone())
            .collect())
    }

    async fn create(&self, mut obj: T) -> Result<T, StoreError> {
        if obj.name_any().is_empty() {
            if let Some(prefix) = obj.meta().generate_name.clone() {
                let mut suffix = self.generate_suffix.lock().await;
                *suffix += 1;
                obj.meta_mut().name = Some(format!("{prefix}{:06x}", *suffix));
            }
        }
        obj.meta_mut().resource_version = Some("1".to_string());
        let key = (obj.namespace().unwrap_or_default(), obj.name_any());
        let mut objects = self.objects.lock().await;
        objects.insert(key, Entry { object: obj.clone(), version: 1 });
        let _ = self.events.send(WatchEvent::Added { new: obj.clone() });
        Ok(obj)
    }

    async fn update(&self, mut obj: T, expected_version: &ResourceVersion) -> Result<T, StoreError> {
        let key = (obj.namespace().unwrap_or_default(), obj.name_any());
        let mut objects = self.objects.lock().await;
        let current = objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound { key: format!("{}/{}", key.0, key.1) })?;
        if current.version.to_string() != expected_version.0 {
            return Err(StoreError::Conflict {
                key: format!("{}/{}", key.0, key.1),
            });
        }
        let old = current.object.clone();
        let new_version = current.version + 1;
        obj.meta_mut().resource_version = Some(new_version.to_string());
        objects.insert(
            key,
            Entry {
                object: obj.clone(),
                version: new_version,
            },
        );
        drop(objects);
        let _ = self.events.send(WatchEvent::Modified { old, new: obj.clone() });
        Ok(obj)
    }

    async fn update_status(
        &self,
        obj: T,
        expected_version: &ResourceVersion,
    ) -> Result<T, StoreError> {
        self.update(obj, expected_version).await
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut objects = self.objects.lock().await;
        let removed = objects.remove(&(key.namespace.clone(), key.name.clone()));
        drop(objects);
        if let Some(entry) = removed {
            let _ = self.events.send(WatchEvent::Deleted { old: entry.object });
            Ok(())
        } else {
            Err(StoreError::NotFound {
                key: key.to_string(),
            })
        }
    }
}

#[async_trait]
impl<T> Watch<T> for InMemoryStore<T>
where
    T: Resource + ResourceExt + Clone + Send + Sync + 'static,
{
    async fn watch(&self, namespace: Option<&str>) -> BoxStream<'static, WatchEvent<T>> {
        let namespace = namespace.map(str::to_owned);
        let stream = tokio_stream_from_broadcast(self.events.subscribe());
        Box::pin(stream.filter_map(move |event| {
            let namespace = namespace.clone();
            async move {
                let matches = match &event {
                    WatchEvent::Added { new } | WatchEvent::Modified { new, .. } => namespace
                        .as_deref()
                        .map(|ns| new.namespace().as_deref() == Some(ns))
                        .unwrap_or(true),
                    WatchEvent::Deleted { old } => namespace
                        .as_deref()
                        .map(|ns| old.namespace().as_deref() == Some(ns))
                        .unwrap_or(true),
                };
                matches.then_some(event)
            }
        }))
    }
}

fn tokio_stream_from_broadcast<T>(
    rx: broadcast::Receiver<WatchEvent<T>>,
) -> impl Stream<Item = WatchEvent<T>>
where
    T: Clone + Send + 'static,
{
    // Lagged receivers only mean a watcher fell behind the in-memory fake's
    // broadcast buffer; skip the gap instead of tearing down the stream.
    BroadcastStream::new(rx).filter_map(|result: Result<_, BroadcastStreamRecvError>| async move {
        result.ok()
    })
}
