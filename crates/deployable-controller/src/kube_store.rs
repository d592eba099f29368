//! The Kubernetes-backed [`ObjectStore`]/[`Watch`] implementation, the real
//! external collaborator behind `deployable_core`'s storage traits. Scopes a
//! fresh [`Api`] per call, since `kube::Client` is cheap to clone and a
//! `deployable-core::ObjectStore` call can address any namespace, not just
//! the one the store was built for.

use std::{fmt::Debug, marker::PhantomData};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    runtime::{
        watcher::{self, Event as WatcherEvent},
        WatchStreamExt,
    },
    Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};

use deployable_core::{
    model::ObjectKey,
    store::{BoxStream, ObjectStore, ResourceVersion, Watch, WatchEvent},
};
use deployable_core::error::store::StoreError;

/// Bounds shared by every kind this adapter is instantiated over: the three
/// namespaced CRDs in `deployable_core::model`.
pub trait KubeResource:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
}

impl<T> KubeResource for T where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static
{
}

pub struct KubeStore<T> {
    client: Client,
    _marker: PhantomData<T>,
}

impl<T> KubeStore<T>
where
    T: KubeResource,
{
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _marker: PhantomData,
        }
    }

    fn api(&self, namespace: &str) -> Api<T> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn api_all(&self) -> Api<T> {
        Api::all(self.client.clone())
    }
}

fn map_api_error(key: &str, err: kube::Error) -> StoreError {
    match &err {
        kube::Error::Api(status) if status.code == 404 => StoreError::NotFound {
            key: key.to_string(),
        },
        kube::Error::Api(status) if status.code == 409 => StoreError::Conflict {
            key: key.to_string(),
        },
        other => StoreError::Backend {
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl<T> ObjectStore<T> for KubeStore<T>
where
    T: KubeResource,
{
    async fn get(&self, key: &ObjectKey) -> Result<(T, ResourceVersion), StoreError> {
        let obj = self
            .api(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|err| map_api_error(&key.to_string(), err))?;
        let version = ResourceVersion(obj.resource_version().unwrap_or_default());
        Ok((obj, version))
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<T>, StoreError> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let api = match namespace {
            Some(ns) => self.api(ns),
            None => self.api_all(),
        };
        let list = api
            .list(&params)
            .await
            .map_err(|err| StoreError::Backend {
                message: err.to_string(),
            })?;
        Ok(list.items)
    }

    async fn create(&self, obj: T) -> Result<T, StoreError> {
        let namespace = obj.namespace().unwrap_or_default();
        let key = format!("{namespace}/{}", obj.name_any());
        self.api(&namespace)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|err| map_api_error(&key, err))
    }

    async fn update(&self, mut obj: T, expected_version: &ResourceVersion) -> Result<T, StoreError> {
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let key = format!("{namespace}/{name}");
        obj.meta_mut().resource_version = Some(expected_version.0.clone());
        self.api(&namespace)
            .replace(&name, &PostParams::default(), &obj)
            .await
            .map_err(|err| map_api_error(&key, err))
    }

    async fn update_status(
        &self,
        mut obj: T,
        expected_version: &ResourceVersion,
    ) -> Result<T, StoreError> {
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let key = format!("{namespace}/{name}");
        obj.meta_mut().resource_version = Some(expected_version.0.clone());
        let body = serde_json::to_vec(&obj).map_err(|err| StoreError::Backend {
            message: err.to_string(),
        })?;
        self.api(&namespace)
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|err| map_api_error(&key, err))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.api(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|err| map_api_error(&key.to_string(), err))
    }
}

#[async_trait]
impl<T> Watch<T> for KubeStore<T>
where
    T: KubeResource,
{
    async fn watch(&self, namespace: Option<&str>) -> BoxStream<'static, WatchEvent<T>> {
        let api = match namespace {
            Some(ns) => self.api(ns),
            None => self.api_all(),
        };
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        Box::pin(stream.filter_map(|event| async move {
            match event {
                Ok(WatcherEvent::Apply(obj)) | Ok(WatcherEvent::InitApply(obj)) => {
                    Some(WatchEvent::Added { new: obj })
                }
                Ok(WatcherEvent::Delete(obj)) => Some(WatchEvent::Deleted { old: obj }),
                Ok(WatcherEvent::Init) | Ok(WatcherEvent::InitDone) => None,
                Err(err) => {
                    tracing::warn!(error = %err, "watch stream error, will retry");
                    None
                }
            }
        }))
    }
}
