//! The capability contracts a typed resource client implements.
//!
//! The operations are split into four capabilities, so that clients for resource kinds which
//! lack a capability (e.g. kinds without a status sub-resource) are not forced to implement it:
//!
//! - [`WriteApi`]: create, patch, update and delete
//! - [`WriteStatusApi`]: update the status sub-resource
//! - [`ReadApi`]: get, list and watch
//! - [`ApplyApi`]: server-side apply
//!
//! [`FullApi`] combines read, write and apply and is implemented automatically. Status updates
//! are orthogonal to it and have to be requested separately.
//!
//! Every operation takes a [`Context`] first. Any operation may fail because the context was
//! cancelled or its deadline passed. No operation retries, a retry policy is up to the caller.
//!
//! ```no_run
//! use k8s_openapi::api::core::v1::ConfigMap;
//! use kube::api::ObjectList;
//! use stackable_kubetypes::{Context, FullApi, ListOptions, ReadApi, Result};
//!
//! async fn count_config_maps(
//!     ctx: &Context,
//!     client: &dyn FullApi<ConfigMap, ObjectList<ConfigMap>, ConfigMap>,
//! ) -> Result<usize> {
//!     let list = client
//!         .list(ctx, &ListOptions::default().with_label_selector("app=web"))
//!         .await?;
//!     Ok(list.items.len())
//! }
//! ```
use std::fmt::Debug;

use async_trait::async_trait;
use kube::{Resource, api::ObjectList};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    context::Context,
    error::Result,
    options::{ApplyOptions, ListOptions},
    patch::PatchType,
    watch::WatchStream,
};

/// Any typed API resource which can be handled by the clients in this crate.
///
/// This is implemented for every `k8s-openapi` type and every type generated by
/// `#[derive(CustomResource)]`.
pub trait Object:
    Resource<DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Object for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Write operations.
#[async_trait]
pub trait WriteApi<K: Object>: Send + Sync {
    /// Creates `object` and returns it as persisted by the server.
    async fn create(&self, ctx: &Context, object: &K) -> Result<K>;

    /// Patches the object called `name`.
    ///
    /// `data` is decoded according to `patch_type`, empty data is a valid (empty) patch.
    /// `subresources` address a sub-resource of the object, e.g. `&["status"]`. An empty slice
    /// patches the object itself.
    async fn patch(
        &self,
        ctx: &Context,
        name: &str,
        patch_type: PatchType,
        data: &[u8],
        subresources: &[&str],
    ) -> Result<K>;

    /// Replaces the whole object. The name is taken from the object's metadata.
    async fn update(&self, ctx: &Context, object: &K) -> Result<K>;

    /// Deletes the object called `name`.
    async fn delete(&self, ctx: &Context, name: &str) -> Result<()>;
}

/// Status write operations.
///
/// Not all resource kinds have a status sub-resource, so this is split out from [`WriteApi`].
#[async_trait]
pub trait WriteStatusApi<K: Object>: Send + Sync {
    /// Replaces the status of the object. Changes to any other field are ignored.
    async fn update_status(&self, ctx: &Context, object: &K) -> Result<K>;
}

/// Read operations.
#[async_trait]
pub trait ReadApi<K: Object, L = ObjectList<K>>: Send + Sync {
    /// Fetches the object called `name`, or fails with a not-found error.
    async fn get(&self, ctx: &Context, name: &str) -> Result<K>;

    /// Lists all objects matching `options`.
    async fn list(&self, ctx: &Context, options: &ListOptions) -> Result<L>;

    /// Watches all objects matching `options`.
    ///
    /// The returned stream is long-lived and must be closed by the caller.
    async fn watch(&self, ctx: &Context, options: &ListOptions) -> Result<WatchStream<K>>;
}

/// Server-side apply.
#[async_trait]
pub trait ApplyApi<K: Object, A = K>: Send + Sync
where
    A: Resource + Serialize + Send + Sync,
{
    /// Declaratively merges `payload` into the object named in its metadata, creating it if
    /// needed. Fails with a conflict if another field manager owns a field the payload changes,
    /// unless [`ApplyOptions::force`] is set.
    async fn apply(&self, ctx: &Context, payload: &A, options: &ApplyOptions) -> Result<K>;
}

/// Read, write and apply operations combined.
///
/// Note that individual resource kinds may support additional operations which are not
/// covered here.
pub trait FullApi<K: Object, L = ObjectList<K>, A = K>:
    ReadApi<K, L> + WriteApi<K> + ApplyApi<K, A>
where
    A: Resource + Serialize + Send + Sync,
{
}

impl<T, K, L, A> FullApi<K, L, A> for T
where
    T: ReadApi<K, L> + WriteApi<K> + ApplyApi<K, A> + ?Sized,
    K: Object,
    A: Resource + Serialize + Send + Sync,
{
}
