//! An in-memory implementation of the client contracts.
//!
//! A [`FakeStore`] holds objects of any kind and hands out [`FakeClient`]s, which implement
//! [`ReadApi`], [`WriteApi`], [`WriteStatusApi`] and [`ApplyApi`] on top of it. It emulates the
//! parts of the API server behaviour callers usually depend on:
//!
//! - resource versions, uids, generations and `generateName`
//! - optimistic concurrency on update
//! - status sub-resource separation
//! - label and field selectors
//! - watches, including replays from a resource version
//! - server-side apply field ownership and conflicts
//!
//! ```
//! use k8s_openapi::api::core::v1::ConfigMap;
//! use kube::api::ObjectMeta;
//! use stackable_kubetypes::{Context, FakeStore, ReadApi, WriteApi};
//!
//! # #[tokio::main]
//! # async fn main() -> stackable_kubetypes::Result<()> {
//! let store = FakeStore::new();
//! let client = store.namespaced::<ConfigMap>("default");
//! let ctx = Context::background();
//!
//! let config_map = ConfigMap {
//!     metadata: ObjectMeta {
//!         name: Some("foo".to_owned()),
//!         ..ObjectMeta::default()
//!     },
//!     ..ConfigMap::default()
//! };
//! client.create(&ctx, &config_map).await?;
//!
//! let stored = client.get(&ctx, "foo").await?;
//! assert_eq!(stored.metadata.namespace.as_deref(), Some("default"));
//! # Ok(())
//! # }
//! ```
use std::{
    collections::{BTreeMap, VecDeque},
    marker::PhantomData,
    sync::Arc,
};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{
    Resource,
    api::{ObjectList, Patch},
};
use serde::Serialize;
use serde_json::{Value, json};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::{
    Mutex, MutexGuard,
    broadcast::{self, error::RecvError},
};

use self::fields::Managers;
use crate::{
    api::{ApplyApi, Object, ReadApi, WriteApi, WriteStatusApi},
    context::Context,
    error::{
        AlreadyExistsSnafu, ConflictSnafu, ContextSnafu, DecodePatchSnafu, DeserializeSnafu, Error,
        ExpiredSnafu, InvalidSelectorSnafu, InvalidSnafu, NotFoundSnafu, Operation, Result,
        SerializeSnafu,
    },
    options::{ApplyOptions, ListOptions},
    patch::{PatchType, subresource_path},
    selector::{FieldSelector, LabelSelector},
    watch::{WatchEvent, WatchStream},
};

mod fields;

/// How many changes are kept for watch replays, and how far a watcher may fall behind before
/// its watch expires.
const EVENT_CAPACITY: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ObjectKey {
    api_version: String,
    kind: String,
    namespace: Option<String>,
    name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Clone, Debug)]
struct Change {
    kind: ChangeKind,
    key: ObjectKey,
    resource_version: u64,
    object: Value,
}

#[derive(Debug)]
struct StoredObject {
    object: Value,
    managers: Managers,
}

#[derive(Debug)]
struct State {
    objects: BTreeMap<ObjectKey, StoredObject>,
    history: VecDeque<Change>,
    events: broadcast::Sender<Change>,
    resource_version: u64,
    uids: u64,
    generated_names: u64,
}

impl State {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            objects: BTreeMap::new(),
            history: VecDeque::with_capacity(EVENT_CAPACITY),
            events,
            resource_version: 0,
            uids: 0,
            generated_names: 0,
        }
    }

    fn next_uid(&mut self) -> String {
        self.uids += 1;
        format!("00000000-0000-4000-8000-{:012x}", self.uids)
    }

    fn generate_name(&mut self, key: &ObjectKey, prefix: &str) -> String {
        loop {
            self.generated_names += 1;
            let name = format!("{prefix}{:05x}", self.generated_names);
            let candidate = ObjectKey {
                name: name.clone(),
                ..key.clone()
            };

            if !self.objects.contains_key(&candidate) {
                return name;
            }
        }
    }

    /// Stores (or removes) an object under a new resource version and notifies watchers.
    fn commit(
        &mut self,
        kind: ChangeKind,
        key: ObjectKey,
        mut object: Value,
        managers: Managers,
    ) -> Value {
        self.resource_version += 1;
        fields::set_metadata(
            &mut object,
            "resourceVersion",
            Value::String(self.resource_version.to_string()),
        );

        match kind {
            ChangeKind::Deleted => {
                self.objects.remove(&key);
            }
            ChangeKind::Added | ChangeKind::Modified => {
                self.objects.insert(key.clone(), StoredObject {
                    object: object.clone(),
                    managers,
                });
            }
        }

        tracing::trace!(
            k8s.resource.kind = %key.kind,
            k8s.resource.name = %key.name,
            k8s.resource.namespace = ?key.namespace,
            resource_version = self.resource_version,
            ?kind,
            "committed change"
        );

        let change = Change {
            kind,
            key,
            resource_version: self.resource_version,
            object: object.clone(),
        };

        if self.history.len() == EVENT_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(change.clone());

        // Sending only fails if nobody is watching
        let _ = self.events.send(change);

        object
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Scope {
    Namespaced(String),
    Cluster,
    AllNamespaces,
}

impl Scope {
    fn includes(&self, namespace: Option<&str>) -> bool {
        match self {
            Self::Namespaced(scope) => namespace == Some(scope.as_str()),
            Self::Cluster => namespace.is_none(),
            Self::AllNamespaces => true,
        }
    }

    /// The namespace of objects addressed by name only.
    fn namespace(&self) -> Option<String> {
        match self {
            Self::Namespaced(namespace) => Some(namespace.clone()),
            Self::Cluster | Self::AllNamespaces => None,
        }
    }

    /// Determines the namespace a submitted object is stored in.
    fn resolve(&self, submitted: Option<&str>) -> Result<Option<String>, String> {
        let submitted = submitted.filter(|namespace| !namespace.is_empty());

        match (self, submitted) {
            (Self::Namespaced(scope), Some(submitted)) if submitted != scope.as_str() => {
                Err(format!(
                    "the namespace of the object ({submitted}) does not match the namespace of \
                     the client ({scope})"
                ))
            }
            (Self::Namespaced(scope), _) => Ok(Some(scope.clone())),
            (Self::Cluster, _) => Ok(None),
            (Self::AllNamespaces, submitted) => Ok(submitted.map(str::to_owned)),
        }
    }
}

/// Decides which stored objects a list or watch call returns.
#[derive(Clone, Debug)]
struct Filter {
    api_version: String,
    kind: String,
    scope: Scope,
    labels: LabelSelector,
    fields: FieldSelector,
}

impl Filter {
    fn matches(&self, key: &ObjectKey, object: &Value) -> bool {
        key.api_version == self.api_version
            && key.kind == self.kind
            && self.scope.includes(key.namespace.as_deref())
            && self.labels.matches(&fields::labels(object))
            && self.fields.matches(object)
    }
}

struct Subscription {
    receiver: broadcast::Receiver<Change>,
    filter: Filter,
    since: u64,
}

/// Shared in-memory object storage.
///
/// Cloning the store is cheap, all clones (and the clients handed out by them) see the same
/// objects.
#[derive(Clone, Debug)]
pub struct FakeStore {
    state: Arc<Mutex<State>>,
}

impl Default for FakeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new())),
        }
    }

    /// Returns a client for namespaced objects of kind `K` in `namespace`.
    pub fn namespaced<K>(&self, namespace: &str) -> FakeClient<K>
    where
        K: Object + Resource<Scope = NamespaceResourceScope>,
    {
        FakeClient::new(self.clone(), Scope::Namespaced(namespace.to_owned()))
    }

    /// Returns a client for cluster-scoped objects of kind `K`.
    pub fn cluster_scoped<K>(&self) -> FakeClient<K>
    where
        K: Object + Resource<Scope = ClusterResourceScope>,
    {
        FakeClient::new(self.clone(), Scope::Cluster)
    }

    /// Returns a client which lists and watches objects of kind `K` across all namespaces.
    ///
    /// Objects written through it are stored in the namespace their metadata names. Objects
    /// addressed by name only are looked up without a namespace.
    pub fn all_namespaces<K: Object>(&self) -> FakeClient<K> {
        FakeClient::new(self.clone(), Scope::AllNamespaces)
    }

    /// Returns the resource version of the latest change.
    pub async fn resource_version(&self) -> String {
        self.state.lock().await.resource_version.to_string()
    }
}

/// Implements the client contracts for the resource kind `K` on top of a [`FakeStore`].
pub struct FakeClient<K> {
    store: FakeStore,
    scope: Scope,
    field_manager: Option<String>,
    kind: PhantomData<fn() -> K>,
}

impl<K> Clone for FakeClient<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            scope: self.scope.clone(),
            field_manager: self.field_manager.clone(),
            kind: PhantomData,
        }
    }
}

impl<K: Object> FakeClient<K> {
    fn new(store: FakeStore, scope: Scope) -> Self {
        Self {
            store,
            scope,
            field_manager: None,
            kind: PhantomData,
        }
    }

    /// Records `field_manager` as the owner of fields changed by create, update and patch
    /// calls. It is also required for patches of type [`PatchType::Apply`].
    pub fn with_field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = Some(field_manager.into());
        self
    }

    fn resource() -> String {
        K::kind(&()).into_owned()
    }

    fn key(namespace: Option<String>, name: &str) -> ObjectKey {
        ObjectKey {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            namespace,
            name: name.to_owned(),
        }
    }

    /// Locks the store, unless `ctx` is done first.
    async fn lock(&self, ctx: &Context, operation: Operation) -> Result<MutexGuard<'_, State>> {
        ctx.run(self.store.state.lock())
            .await
            .context(ContextSnafu {
                operation,
                resource: Self::resource(),
            })
    }

    fn invalid(operation: Operation, message: impl Into<String>) -> Error {
        Error::Invalid {
            operation,
            resource: Self::resource(),
            message: message.into(),
        }
    }

    fn not_found(name: &str) -> Error {
        Error::NotFound {
            resource: Self::resource(),
            name: name.to_owned(),
        }
    }

    fn encode<T: Serialize>(object: &T, operation: Operation) -> Result<Value> {
        serde_json::to_value(object).context(SerializeSnafu {
            operation,
            resource: Self::resource(),
        })
    }

    fn decode(object: Value, operation: Operation) -> Result<K> {
        serde_json::from_value(object).context(DeserializeSnafu {
            operation,
            resource: Self::resource(),
        })
    }

    /// Round-trips a modified object through `K`, rejecting modifications which do not fit the
    /// schema.
    fn normalize(object: Value, operation: Operation) -> Result<Value> {
        let typed: K = serde_json::from_value(object)
            .map_err(|error| Self::invalid(operation, error.to_string()))?;
        Self::encode(&typed, operation)
    }

    fn object_name<T: Resource>(object: &T, operation: Operation) -> Result<String> {
        object
            .meta()
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .context(InvalidSnafu {
                operation,
                resource: Self::resource(),
                message: "object has no name",
            })
    }

    fn resolve_namespace(
        &self,
        submitted: Option<&str>,
        operation: Operation,
    ) -> Result<Option<String>> {
        self.scope
            .resolve(submitted)
            .map_err(|message| Self::invalid(operation, message))
    }

    fn filter(&self, options: &ListOptions, operation: Operation) -> Result<Filter> {
        let labels = LabelSelector::parse(&options.label_selector).context(InvalidSelectorSnafu {
            operation,
            resource: Self::resource(),
        })?;
        let fields = FieldSelector::parse(&options.field_selector).context(InvalidSelectorSnafu {
            operation,
            resource: Self::resource(),
        })?;

        Ok(Filter {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            scope: self.scope.clone(),
            labels,
            fields,
        })
    }

    /// Rejects writes based on an outdated version of the object. Writes without a resource
    /// version are unconditional.
    fn check_resource_version(
        submitted: Option<&str>,
        current: &Value,
        operation: Operation,
        name: &str,
    ) -> Result<()> {
        match submitted {
            Some(submitted)
                if !submitted.is_empty()
                    && Some(submitted) != fields::metadata_str(current, "resourceVersion") =>
            {
                ConflictSnafu {
                    operation,
                    resource: Self::resource(),
                    name,
                    message: "the object has been modified, apply your changes to the latest \
                              version and try again",
                }
                .fail()
            }
            _ => Ok(()),
        }
    }

    fn event(change: Change) -> Result<WatchEvent<K>> {
        let object = Self::decode(change.object, Operation::Watch)?;

        Ok(match change.kind {
            ChangeKind::Added => WatchEvent::Added(object),
            ChangeKind::Modified => WatchEvent::Modified(object),
            ChangeKind::Deleted => WatchEvent::Deleted(object),
        })
    }

    /// Server-side apply of `payload` to the object at `key`, with the store already locked.
    fn apply_locked(
        state: &mut State,
        operation: Operation,
        key: ObjectKey,
        mut payload: Value,
        options: &ApplyOptions,
    ) -> Result<K> {
        let manager = options.field_manager.as_str();
        ensure!(!manager.is_empty(), InvalidSnafu {
            operation,
            resource: Self::resource(),
            message: "apply requires a field manager",
        });

        fields::set_metadata(&mut payload, "name", Value::String(key.name.clone()));
        match &key.namespace {
            Some(namespace) => {
                fields::set_metadata(&mut payload, "namespace", Value::String(namespace.clone()))
            }
            None => fields::remove_metadata(&mut payload, "namespace"),
        }
        // Apply targets the main resource, the status sub-resource is left alone
        fields::set_status(&mut payload, None);
        let applied = fields::managed_paths(&payload);

        let Some(stored) = state.objects.get(&key) else {
            // Applying to an absent object creates it
            let mut object = payload;
            fields::remove_metadata(&mut object, "resourceVersion");
            fields::remove_metadata(&mut object, "managedFields");
            fields::set_metadata(&mut object, "generation", Value::from(1));
            let mut object = Self::normalize(object, operation)?;

            if options.dry_run {
                return Self::decode(object, operation);
            }

            fields::set_metadata(&mut object, "uid", Value::String(state.next_uid()));
            let mut managers = Managers::from([(manager.to_owned(), applied)]);
            fields::prune(&mut managers, &object);

            let object = state.commit(ChangeKind::Added, key, object, managers);
            return Self::decode(object, operation);
        };

        let conflicts =
            fields::conflicts(&stored.managers, manager, &stored.object, &payload, &applied);
        if !conflicts.is_empty() && !options.force {
            return ConflictSnafu {
                operation,
                resource: Self::resource(),
                name: &key.name,
                message: fields::describe_conflicts(&conflicts),
            }
            .fail();
        }

        let current = stored.object.clone();
        let mut managers = stored.managers.clone();
        for conflict in &conflicts {
            if let Some(owned) = managers.get_mut(&conflict.manager) {
                owned.remove(&conflict.path);
            }
        }

        // Fields the manager applied before but left out this time are removed, unless someone
        // else also owns them
        let mut next = current.clone();
        let mut owned = applied;
        if let Some(previous) = managers.get(manager) {
            for path in previous.difference(&owned) {
                let shared = managers
                    .iter()
                    .any(|(other, owned)| other != manager && owned.contains(path));
                if !shared && !fields::is_status(path) {
                    fields::remove(&mut next, path);
                }
            }
            // Status fields written by this manager through the status sub-resource stay owned
            let status = previous
                .iter()
                .filter(|path| fields::is_status(path))
                .cloned()
                .collect::<Vec<_>>();
            owned.extend(status);
        }

        fields::merge(&mut next, &payload);
        fields::set_status(&mut next, fields::status(&current));
        fields::carry_identity(&mut next, &current);
        let mut next = Self::normalize(next, operation)?;
        fields::bump_generation(&mut next, &current);

        managers.insert(manager.to_owned(), owned);
        fields::prune(&mut managers, &next);

        if options.dry_run {
            return Self::decode(next, operation);
        }

        if next == current {
            // Nothing changed, only the ownership may have moved
            if let Some(stored) = state.objects.get_mut(&key) {
                stored.managers = managers;
            }
            return Self::decode(current, operation);
        }

        let object = state.commit(ChangeKind::Modified, key, next, managers);
        Self::decode(object, operation)
    }
}

#[async_trait]
impl<K: Object> WriteApi<K> for FakeClient<K> {
    async fn create(&self, ctx: &Context, object: &K) -> Result<K> {
        let operation = Operation::Create;
        let mut state = self.lock(ctx, operation).await?;

        let meta = object.meta();
        let namespace = self.resolve_namespace(meta.namespace.as_deref(), operation)?;
        let name = match (meta.name.as_deref(), meta.generate_name.as_deref()) {
            (Some(name), _) if !name.is_empty() => name.to_owned(),
            (_, Some(prefix)) if !prefix.is_empty() => {
                state.generate_name(&Self::key(namespace.clone(), ""), prefix)
            }
            _ => return Err(Self::invalid(operation, "name or generateName is required")),
        };

        let key = Self::key(namespace.clone(), &name);
        ensure!(!state.objects.contains_key(&key), AlreadyExistsSnafu {
            resource: Self::resource(),
            name: &name,
        });

        let mut object = Self::encode(object, operation)?;
        fields::set_metadata(&mut object, "name", Value::String(name));
        match namespace {
            Some(namespace) => {
                fields::set_metadata(&mut object, "namespace", Value::String(namespace))
            }
            None => fields::remove_metadata(&mut object, "namespace"),
        }
        fields::set_metadata(&mut object, "uid", Value::String(state.next_uid()));
        fields::set_metadata(&mut object, "generation", Value::from(1));
        fields::remove_metadata(&mut object, "resourceVersion");
        fields::remove_metadata(&mut object, "managedFields");

        let mut managers = Managers::new();
        fields::record_update(&mut managers, self.field_manager.as_deref(), None, &object);

        let object = state.commit(ChangeKind::Added, key, object, managers);
        Self::decode(object, operation)
    }

    async fn patch(
        &self,
        ctx: &Context,
        name: &str,
        patch_type: PatchType,
        data: &[u8],
        subresources: &[&str],
    ) -> Result<K> {
        let operation = Operation::Patch;
        let mut state = self.lock(ctx, operation).await?;

        let patch = patch_type
            .decode(data)
            .context(DecodePatchSnafu { patch_type })?;
        let status_only = match subresource_path(subresources).as_deref() {
            None => false,
            Some("status") => true,
            Some(other) => {
                return Err(Self::invalid(
                    operation,
                    format!("unsupported sub-resource {other:?}"),
                ));
            }
        };

        let key = Self::key(self.scope.namespace(), name);
        let patch = match patch {
            Patch::Apply(payload) => {
                let field_manager = self.field_manager.clone().context(InvalidSnafu {
                    operation,
                    resource: Self::resource(),
                    message: "apply patches require a field manager",
                })?;
                ensure!(!status_only, InvalidSnafu {
                    operation,
                    resource: Self::resource(),
                    message: "apply patches are not supported for the status sub-resource",
                });

                return Self::apply_locked(
                    &mut state,
                    operation,
                    key,
                    payload,
                    &ApplyOptions::new(field_manager),
                );
            }
            patch => patch,
        };

        let stored = state.objects.get(&key).ok_or_else(|| Self::not_found(name))?;
        let current = &stored.object;
        let mut next = current.clone();

        match patch {
            Patch::Json(patch) => json_patch::patch(&mut next, &patch.0)
                .map_err(|error| Self::invalid(operation, error.to_string()))?,
            Patch::Merge(patch) => json_patch::merge(&mut next, &patch),
            Patch::Strategic(patch) => {
                json_patch::merge(&mut next, &fields::strip_directives(patch))
            }
            _ => return Err(Self::invalid(operation, "unsupported patch type")),
        }

        if status_only {
            let status = fields::status(&next);
            next = current.clone();
            fields::set_status(&mut next, status);
        } else {
            fields::set_status(&mut next, fields::status(current));
        }

        fields::carry_identity(&mut next, current);
        let mut next = Self::normalize(next, operation)?;
        fields::bump_generation(&mut next, current);

        let mut managers = stored.managers.clone();
        fields::record_update(
            &mut managers,
            self.field_manager.as_deref(),
            Some(current),
            &next,
        );

        let object = state.commit(ChangeKind::Modified, key, next, managers);
        Self::decode(object, operation)
    }

    async fn update(&self, ctx: &Context, object: &K) -> Result<K> {
        let operation = Operation::Update;
        let mut state = self.lock(ctx, operation).await?;

        let name = Self::object_name(object, operation)?;
        let namespace = self.resolve_namespace(object.meta().namespace.as_deref(), operation)?;
        let key = Self::key(namespace, &name);

        let stored = state.objects.get(&key).ok_or_else(|| Self::not_found(&name))?;
        let current = &stored.object;
        Self::check_resource_version(
            object.meta().resource_version.as_deref(),
            current,
            operation,
            &name,
        )?;

        let mut next = Self::encode(object, operation)?;
        fields::set_status(&mut next, fields::status(current));
        fields::carry_identity(&mut next, current);
        fields::bump_generation(&mut next, current);

        let mut managers = stored.managers.clone();
        fields::record_update(
            &mut managers,
            self.field_manager.as_deref(),
            Some(current),
            &next,
        );

        let object = state.commit(ChangeKind::Modified, key, next, managers);
        Self::decode(object, operation)
    }

    async fn delete(&self, ctx: &Context, name: &str) -> Result<()> {
        let operation = Operation::Delete;
        let mut state = self.lock(ctx, operation).await?;

        let key = Self::key(self.scope.namespace(), name);
        let object = state
            .objects
            .get(&key)
            .map(|stored| stored.object.clone())
            .ok_or_else(|| Self::not_found(name))?;

        state.commit(ChangeKind::Deleted, key, object, Managers::new());
        Ok(())
    }
}

#[async_trait]
impl<K: Object> WriteStatusApi<K> for FakeClient<K> {
    async fn update_status(&self, ctx: &Context, object: &K) -> Result<K> {
        let operation = Operation::UpdateStatus;
        let mut state = self.lock(ctx, operation).await?;

        let name = Self::object_name(object, operation)?;
        let namespace = self.resolve_namespace(object.meta().namespace.as_deref(), operation)?;
        let key = Self::key(namespace, &name);

        let stored = state.objects.get(&key).ok_or_else(|| Self::not_found(&name))?;
        let current = &stored.object;
        Self::check_resource_version(
            object.meta().resource_version.as_deref(),
            current,
            operation,
            &name,
        )?;

        let submitted = Self::encode(object, operation)?;
        let mut next = current.clone();
        fields::set_status(&mut next, fields::status(&submitted));

        let mut managers = stored.managers.clone();
        fields::record_update(
            &mut managers,
            self.field_manager.as_deref(),
            Some(current),
            &next,
        );

        let object = state.commit(ChangeKind::Modified, key, next, managers);
        Self::decode(object, operation)
    }
}

#[async_trait]
impl<K: Object> ReadApi<K> for FakeClient<K> {
    async fn get(&self, ctx: &Context, name: &str) -> Result<K> {
        let operation = Operation::Get;
        let state = self.lock(ctx, operation).await?;

        let stored = state
            .objects
            .get(&Self::key(self.scope.namespace(), name))
            .ok_or_else(|| Self::not_found(name))?;
        Self::decode(stored.object.clone(), operation)
    }

    async fn list(&self, ctx: &Context, options: &ListOptions) -> Result<ObjectList<K>> {
        let operation = Operation::List;
        let state = self.lock(ctx, operation).await?;
        let filter = self.filter(options, operation)?;

        let items = state
            .objects
            .iter()
            .filter(|(key, stored)| filter.matches(key, &stored.object))
            .map(|(_, stored)| stored.object.clone())
            .collect::<Vec<_>>();

        let list = json!({
            "apiVersion": K::api_version(&()),
            "kind": format!("{}List", K::kind(&())),
            "metadata": {"resourceVersion": state.resource_version.to_string()},
            "items": items,
        });
        serde_json::from_value(list).context(DeserializeSnafu {
            operation,
            resource: Self::resource(),
        })
    }

    async fn watch(&self, ctx: &Context, options: &ListOptions) -> Result<WatchStream<K>> {
        let operation = Operation::Watch;
        let state = self.lock(ctx, operation).await?;
        let filter = self.filter(options, operation)?;

        let requested = match options.resource_version.as_deref() {
            None | Some("" | "0") => None,
            Some(version) => Some(version.parse::<u64>().map_err(|_| {
                Self::invalid(operation, format!("invalid resource version {version:?}"))
            })?),
        };

        let (initial, since) = match requested {
            // Without a starting point the current state is sent first
            None => {
                let initial = state
                    .objects
                    .iter()
                    .filter(|(key, stored)| filter.matches(key, &stored.object))
                    .map(|(key, stored)| Change {
                        kind: ChangeKind::Added,
                        key: key.clone(),
                        resource_version: state.resource_version,
                        object: stored.object.clone(),
                    })
                    .collect::<Vec<_>>();
                (initial, state.resource_version)
            }
            Some(since) => {
                ensure!(
                    since <= state.resource_version,
                    ExpiredSnafu {
                        operation,
                        resource: Self::resource(),
                        message: format!(
                            "too large resource version: {since}, current: {}",
                            state.resource_version
                        ),
                    }
                );

                if let Some(oldest) = state.history.front() {
                    let oldest = oldest.resource_version;
                    ensure!(
                        oldest <= since.saturating_add(1),
                        ExpiredSnafu {
                            operation,
                            resource: Self::resource(),
                            message: format!(
                                "too old resource version: {since} ({})",
                                oldest - 1
                            ),
                        }
                    );
                }

                let replay = state
                    .history
                    .iter()
                    .filter(|change| change.resource_version > since)
                    .filter(|change| filter.matches(&change.key, &change.object))
                    .cloned()
                    .collect::<Vec<_>>();
                (replay, since)
            }
        };

        let subscription = Subscription {
            receiver: state.events.subscribe(),
            filter,
            since,
        };
        drop(state);

        let live = stream::unfold(Some(subscription), |subscription| async move {
            let mut subscription = subscription?;
            loop {
                match subscription.receiver.recv().await {
                    Ok(change)
                        if change.resource_version > subscription.since
                            && subscription.filter.matches(&change.key, &change.object) =>
                    {
                        return Some((Self::event(change), Some(subscription)));
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(
                            k8s.resource.kind = %Self::resource(),
                            skipped,
                            "watcher fell behind, expiring watch"
                        );
                        let expired = ExpiredSnafu {
                            operation: Operation::Watch,
                            resource: Self::resource(),
                            message: format!("watch fell behind by {skipped} events"),
                        }
                        .fail();
                        return Some((expired, None));
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        let events = stream::iter(initial.into_iter().map(Self::event)).chain(live);
        Ok(WatchStream::new(ctx, events))
    }
}

#[async_trait]
impl<K, A> ApplyApi<K, A> for FakeClient<K>
where
    K: Object,
    A: Resource + Serialize + Send + Sync,
{
    async fn apply(&self, ctx: &Context, payload: &A, options: &ApplyOptions) -> Result<K> {
        let operation = Operation::Apply;
        let mut state = self.lock(ctx, operation).await?;

        let name = Self::object_name(payload, operation)?;
        let namespace = self.resolve_namespace(payload.meta().namespace.as_deref(), operation)?;
        let payload = Self::encode(payload, operation)?;

        Self::apply_locked(
            &mut state,
            operation,
            Self::key(namespace, &name),
            payload,
            options,
        )
    }
}
