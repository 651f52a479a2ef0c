use std::{fmt::Display, future::Future, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{
    Api, Resource,
    api::{
        DeleteParams, ListParams, ObjectList, Patch, PatchParams, PostParams,
        WatchEvent as KubeWatchEvent, WatchParams,
    },
};
use serde::Serialize;
use snafu::{OptionExt, ResultExt, ensure};

use crate::{
    api::{ApplyApi, Object, ReadApi, WriteApi, WriteStatusApi},
    context::Context,
    error::{
        ContextSnafu, DecodePatchSnafu, Error, InvalidSnafu, Operation, Result, SerializeSnafu,
    },
    options::{ApplyOptions, ClientOptions, ListOptions},
    patch::{PatchType, subresource_path},
    watch::{WatchEvent, WatchStream},
};

/// This `Client` can be used to access Kubernetes.
/// It wraps an underlying [`kube::Client`] and hands out [`TypedClient`]s, which implement the
/// capability contracts for a single resource kind.
#[derive(Clone)]
pub struct Client {
    client: kube::Client,
    options: ClientOptions,
}

impl Client {
    pub fn new(client: kube::Client, options: ClientOptions) -> Self {
        Self { client, options }
    }

    /// Returns a [`kube::Client`] that can be freely used.
    /// It does not need to be cloned before first use.
    pub fn as_kube_client(&self) -> kube::Client {
        self.client.clone()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Returns a client for namespaced objects of kind `K` in `namespace`.
    pub fn namespaced<K>(&self, namespace: &str) -> TypedClient<K>
    where
        K: Object + Resource<Scope = NamespaceResourceScope>,
    {
        TypedClient::new(Api::namespaced(self.client.clone(), namespace), &self.options)
    }

    /// Returns a client for namespaced objects of kind `K` in the namespace the underlying
    /// [`kube::Client`] was configured with.
    pub fn default_namespaced<K>(&self) -> TypedClient<K>
    where
        K: Object + Resource<Scope = NamespaceResourceScope>,
    {
        TypedClient::new(Api::default_namespaced(self.client.clone()), &self.options)
    }

    /// Returns a client for cluster-scoped objects of kind `K`.
    pub fn cluster_scoped<K>(&self) -> TypedClient<K>
    where
        K: Object + Resource<Scope = ClusterResourceScope>,
    {
        TypedClient::new(Api::all(self.client.clone()), &self.options)
    }

    /// Returns a client for objects of kind `K` across all namespaces.
    ///
    /// Such a client is only useful for reading. Writes to namespaced kinds are rejected by the
    /// API server.
    pub fn all_namespaces<K: Object>(&self) -> TypedClient<K> {
        TypedClient::new(Api::all(self.client.clone()), &self.options)
    }
}

/// Implements [`ReadApi`], [`WriteApi`], [`WriteStatusApi`] and [`ApplyApi`] for the resource
/// kind `K` on top of [`kube::Api`].
#[derive(Clone)]
pub struct TypedClient<K> {
    api: Api<K>,
    post_params: PostParams,
    patch_params: PatchParams,
    delete_params: DeleteParams,
    request_timeout: Option<Duration>,
}

impl<K: Object> TypedClient<K> {
    pub fn new(api: Api<K>, options: &ClientOptions) -> Self {
        Self {
            api,
            post_params: options.post_params(),
            patch_params: options.patch_params(),
            delete_params: options.delete_params(),
            request_timeout: options.request_timeout,
        }
    }

    /// Returns the underlying [`Api`] for operations not covered by the contracts.
    pub fn api(&self) -> &Api<K> {
        &self.api
    }

    fn resource() -> String {
        K::kind(&()).into_owned()
    }

    /// Fails if `ctx` is already done, before any validation of the request.
    fn check(ctx: &Context, operation: Operation) -> Result<()> {
        match ctx.err() {
            Some(source) => Err(source).context(ContextSnafu {
                operation,
                resource: Self::resource(),
            }),
            None => Ok(()),
        }
    }

    /// Issues `request` under `ctx`, bounded by the configured request timeout.
    async fn call<T, F>(
        &self,
        ctx: &Context,
        operation: Operation,
        name: &str,
        request: F,
    ) -> Result<T>
    where
        F: Future<Output = kube::Result<T>> + Send,
        T: Send,
    {
        let resource = Self::resource();
        let ctx = match self.request_timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };

        let result = ctx.run(request).await.context(ContextSnafu {
            operation,
            resource: resource.clone(),
        })?;

        match result {
            Ok(output) => {
                tracing::debug!(
                    k8s.resource.kind = %resource,
                    k8s.resource.name = name,
                    %operation,
                    "request succeeded"
                );
                Ok(output)
            }
            Err(source) => {
                let error = Error::from_kube(source, operation, &resource, name);
                tracing::debug!(
                    k8s.resource.kind = %resource,
                    k8s.resource.name = name,
                    %operation,
                    error = &error as &dyn std::error::Error,
                    "request failed"
                );
                Err(error)
            }
        }
    }
}

fn object_name<K: Resource>(
    object: &K,
    operation: Operation,
    resource: impl Display,
) -> Result<String> {
    object.meta().name.clone().context(InvalidSnafu {
        operation,
        resource: resource.to_string(),
        message: "object has no name",
    })
}

#[async_trait]
impl<K: Object> WriteApi<K> for TypedClient<K> {
    async fn create(&self, ctx: &Context, object: &K) -> Result<K> {
        // The name may be empty if the server is asked to generate one
        let name = object.meta().name.clone().unwrap_or_default();
        let request = self.api.create(&self.post_params, object);
        self.call(ctx, Operation::Create, &name, request).await
    }

    async fn patch(
        &self,
        ctx: &Context,
        name: &str,
        patch_type: PatchType,
        data: &[u8],
        subresources: &[&str],
    ) -> Result<K> {
        Self::check(ctx, Operation::Patch)?;
        ensure!(
            patch_type != PatchType::Apply || self.patch_params.field_manager.is_some(),
            InvalidSnafu {
                operation: Operation::Patch,
                resource: Self::resource(),
                message: "apply patches require a field manager",
            }
        );

        let patch = patch_type
            .decode(data)
            .context(DecodePatchSnafu { patch_type })?;

        match subresource_path(subresources) {
            None => {
                let request = self.api.patch(name, &self.patch_params, &patch);
                self.call(ctx, Operation::Patch, name, request).await
            }
            Some(subresource) => {
                let request = self
                    .api
                    .patch_subresource(&subresource, name, &self.patch_params, &patch);
                self.call(ctx, Operation::Patch, name, request).await
            }
        }
    }

    async fn update(&self, ctx: &Context, object: &K) -> Result<K> {
        Self::check(ctx, Operation::Update)?;
        let name = object_name(object, Operation::Update, Self::resource())?;
        let request = self.api.replace(&name, &self.post_params, object);
        self.call(ctx, Operation::Update, &name, request).await
    }

    async fn delete(&self, ctx: &Context, name: &str) -> Result<()> {
        // Depending on the resource kind the server returns either the deleted object or a
        // Status, neither of which is of interest here.
        let request = self.api.delete(name, &self.delete_params);
        self.call(ctx, Operation::Delete, name, request)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl<K: Object> WriteStatusApi<K> for TypedClient<K> {
    async fn update_status(&self, ctx: &Context, object: &K) -> Result<K> {
        Self::check(ctx, Operation::UpdateStatus)?;
        let name = object_name(object, Operation::UpdateStatus, Self::resource())?;

        let request = self
            .api
            .replace_subresource("status", &name, &self.post_params, object);
        self.call(ctx, Operation::UpdateStatus, &name, request).await
    }
}

#[async_trait]
impl<K: Object> ReadApi<K> for TypedClient<K> {
    async fn get(&self, ctx: &Context, name: &str) -> Result<K> {
        self.call(ctx, Operation::Get, name, self.api.get(name)).await
    }

    async fn list(&self, ctx: &Context, options: &ListOptions) -> Result<ObjectList<K>> {
        let params = ListParams::from(options);
        self.call(ctx, Operation::List, "", self.api.list(&params)).await
    }

    async fn watch(&self, ctx: &Context, options: &ListOptions) -> Result<WatchStream<K>> {
        let params = WatchParams::from(options);
        let version = options.resource_version.as_deref().unwrap_or("0");

        // Only establishing the watch is subject to the request timeout, the stream itself
        // lives as long as ctx does.
        let events = self
            .call(ctx, Operation::Watch, "", self.api.watch(&params, version))
            .await?;

        let resource = Self::resource();
        let events = events.map(move |event| match event {
            Ok(KubeWatchEvent::Added(object)) => Ok(WatchEvent::Added(object)),
            Ok(KubeWatchEvent::Modified(object)) => Ok(WatchEvent::Modified(object)),
            Ok(KubeWatchEvent::Deleted(object)) => Ok(WatchEvent::Deleted(object)),
            Ok(KubeWatchEvent::Bookmark(bookmark)) => Ok(WatchEvent::Bookmark {
                resource_version: bookmark.metadata.resource_version,
            }),
            Ok(KubeWatchEvent::Error(status)) => Err(Error::from_status(
                Operation::Watch,
                &resource,
                "",
                status.code,
                &status.reason,
                &status.message,
            )),
            Err(source) => Err(Error::from_kube(source, Operation::Watch, &resource, "")),
        });

        tracing::debug!(
            k8s.resource.kind = %Self::resource(),
            k8s.label_selector = %options.label_selector,
            k8s.field_selector = %options.field_selector,
            "watch established"
        );

        Ok(WatchStream::new(ctx, events))
    }
}

#[async_trait]
impl<K, A> ApplyApi<K, A> for TypedClient<K>
where
    K: Object,
    A: Resource + Serialize + Send + Sync,
{
    async fn apply(&self, ctx: &Context, payload: &A, options: &ApplyOptions) -> Result<K> {
        Self::check(ctx, Operation::Apply)?;
        ensure!(
            !options.field_manager.is_empty(),
            InvalidSnafu {
                operation: Operation::Apply,
                resource: Self::resource(),
                message: "apply requires a field manager",
            }
        );

        let name = object_name(payload, Operation::Apply, Self::resource())?;
        let payload = serde_json::to_value(payload).context(SerializeSnafu {
            operation: Operation::Apply,
            resource: Self::resource(),
        })?;

        let mut params = PatchParams::from(options);
        params.dry_run |= self.patch_params.dry_run;

        let patch = Patch::Apply(payload);
        let request = self.api.patch(&name, &params, &patch);
        self.call(ctx, Operation::Apply, &name, request).await
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use http::{Method, Request, Response};
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::{api::ObjectMeta, client::Body};
    use serde_json::json;
    use tower_test::mock::{self, Handle};

    use super::*;
    use crate::error::ErrorKind;

    type MockHandle = Handle<Request<Body>, Response<Body>>;

    fn mock_client(options: ClientOptions) -> (Client, MockHandle) {
        let (service, handle) = mock::pair::<Request<Body>, Response<Body>>();
        let client = kube::Client::new(service, "default");
        (Client::new(client, options), handle)
    }

    async fn respond(handle: &mut MockHandle, status: u16, body: Vec<u8>) -> Request<Body> {
        let (request, send) = handle.next_request().await.expect("service not called");
        send.send_response(Response::builder().status(status).body(Body::from(body)).unwrap());
        request
    }

    fn config_map_json(name: &str) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "default", "resourceVersion": "1"},
            "data": {"foo": "bar"}
        })
    }

    fn status_json(code: u16, reason: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("request failed with {reason}"),
            "reason": reason,
            "code": code
        }))
        .unwrap()
    }

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("default".to_owned()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    #[tokio::test]
    async fn get_fetches_object() {
        let (client, mut handle) = mock_client(ClientOptions::default());
        let server = tokio::spawn(async move {
            let body = serde_json::to_vec(&config_map_json("foo")).unwrap();
            let request = respond(&mut handle, 200, body).await;

            assert_eq!(request.method(), Method::GET);
            assert_eq!(
                request.uri().path(),
                "/api/v1/namespaces/default/configmaps/foo"
            );
        });

        let config_map = client
            .namespaced::<ConfigMap>("default")
            .get(&Context::background(), "foo")
            .await
            .unwrap();

        assert_eq!(config_map.metadata.name.as_deref(), Some("foo"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let (client, mut handle) = mock_client(ClientOptions::default());
        let server = tokio::spawn(async move {
            respond(&mut handle, 404, status_json(404, "NotFound")).await;
        });

        let error = client
            .namespaced::<ConfigMap>("default")
            .get(&Context::background(), "missing")
            .await
            .unwrap_err();

        assert!(error.is_not_found(), "unexpected error: {error}");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn create_of_existing_object_conflicts() {
        let (client, mut handle) = mock_client(ClientOptions {
            field_manager: Some("tester".to_owned()),
            ..ClientOptions::default()
        });
        let server = tokio::spawn(async move {
            let request = respond(&mut handle, 409, status_json(409, "AlreadyExists")).await;

            assert_eq!(request.method(), Method::POST);
            assert!(
                request
                    .uri()
                    .query()
                    .unwrap_or_default()
                    .contains("fieldManager=tester")
            );
        });

        let error = client
            .namespaced::<ConfigMap>("default")
            .create(&Context::background(), &config_map("foo"))
            .await
            .unwrap_err();

        assert!(error.is_already_exists());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_context_fails_without_request() {
        let (client, _handle) = mock_client(ClientOptions::default());
        let client = client.namespaced::<ConfigMap>("default");
        let ctx = Context::background();
        ctx.cancel();

        // Invalid requests still report the cancellation first
        let nameless = ConfigMap::default();

        let errors = [
            client.create(&ctx, &config_map("foo")).await.unwrap_err(),
            client
                .patch(&ctx, "foo", PatchType::Json, b"{", &[])
                .await
                .unwrap_err(),
            client
                .patch(&ctx, "foo", PatchType::Apply, b"", &[])
                .await
                .unwrap_err(),
            client.update(&ctx, &nameless).await.unwrap_err(),
            client.delete(&ctx, "foo").await.unwrap_err(),
            client.update_status(&ctx, &nameless).await.unwrap_err(),
            client.get(&ctx, "foo").await.unwrap_err(),
            client.list(&ctx, &ListOptions::default()).await.unwrap_err(),
            client
                .watch(&ctx, &ListOptions::default())
                .await
                .err()
                .expect("watch must fail"),
            client
                .apply(&ctx, &nameless, &ApplyOptions::default())
                .await
                .unwrap_err(),
        ];

        for error in errors {
            assert_eq!(error.kind(), ErrorKind::Cancelled, "unexpected error: {error}");
        }
    }

    #[tokio::test]
    async fn update_replaces_object_by_name() {
        let (client, mut handle) = mock_client(ClientOptions::default());
        let server = tokio::spawn(async move {
            let body = serde_json::to_vec(&config_map_json("foo")).unwrap();
            let request = respond(&mut handle, 200, body).await;

            assert_eq!(request.method(), Method::PUT);
            assert_eq!(
                request.uri().path(),
                "/api/v1/namespaces/default/configmaps/foo"
            );
        });

        let updated = client
            .namespaced::<ConfigMap>("default")
            .update(&Context::background(), &config_map("foo"))
            .await
            .unwrap();

        assert_eq!(updated.metadata.resource_version.as_deref(), Some("1"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn update_status_replaces_status_subresource() {
        let (client, mut handle) = mock_client(ClientOptions::default());
        let server = tokio::spawn(async move {
            let body = serde_json::to_vec(&config_map_json("foo")).unwrap();
            let request = respond(&mut handle, 200, body).await;

            assert_eq!(request.method(), Method::PUT);
            assert_eq!(
                request.uri().path(),
                "/api/v1/namespaces/default/configmaps/foo/status"
            );
        });

        client
            .namespaced::<ConfigMap>("default")
            .update_status(&Context::background(), &config_map("foo"))
            .await
            .unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn update_conflict_is_reported() {
        let (client, mut handle) = mock_client(ClientOptions::default());
        let server = tokio::spawn(async move {
            respond(&mut handle, 409, status_json(409, "Conflict")).await;
        });

        let error = client
            .namespaced::<ConfigMap>("default")
            .update(&Context::background(), &config_map("foo"))
            .await
            .unwrap_err();

        assert!(error.is_conflict());
        assert!(!error.is_already_exists());
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout_bounds_each_call() {
        let (client, _handle) = mock_client(ClientOptions {
            request_timeout: Some(Duration::from_secs(1)),
            ..ClientOptions::default()
        });

        let error = client
            .namespaced::<ConfigMap>("default")
            .get(&Context::background(), "foo")
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::DeadlineExceeded);
    }

    #[tokio::test]
    async fn patch_targets_subresource() {
        let (client, mut handle) = mock_client(ClientOptions::default());
        let server = tokio::spawn(async move {
            let body = serde_json::to_vec(&config_map_json("foo")).unwrap();
            let request = respond(&mut handle, 200, body).await;

            assert_eq!(request.method(), Method::PATCH);
            assert_eq!(
                request.uri().path(),
                "/api/v1/namespaces/default/configmaps/foo/status"
            );
            assert_eq!(
                request.headers()[http::header::CONTENT_TYPE],
                "application/merge-patch+json"
            );
        });

        client
            .namespaced::<ConfigMap>("default")
            .patch(
                &Context::background(),
                "foo",
                PatchType::Merge,
                br#"{"data": {"foo": "baz"}}"#,
                &["status"],
            )
            .await
            .unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_patch_is_rejected_before_sending() {
        let (client, _handle) = mock_client(ClientOptions::default());

        let error = client
            .namespaced::<ConfigMap>("default")
            .patch(&Context::background(), "foo", PatchType::Json, b"{", &[])
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn apply_patch_requires_field_manager() {
        let (client, _handle) = mock_client(ClientOptions::default());
        let client = client.namespaced::<ConfigMap>("default");

        let patch = client
            .patch(&Context::background(), "foo", PatchType::Apply, b"", &[])
            .await
            .unwrap_err();
        let apply = client
            .apply(
                &Context::background(),
                &config_map("foo"),
                &ApplyOptions::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(patch.kind(), ErrorKind::Invalid);
        assert_eq!(apply.kind(), ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn apply_sends_server_side_apply_patch() {
        let (client, mut handle) = mock_client(ClientOptions::default());
        let server = tokio::spawn(async move {
            let body = serde_json::to_vec(&config_map_json("foo")).unwrap();
            let request = respond(&mut handle, 200, body).await;
            let query = request.uri().query().unwrap_or_default().to_owned();

            assert_eq!(request.method(), Method::PATCH);
            assert_eq!(
                request.headers()[http::header::CONTENT_TYPE],
                "application/apply-patch+yaml"
            );
            assert!(query.contains("fieldManager=my-operator"));
            assert!(query.contains("force=true"));
        });

        let applied: ConfigMap = client
            .namespaced::<ConfigMap>("default")
            .apply(
                &Context::background(),
                &config_map("foo"),
                &ApplyOptions::new("my-operator").force(),
            )
            .await
            .unwrap();

        assert_eq!(applied.data.unwrap()["foo"], "bar");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn list_passes_selectors_through() {
        let (client, mut handle) = mock_client(ClientOptions::default());
        let server = tokio::spawn(async move {
            let body = serde_json::to_vec(&json!({
                "apiVersion": "v1",
                "kind": "ConfigMapList",
                "metadata": {"resourceVersion": "10"},
                "items": [config_map_json("foo"), config_map_json("bar")]
            }))
            .unwrap();
            let request = respond(&mut handle, 200, body).await;
            let query = request.uri().query().unwrap_or_default().to_owned();

            assert!(query.contains("labelSelector=app%3Dweb"));
            assert!(query.contains("fieldSelector=metadata.name%21%3Dbaz"));
        });

        let list = client
            .namespaced::<ConfigMap>("default")
            .list(
                &Context::background(),
                &ListOptions::default()
                    .with_label_selector("app=web")
                    .with_field_selector("metadata.name!=baz"),
            )
            .await
            .unwrap();

        assert_eq!(list.items.len(), 2);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn delete_discards_returned_object() {
        let (client, mut handle) = mock_client(ClientOptions::default());
        let server = tokio::spawn(async move {
            let body = serde_json::to_vec(&config_map_json("foo")).unwrap();
            let request = respond(&mut handle, 200, body).await;

            assert_eq!(request.method(), Method::DELETE);
        });

        client
            .namespaced::<ConfigMap>("default")
            .delete(&Context::background(), "foo")
            .await
            .unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn watch_maps_events() {
        let (client, mut handle) = mock_client(ClientOptions::default());
        let server = tokio::spawn(async move {
            let mut body = Vec::new();
            for event in [
                json!({"type": "ADDED", "object": config_map_json("foo")}),
                json!({"type": "DELETED", "object": config_map_json("foo")}),
            ] {
                body.extend(serde_json::to_vec(&event).unwrap());
                body.push(b'\n');
            }
            let request = respond(&mut handle, 200, body).await;

            assert!(
                request
                    .uri()
                    .query()
                    .unwrap_or_default()
                    .contains("watch=true")
            );
        });

        let mut events = client
            .namespaced::<ConfigMap>("default")
            .watch(&Context::background(), &ListOptions::default())
            .await
            .unwrap();

        assert!(matches!(
            events.next().await,
            Some(Ok(WatchEvent::Added(_)))
        ));
        assert!(matches!(
            events.next().await,
            Some(Ok(WatchEvent::Deleted(_)))
        ));
        assert!(events.next().await.is_none());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn watch_error_events_are_classified() {
        let (client, mut handle) = mock_client(ClientOptions::default());
        let server = tokio::spawn(async move {
            let status: serde_json::Value = serde_json::from_slice(&status_json(410, "Expired"))
                .unwrap();
            let mut body = serde_json::to_vec(&json!({"type": "ERROR", "object": status}))
                .unwrap();
            body.push(b'\n');
            respond(&mut handle, 200, body).await;
        });

        let mut events = client
            .namespaced::<ConfigMap>("default")
            .watch(
                &Context::background(),
                &ListOptions::default().with_resource_version("5"),
            )
            .await
            .unwrap();

        let error = events
            .next()
            .await
            .expect("the stream must yield the error")
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Expired);

        server.await.unwrap();
    }
}
