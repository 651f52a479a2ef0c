use std::path::{Path, PathBuf};

use futures::StreamExt;
use k8s_openapi::{
    NamespaceResourceScope,
    api::{
        apps::v1::Deployment,
        core::v1::{ConfigMap, Secret, Service},
    },
};
use kube::Resource;
use serde::Serialize;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_kubetypes::{
    ApplyApi, ApplyOptions, Client, Context, ListOptions, Object, PatchType, ReadApi,
    TypedClient, WatchEvent, WriteApi, WriteStatusApi,
};

use crate::cli::{Command, DEFAULT_FIELD_MANAGER, Kind};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read manifest {path:?}"))]
    ReadManifest {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse manifest {path:?}"))]
    ParseManifest {
        source: serde_yaml::Error,
        path: PathBuf,
    },

    #[snafu(display("manifest {path:?} does not specify a kind"))]
    MissingKind { path: PathBuf },

    #[snafu(display("manifest {path:?} contains the unsupported kind {kind:?}"))]
    UnsupportedKind { path: PathBuf, kind: String },

    #[snafu(display("manifest {path:?} is not a valid {kind}"))]
    InvalidManifest {
        source: serde_json::Error,
        path: PathBuf,
        kind: String,
    },

    #[snafu(display("request failed"))]
    Request { source: stackable_kubetypes::Error },

    #[snafu(display("failed to print object"))]
    Print { source: serde_yaml::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// A manifest read from disk. The `kind` field decides which client it is sent through.
#[derive(Debug, PartialEq)]
pub struct Manifest {
    pub kind: Kind,
    pub path: PathBuf,
    pub object: serde_json::Value,
}

impl Manifest {
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).context(ReadManifestSnafu { path })?;
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let object: serde_json::Value =
            serde_yaml::from_str(content).context(ParseManifestSnafu { path })?;
        let kind = object
            .get("kind")
            .and_then(serde_json::Value::as_str)
            .context(MissingKindSnafu { path })?;
        let kind = Kind::from_manifest_kind(kind).context(UnsupportedKindSnafu { path, kind })?;

        Ok(Self {
            kind,
            path: path.to_owned(),
            object,
        })
    }

    fn into_object<K: Object>(self) -> Result<K> {
        serde_json::from_value(self.object).context(InvalidManifestSnafu {
            path: self.path,
            kind: K::kind(&()),
        })
    }
}

/// A [`Command`] with its manifest loaded, ready to be sent.
#[derive(Debug)]
pub enum Action {
    Get { name: String },
    List(ListOptions),
    Watch(ListOptions),
    Delete { name: String },
    Patch {
        name: String,
        patch_type: PatchType,
        patch: String,
        subresources: Vec<String>,
    },
    Apply { manifest: Manifest, force: bool },
    UpdateStatus { manifest: Manifest },
}

impl Action {
    /// Resolves the kind targeted by `command` and loads its manifest, if any.
    pub fn load(command: Command) -> Result<(Kind, Self)> {
        Ok(match command {
            Command::Get { kind, name } => (kind, Self::Get { name }),
            Command::List { kind, selectors } => (kind, Self::List(selectors.into())),
            Command::Watch {
                kind,
                selectors,
                resource_version,
            } => {
                let mut options = ListOptions::from(selectors);
                options.resource_version = resource_version;
                (kind, Self::Watch(options))
            }
            Command::Delete { kind, name } => (kind, Self::Delete { name }),
            Command::Patch {
                kind,
                name,
                patch_type,
                patch,
                subresources,
            } => (kind, Self::Patch {
                name,
                patch_type: patch_type.into(),
                patch,
                subresources,
            }),
            Command::Apply { file, force } => {
                let manifest = Manifest::read(&file)?;
                (manifest.kind, Self::Apply { manifest, force })
            }
            Command::UpdateStatus { file } => {
                let manifest = Manifest::read(&file)?;
                (manifest.kind, Self::UpdateStatus { manifest })
            }
        })
    }

    /// Sends the action through a client for `kind` in `namespace`, or the default namespace.
    pub async fn run(
        self,
        ctx: &Context,
        client: &Client,
        kind: Kind,
        namespace: Option<&str>,
    ) -> Result<()> {
        let field_manager = client
            .options()
            .field_manager
            .as_deref()
            .unwrap_or(DEFAULT_FIELD_MANAGER);

        match kind {
            Kind::ConfigMap => {
                let client = typed::<ConfigMap>(client, namespace);
                self.run_typed(ctx, &client, field_manager).await
            }
            Kind::Secret => {
                let client = typed::<Secret>(client, namespace);
                self.run_typed(ctx, &client, field_manager).await
            }
            Kind::Service => {
                let client = typed::<Service>(client, namespace);
                self.run_typed(ctx, &client, field_manager).await
            }
            Kind::Deployment => {
                let client = typed::<Deployment>(client, namespace);
                self.run_typed(ctx, &client, field_manager).await
            }
        }
    }

    async fn run_typed<K: Object>(
        self,
        ctx: &Context,
        client: &TypedClient<K>,
        field_manager: &str,
    ) -> Result<()> {
        match self {
            Self::Get { name } => print(&client.get(ctx, &name).await.context(RequestSnafu)?),
            Self::List(options) => {
                let list = client.list(ctx, &options).await.context(RequestSnafu)?;
                print(&list.items)
            }
            Self::Watch(options) => {
                let mut events = client.watch(ctx, &options).await.context(RequestSnafu)?;
                while let Some(event) = events.next().await {
                    print_event(&event.context(RequestSnafu)?)?;
                }
                tracing::info!("watch ended");
                Ok(())
            }
            Self::Delete { name } => {
                client.delete(ctx, &name).await.context(RequestSnafu)?;
                println!("{kind} {name:?} deleted", kind = K::kind(&()));
                Ok(())
            }
            Self::Patch {
                name,
                patch_type,
                patch,
                subresources,
            } => {
                let subresources = subresources.iter().map(String::as_str).collect::<Vec<_>>();
                let patched = client
                    .patch(ctx, &name, patch_type, patch.as_bytes(), &subresources)
                    .await
                    .context(RequestSnafu)?;
                print(&patched)
            }
            Self::Apply { manifest, force } => {
                let object: K = manifest.into_object()?;
                let mut options = ApplyOptions::new(field_manager);
                options.force = force;
                print(&client.apply(ctx, &object, &options).await.context(RequestSnafu)?)
            }
            Self::UpdateStatus { manifest } => {
                let object: K = manifest.into_object()?;
                print(&client.update_status(ctx, &object).await.context(RequestSnafu)?)
            }
        }
    }
}

fn typed<K>(client: &Client, namespace: Option<&str>) -> TypedClient<K>
where
    K: Object + Resource<Scope = NamespaceResourceScope>,
{
    match namespace {
        Some(namespace) => client.namespaced(namespace),
        None => client.default_namespaced(),
    }
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    let yaml = serde_yaml::to_string(value).context(PrintSnafu)?;
    println!("---\n{}", yaml.trim_end());
    Ok(())
}

fn print_event<K: Serialize>(event: &WatchEvent<K>) -> Result<()> {
    match event {
        WatchEvent::Added(object) => {
            println!("# ADDED");
            print(object)
        }
        WatchEvent::Modified(object) => {
            println!("# MODIFIED");
            print(object)
        }
        WatchEvent::Deleted(object) => {
            println!("# DELETED");
            print(object)
        }
        WatchEvent::Bookmark { resource_version } => {
            println!("# BOOKMARK {resource_version}");
            Ok(())
        }
    }
}
