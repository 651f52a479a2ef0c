use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{DeleteParams, ListParams, PatchParams, PostParams, PropagationPolicy, WatchParams};

use crate::selector::{LabelSelectorExt, SelectorError};

/// Restricts which objects a list or watch call returns.
///
/// Both selectors are handed to the server unmodified. Empty selectors do not filter anything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// A selector to restrict the list of returned objects by their labels.
    pub label_selector: String,

    /// A selector to restrict the list of returned objects by their fields.
    pub field_selector: String,

    /// The resource version to list at, or to start watching from.
    ///
    /// Watches without a resource version first receive synthetic `Added` events for all
    /// matching objects.
    pub resource_version: Option<String>,
}

impl ListOptions {
    pub fn with_label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = selector.into();
        self
    }

    pub fn with_field_selector(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = selector.into();
        self
    }

    pub fn with_resource_version(mut self, resource_version: impl Into<String>) -> Self {
        self.resource_version = Some(resource_version.into());
        self
    }

    /// Builds options which select objects by a structured [`LabelSelector`].
    pub fn from_label_selector(selector: &LabelSelector) -> Result<Self, SelectorError> {
        Ok(Self::default().with_label_selector(selector.to_query_string()?))
    }
}

fn non_empty(selector: &str) -> Option<String> {
    (!selector.is_empty()).then(|| selector.to_owned())
}

impl From<&ListOptions> for ListParams {
    fn from(options: &ListOptions) -> Self {
        Self {
            label_selector: non_empty(&options.label_selector),
            field_selector: non_empty(&options.field_selector),
            resource_version: options.resource_version.clone(),
            ..Self::default()
        }
    }
}

impl From<&ListOptions> for WatchParams {
    fn from(options: &ListOptions) -> Self {
        Self {
            label_selector: non_empty(&options.label_selector),
            field_selector: non_empty(&options.field_selector),
            ..Self::default()
        }
    }
}

/// Options for a server-side apply call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    /// The actor recorded as owner of every field in the applied payload. Must not be empty.
    pub field_manager: String,

    /// Take ownership of fields currently owned by other managers instead of failing with a
    /// conflict.
    pub force: bool,

    /// Compute and return the result without persisting it.
    pub dry_run: bool,
}

impl ApplyOptions {
    pub fn new(field_manager: impl Into<String>) -> Self {
        Self {
            field_manager: field_manager.into(),
            ..Self::default()
        }
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

impl From<&ApplyOptions> for PatchParams {
    fn from(options: &ApplyOptions) -> Self {
        Self {
            dry_run: options.dry_run,
            force: options.force,
            field_manager: Some(options.field_manager.clone()),
            ..Self::default()
        }
    }
}

/// How dependents of a deleted object are cleaned up.
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeletePropagation {
    /// Let the garbage collector decide, based on the resource's default policy.
    #[default]
    Default,

    /// Delete dependents before the owner.
    Foreground,

    /// Delete the owner right away, dependents are collected in the background.
    Background,

    /// Leave dependents behind.
    Orphan,
}

impl DeletePropagation {
    fn policy(self) -> Option<PropagationPolicy> {
        match self {
            Self::Default => None,
            Self::Foreground => Some(PropagationPolicy::Foreground),
            Self::Background => Some(PropagationPolicy::Background),
            Self::Orphan => Some(PropagationPolicy::Orphan),
        }
    }
}

/// Settings which apply to every call issued through a client.
#[cfg_attr(
    feature = "clap",
    derive(clap::Args),
    command(next_help_heading = "Client Options")
)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientOptions {
    /// The field manager recorded for create, update and patch calls.
    ///
    /// Patches of type `apply` require a field manager.
    #[cfg_attr(feature = "clap", arg(long, env = "KUBETYPES_FIELD_MANAGER"))]
    pub field_manager: Option<String>,

    /// Validate write requests on the server without persisting them.
    #[cfg_attr(feature = "clap", arg(long, env = "KUBETYPES_DRY_RUN"))]
    pub dry_run: bool,

    /// Abort every single call after this duration, e.g. `30s` or `2m`.
    ///
    /// Watches are long-lived and only subject to the caller's own deadline.
    #[cfg_attr(
        feature = "clap",
        arg(long, env = "KUBETYPES_REQUEST_TIMEOUT", value_parser = humantime::parse_duration)
    )]
    pub request_timeout: Option<Duration>,

    /// How dependents of deleted objects are cleaned up.
    #[cfg_attr(
        feature = "clap",
        arg(long, env = "KUBETYPES_DELETE_PROPAGATION", value_enum, default_value_t)
    )]
    pub delete_propagation: DeletePropagation,
}

impl ClientOptions {
    pub(crate) fn post_params(&self) -> PostParams {
        PostParams {
            dry_run: self.dry_run,
            field_manager: self.field_manager.clone(),
        }
    }

    pub(crate) fn patch_params(&self) -> PatchParams {
        PatchParams {
            dry_run: self.dry_run,
            field_manager: self.field_manager.clone(),
            ..PatchParams::default()
        }
    }

    pub(crate) fn delete_params(&self) -> DeleteParams {
        DeleteParams {
            dry_run: self.dry_run,
            propagation_policy: self.delete_propagation.policy(),
            ..DeleteParams::default()
        }
    }
}
