//! Typed capability contracts for clients of Kubernetes-style resource APIs.
//!
//! The contracts live in [`api`]: [`WriteApi`], [`WriteStatusApi`], [`ReadApi`] and
//! [`ApplyApi`], plus [`FullApi`] which combines read, write and apply. They are generic over the
//! resource type, its list type and its apply payload type, so that generated and hand-written
//! clients alike can implement them.
//!
//! Two implementations are included:
//!
//! - [`TypedClient`], backed by [`kube::Api`] and obtained through [`Client`]
//! - [`FakeClient`], backed by the in-memory [`FakeStore`] for tests
//!
//! Every operation takes a [`Context`] carrying cancellation and an optional deadline, and fails
//! with an [`Error`] that can be classified through [`Error::kind`].
pub mod api;
pub mod client;
pub mod context;
pub mod error;
pub mod fake;
pub mod options;
pub mod patch;
pub mod selector;
pub mod watch;

pub use crate::{
    api::{ApplyApi, FullApi, Object, ReadApi, WriteApi, WriteStatusApi},
    client::{Client, TypedClient},
    context::{Context, ContextError},
    error::{Error, ErrorKind, Operation, Result},
    fake::{FakeClient, FakeStore},
    options::{ApplyOptions, ClientOptions, DeletePropagation, ListOptions},
    patch::PatchType,
    watch::{StopHandle, WatchEvent, WatchStream},
};

// Internal re-exports
pub use k8s_openapi;
pub use kube;
