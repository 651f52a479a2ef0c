use snafu::Snafu;
use strum::{Display, EnumString};

use crate::{context::ContextError, patch, selector::SelectorError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The contract operation a request was issued for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    Create,
    Patch,
    Update,
    UpdateStatus,
    Delete,
    Get,
    List,
    Watch,
    Apply,
}

/// Coarse classification of an [`Error`], independent of the client implementation which
/// produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum ErrorKind {
    /// The target object does not exist.
    NotFound,

    /// Concurrent modification, an existing object with the same name or an apply ownership
    /// conflict.
    Conflict,

    /// Malformed patch bytes, payloads or selectors.
    Invalid,

    /// The requested resource version is too old, the caller has to re-list.
    Expired,

    Cancelled,
    DeadlineExceeded,

    /// Any other failure reported by the transport or the API server.
    Transport,
}

/// Status reasons reported by the API server which are mapped onto [`ErrorKind`]s.
#[derive(Debug, PartialEq, Eq, EnumString)]
pub enum StatusReason {
    NotFound,
    AlreadyExists,
    Conflict,
    Invalid,
    BadRequest,
    UnsupportedMediaType,
    Expired,
    Gone,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{resource} {name:?} not found"))]
    NotFound { resource: String, name: String },

    #[snafu(display("{resource} {name:?} already exists"))]
    AlreadyExists { resource: String, name: String },

    #[snafu(display("{operation} of {resource} {name:?} conflicts: {message}"))]
    Conflict {
        operation: Operation,
        resource: String,
        name: String,
        message: String,
    },

    #[snafu(display("invalid {operation} request for {resource}: {message}"))]
    Invalid {
        operation: Operation,
        resource: String,
        message: String,
    },

    #[snafu(display("resource version expired during {operation} of {resource}: {message}"))]
    Expired {
        operation: Operation,
        resource: String,
        message: String,
    },

    #[snafu(display("failed to decode {patch_type} patch data"))]
    DecodePatch {
        source: patch::DecodeError,
        patch_type: patch::PatchType,
    },

    #[snafu(display("failed to serialize {resource} for {operation}"))]
    Serialize {
        source: serde_json::Error,
        operation: Operation,
        resource: String,
    },

    #[snafu(display("failed to deserialize {resource} returned by {operation}"))]
    Deserialize {
        source: serde_json::Error,
        operation: Operation,
        resource: String,
    },

    #[snafu(display("invalid selector in {operation} request for {resource}"))]
    InvalidSelector {
        source: SelectorError,
        operation: Operation,
        resource: String,
    },

    #[snafu(display("{operation} of {resource} aborted"))]
    Context {
        source: ContextError,
        operation: Operation,
        resource: String,
    },

    #[snafu(display(
        "API server rejected {operation} of {resource} with {code} {reason}: {message}"
    ))]
    Api {
        operation: Operation,
        resource: String,
        code: u16,
        reason: String,
        message: String,
    },

    #[snafu(display("{operation} request for {resource} failed"))]
    Transport {
        source: kube::Error,
        operation: Operation,
        resource: String,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } | Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Invalid { .. }
            | Self::DecodePatch { .. }
            | Self::Serialize { .. }
            | Self::InvalidSelector { .. } => ErrorKind::Invalid,
            Self::Expired { .. } => ErrorKind::Expired,
            Self::Context {
                source: ContextError::Cancelled,
                ..
            } => ErrorKind::Cancelled,
            Self::Context {
                source: ContextError::DeadlineExceeded,
                ..
            } => ErrorKind::DeadlineExceeded,
            Self::Deserialize { .. } | Self::Api { .. } | Self::Transport { .. } => {
                ErrorKind::Transport
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Returns true for both plain conflicts and attempts to create an object which already
    /// exists.
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns true if the call was aborted by its [`Context`](crate::Context), either through
    /// cancellation or because the deadline passed.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Cancelled | ErrorKind::DeadlineExceeded
        )
    }

    /// Maps a failed API status (as found in error responses and watch error events) onto the
    /// error taxonomy. The reason is consulted first, the HTTP code is the fallback.
    pub(crate) fn from_status(
        operation: Operation,
        resource: &str,
        name: &str,
        code: u16,
        reason: &str,
        message: &str,
    ) -> Self {
        let resource = resource.to_owned();
        let message = message.to_owned();

        match (reason.parse::<StatusReason>().ok(), code) {
            (Some(StatusReason::NotFound), _) | (None, 404) => Self::NotFound {
                resource,
                name: name.to_owned(),
            },
            (Some(StatusReason::AlreadyExists), _) => Self::AlreadyExists {
                resource,
                name: name.to_owned(),
            },
            (Some(StatusReason::Conflict), _) | (None, 409) => Self::Conflict {
                operation,
                resource,
                name: name.to_owned(),
                message,
            },
            (
                Some(
                    StatusReason::Invalid
                    | StatusReason::BadRequest
                    | StatusReason::UnsupportedMediaType,
                ),
                _,
            )
            | (None, 400 | 415 | 422) => Self::Invalid {
                operation,
                resource,
                message,
            },
            (Some(StatusReason::Expired | StatusReason::Gone), _) | (None, 410) => {
                Self::Expired {
                    operation,
                    resource,
                    message,
                }
            }
            _ => Self::Api {
                operation,
                resource,
                code,
                reason: reason.to_owned(),
                message,
            },
        }
    }

    /// Classifies a [`kube::Error`]. API status errors are mapped through
    /// [`Error::from_status`], everything else is a transport failure.
    pub(crate) fn from_kube(
        source: kube::Error,
        operation: Operation,
        resource: &str,
        name: &str,
    ) -> Self {
        if let kube::Error::Api(status) = &source {
            return Self::from_status(
                operation,
                resource,
                name,
                status.code,
                &status.reason,
                &status.message,
            );
        }

        Self::Transport {
            source,
            operation,
            resource: resource.to_owned(),
        }
    }
}
