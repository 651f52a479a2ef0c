//! Patch types and decoding of raw patch bytes.
//!
//! Patches are handed to the clients as raw bytes together with a [`PatchType`], exactly like they
//! would travel over the wire. Decoding happens on the client side so malformed input is rejected
//! before any request is issued.
use kube::api::Patch;
use snafu::{ResultExt, Snafu};
use strum::{Display, EnumString};

type Result<T, E = DecodeError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum DecodeError {
    #[snafu(display("failed to parse JSON patch document"))]
    ParseJsonPatch { source: serde_json::Error },

    #[snafu(display("failed to parse JSON object"))]
    ParseJson { source: serde_json::Error },

    #[snafu(display("failed to parse YAML object"))]
    ParseYaml { source: serde_yaml::Error },
}

/// The supported patch formats, displayed as (and parsed from) their HTTP content type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString)]
pub enum PatchType {
    /// RFC 6902 JSON patch, a list of operations.
    #[strum(serialize = "application/json-patch+json")]
    Json,

    /// RFC 7386 JSON merge patch.
    #[strum(serialize = "application/merge-patch+json")]
    Merge,

    /// Kubernetes strategic merge patch, which understands list merge keys of built-in types.
    #[strum(serialize = "application/strategic-merge-patch+json")]
    StrategicMerge,

    /// Server-side apply. Requires a field manager.
    #[strum(serialize = "application/apply-patch+yaml")]
    Apply,
}

impl PatchType {
    /// Decodes raw patch `data` into a [`Patch`] which can be handed to [`kube::Api`].
    ///
    /// Empty (or whitespace only) data is a valid patch and decodes to the empty document: `{}`,
    /// or `[]` for [`PatchType::Json`].
    pub fn decode(self, data: &[u8]) -> Result<Patch<serde_json::Value>> {
        let empty = data.iter().all(u8::is_ascii_whitespace);

        Ok(match self {
            Self::Json if empty => Patch::Json(json_patch::Patch(Vec::new())),
            Self::Json => Patch::Json(serde_json::from_slice(data).context(ParseJsonPatchSnafu)?),
            Self::Merge => Patch::Merge(decode_object(data, empty)?),
            Self::StrategicMerge => Patch::Strategic(decode_object(data, empty)?),
            Self::Apply if empty => Patch::Apply(empty_object()),
            // JSON is a subset of YAML, so apply patches in either format are accepted
            Self::Apply => Patch::Apply(serde_yaml::from_slice(data).context(ParseYamlSnafu)?),
        })
    }
}

/// Joins sub-resource names into the path segment appended to the object URL. Returns [`None`]
/// when the main resource is targeted.
pub fn subresource_path(subresources: &[&str]) -> Option<String> {
    let segments: Vec<&str> = subresources
        .iter()
        .map(|subresource| subresource.trim_matches('/'))
        .filter(|subresource| !subresource.is_empty())
        .collect();

    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

fn decode_object(data: &[u8], empty: bool) -> Result<serde_json::Value> {
    if empty {
        return Ok(empty_object());
    }

    serde_json::from_slice(data).context(ParseJsonSnafu)
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}
