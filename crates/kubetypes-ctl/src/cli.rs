use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use stackable_kubetypes::{ClientOptions, ListOptions, PatchType};

/// The field manager used for apply requests if none is configured.
pub const DEFAULT_FIELD_MANAGER: &str = "kubetypes-ctl";

/// Read and modify Kubernetes objects through the typed client contracts.
#[derive(Debug, PartialEq, Eq, Parser)]
#[command(version, long_about = "")]
pub struct Cli {
    /// The namespace of the objects. Defaults to the namespace of the current kubeconfig context.
    #[arg(long, short = 'n', global = true, env = "KUBETYPES_NAMESPACE")]
    pub namespace: Option<String>,

    #[command(subcommand)]
    pub command: Command,

    // IMPORTANT: All (flattened) sub structs should be placed at the end to ensure the help
    // headings are correct.
    #[command(flatten)]
    pub client: ClientOptions,
}

impl Cli {
    /// Returns the client options with a field manager filled in.
    pub fn client_options(&self) -> ClientOptions {
        let mut options = self.client.clone();
        options
            .field_manager
            .get_or_insert_with(|| DEFAULT_FIELD_MANAGER.to_owned());
        options
    }
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Print a single object.
    Get { kind: Kind, name: String },

    /// Print all objects matching the selectors.
    List {
        kind: Kind,

        #[command(flatten)]
        selectors: Selectors,
    },

    /// Print changes to objects matching the selectors until interrupted.
    Watch {
        kind: Kind,

        #[command(flatten)]
        selectors: Selectors,

        /// Only print changes after this resource version, instead of starting with the current
        /// state.
        #[arg(long)]
        resource_version: Option<String>,
    },

    /// Delete a single object.
    Delete { kind: Kind, name: String },

    /// Patch a single object and print the result.
    Patch {
        kind: Kind,
        name: String,

        /// How the patch is interpreted.
        #[arg(long = "type", value_enum, default_value_t = PatchFormat::Merge)]
        patch_type: PatchFormat,

        /// The patch document. An empty patch leaves the object as it is.
        #[arg(long, short = 'p', default_value = "")]
        patch: String,

        /// Patch a sub-resource instead of the object itself, e.g. `status`.
        #[arg(long = "subresource")]
        subresources: Vec<String>,
    },

    /// Apply the object in a manifest file using server-side apply and print the result.
    Apply {
        /// The manifest, in YAML or JSON.
        #[arg(long = "filename", short = 'f', value_name = "FILE")]
        file: PathBuf,

        /// Take over fields owned by other field managers instead of failing.
        #[arg(long)]
        force: bool,
    },

    /// Replace the status of the object in a manifest file and print the result.
    UpdateStatus {
        /// The manifest, in YAML or JSON.
        #[arg(long = "filename", short = 'f', value_name = "FILE")]
        file: PathBuf,
    },
}

/// The resource kinds the command line tool knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Kind {
    #[value(name = "configmap", alias = "cm")]
    ConfigMap,

    Secret,

    #[value(alias = "svc")]
    Service,

    #[value(alias = "deploy")]
    Deployment,
}

impl Kind {
    /// Looks up the kind named in a manifest's `kind` field.
    pub fn from_manifest_kind(kind: &str) -> Option<Self> {
        match kind {
            "ConfigMap" => Some(Self::ConfigMap),
            "Secret" => Some(Self::Secret),
            "Service" => Some(Self::Service),
            "Deployment" => Some(Self::Deployment),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PatchFormat {
    /// A JSON patch (RFC 6902).
    Json,

    /// A JSON merge patch (RFC 7386).
    Merge,

    /// A strategic merge patch.
    Strategic,

    /// A server-side apply patch, requires a field manager.
    Apply,
}

impl From<PatchFormat> for PatchType {
    fn from(format: PatchFormat) -> Self {
        match format {
            PatchFormat::Json => Self::Json,
            PatchFormat::Merge => Self::Merge,
            PatchFormat::Strategic => Self::StrategicMerge,
            PatchFormat::Apply => Self::Apply,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct Selectors {
    /// Only include objects with matching labels, e.g. `app=web,tier!=cache`.
    #[arg(long = "selector", short = 'l', default_value = "")]
    pub label_selector: String,

    /// Only include objects with matching fields, e.g. `metadata.name=foo`.
    #[arg(long, default_value = "")]
    pub field_selector: String,
}

impl From<Selectors> for ListOptions {
    fn from(selectors: Selectors) -> Self {
        Self::default()
            .with_label_selector(selectors.label_selector)
            .with_field_selector(selectors.field_selector)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::CommandFactory;
    use rstest::rstest;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[rstest]
    #[case(&["get", "configmap", "foo"], Command::Get { kind: Kind::ConfigMap, name: "foo".to_owned() })]
    #[case(&["delete", "svc", "web"], Command::Delete { kind: Kind::Service, name: "web".to_owned() })]
    #[case(
        &["list", "deploy", "-l", "app=web"],
        Command::List {
            kind: Kind::Deployment,
            selectors: Selectors { label_selector: "app=web".to_owned(), field_selector: String::new() },
        }
    )]
    #[case(
        &["patch", "deployment", "web", "--type", "json", "-p", "[]", "--subresource", "status"],
        Command::Patch {
            kind: Kind::Deployment,
            name: "web".to_owned(),
            patch_type: PatchFormat::Json,
            patch: "[]".to_owned(),
            subresources: vec!["status".to_owned()],
        }
    )]
    #[case(
        &["apply", "-f", "cm.yaml", "--force"],
        Command::Apply { file: PathBuf::from("cm.yaml"), force: true }
    )]
    fn parse_commands(#[case] args: &[&str], #[case] expected: Command) {
        let cli = Cli::try_parse_from(std::iter::once("kubetypes-ctl").chain(args.iter().copied()))
            .expect("arguments must parse");

        assert_eq!(cli.command, expected);
    }

    #[test]
    fn patch_defaults_to_empty_merge_patch() {
        let cli = Cli::try_parse_from(["kubetypes-ctl", "patch", "secret", "foo"]).unwrap();

        assert!(matches!(
            cli.command,
            Command::Patch { patch_type: PatchFormat::Merge, ref patch, .. } if patch.is_empty()
        ));
        assert_eq!(PatchType::from(PatchFormat::Merge), PatchType::Merge);
    }

    #[test]
    fn client_options_are_flattened() {
        let cli = Cli::try_parse_from([
            "kubetypes-ctl",
            "--request-timeout",
            "30s",
            "--dry-run",
            "get",
            "cm",
            "foo",
            "-n",
            "team-a",
        ])
        .unwrap();

        assert_eq!(cli.namespace.as_deref(), Some("team-a"));
        assert_eq!(cli.client.request_timeout, Some(Duration::from_secs(30)));
        assert!(cli.client.dry_run);
        assert_eq!(
            cli.client_options().field_manager.as_deref(),
            Some(DEFAULT_FIELD_MANAGER)
        );
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        assert!(Cli::try_parse_from(["kubetypes-ctl", "get", "pod", "foo"]).is_err());
        assert_eq!(Kind::from_manifest_kind("Pod"), None);
        assert_eq!(
            Kind::from_manifest_kind("ConfigMap"),
            Some(Kind::ConfigMap)
        );
    }
}
