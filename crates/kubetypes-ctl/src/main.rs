use clap::Parser;
use snafu::{ResultExt, Snafu};
use stackable_kubetypes::{Client, Context, ContextError};

use crate::{
    cli::Cli,
    command::Action,
    logging::{LOG_ENV, initialize_logging},
};

mod cli;
mod command;
mod logging;

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to load the command"))]
    Load { source: command::Error },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("interrupted while creating Kubernetes client"))]
    CreateClientAborted { source: ContextError },

    #[snafu(display("failed to run the command"))]
    Run { source: command::Error },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    initialize_logging(LOG_ENV);

    // Ctrl-C cancels the root context, which aborts in-flight requests and ends watches
    let ctx = Context::background();
    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received interrupt, cancelling");
            interrupt.cancel();
        }
    });

    let namespace = cli.namespace.clone();
    let options = cli.client_options();
    let (kind, action) = Action::load(cli.command).context(LoadSnafu)?;

    let kube_client = ctx
        .run(kube::Client::try_default())
        .await
        .context(CreateClientAbortedSnafu)?
        .context(CreateClientSnafu)?;
    let client = Client::new(kube_client, options);

    tracing::debug!(?kind, ?namespace, "running command");
    action
        .run(&ctx, &client, kind, namespace.as_deref())
        .await
        .context(RunSnafu)
}
