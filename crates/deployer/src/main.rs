//! # Package deployer
//!
//! CI helper that deploys integration packages to an integration server.
//!
//! Every immediate subdirectory of the package directory, that passes the configured
//! name filter, is a package. Selected packages are archived into a single ZIP file,
//! where each package becomes a top-level directory, and the archive is uploaded
//! to the server package API.
//!
//! # Asynchronous uploads
//!
//! Large deployments may outlive the gateway timeout, in which case the server
//! responds with `504 Gateway Timeout` while the deployment continues. With
//! `async_upload` enabled such a response is accepted, and each package status is
//! polled until it's `STARTED` or the configured attempts are exhausted.
//!
//! # Outputs
//!
//! For each package, `<package>_id`, `<package>_name`, `<package>_status` and
//! `<package>_version` outputs are written to the file referenced by `GITHUB_OUTPUT`.
//! See the [`outputs`] module for details.

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]

use clap::Parser;
use commands::{Cli, Commands};
use common::{config::Config, logging};

/// Package directory archiving.
mod archiver;

/// CLI subcommands.
mod commands;

/// Deployment flow, from pre-flight checks to status confirmation.
mod orchestrator;

/// Named step outputs and failure annotations.
mod outputs;

/// Package status polling.
mod poller;

/// Checks that run before any work is done.
mod preflight;

/// Package directory selection.
mod selector;

/// Integration server HTTP access.
mod transport;

/// Archive upload and response classification.
mod uploader;

/// Test utilities.
#[cfg(test)]
mod testing;

/// CLI entrypoint.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let result = run(cli).await;

    if let Err(error) = &result {
        outputs::fail(format!("{error:#}"));
    }

    result
}

/// Load the configuration and run the selected subcommand.
async fn run(cli: Cli) -> Result<(), anyhow::Error> {
    let config = Config::new(cli.config_file)?;

    logging::init(&config);

    match cli.command {
        Commands::Upload => commands::upload(&config).await?,
        Commands::Status(args) => commands::status(&config, args).await?,
    }

    Ok(())
}
