/// `status` subcommand.
mod status;

/// `upload` subcommand.
mod upload;

pub(crate) use status::status;
pub(crate) use upload::upload;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// CLI configuration.
#[derive(Parser)]
#[command(about, version)]
pub(crate) struct Cli {
    /// Configuration file path.
    #[arg(short, long = "config", default_value = "Deploy.toml")]
    pub config_file: Option<PathBuf>,

    /// Selected subcommand.
    #[command(subcommand)]
    pub command: Commands,
}

/// Supported subcommands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Archive and upload packages, then optionally wait for them to start.
    Upload,

    /// Wait for already uploaded packages to start.
    Status(Status),
}

/// `status` subcommand configuration.
#[derive(Args)]
pub struct Status {
    /// Package names to check. Packages selected from the package directory are checked if empty.
    names: Vec<String>,
}
