use common::config::Config;
use derive_more::{Display, Error, From};
use indicatif::MultiProgress;
use tracing::warn;

use crate::{
    commands::Status,
    orchestrator::{self, DeployError},
    preflight::{self, PreflightError},
    selector::{self, Filter, SelectError},
    transport::{HttpTransport, TransportError},
};

/// `status` subcommand errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum StatusError {
    /// HTTP transport cannot be created.
    Transport(TransportError),

    /// Pre-flight check failed.
    Preflight(PreflightError),

    /// Package selection failed.
    Select(SelectError),

    /// Status check flow error.
    Deploy(DeployError),
}

/// Status check flow entrypoint.
pub(crate) async fn status(config: &Config, Status { names }: Status) -> Result<(), StatusError> {
    let transport = HttpTransport::new(config)?;

    preflight::check_host(&config.base_url).await?;

    let names = if names.is_empty() {
        selected_packages(config)?
    } else {
        names
    };

    if names.is_empty() {
        warn!("no packages to check");
        return Ok(());
    }

    orchestrator::confirm(config, &transport, &names, &MultiProgress::new()).await?;

    Ok(())
}

/// Names of the packages that `upload` would deploy, or the configured single package.
fn selected_packages(config: &Config) -> Result<Vec<String>, StatusError> {
    if let Some(name) = config.success_check_package_name() {
        return Ok(vec![name.to_owned()]);
    }

    preflight::check_package_dir(&config.package_dir)?;

    Ok(
        selector::select(&config.package_dir, &Filter::from_config(config)?)?
            .into_iter()
            .map(|candidate| candidate.name)
            .collect(),
    )
}
