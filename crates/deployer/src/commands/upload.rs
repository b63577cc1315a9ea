use common::config::Config;
use derive_more::{Display, Error, From};
use indicatif::MultiProgress;
use tracing::info;

use crate::{
    orchestrator::{self, DeployError},
    outputs::Outputs,
    transport::{HttpTransport, TransportError},
};

/// `upload` subcommand errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum UploadCommandError {
    /// HTTP transport cannot be created.
    Transport(TransportError),

    /// Deployment flow error.
    Deploy(DeployError),
}

/// Upload flow entrypoint.
pub(crate) async fn upload(config: &Config) -> Result<(), UploadCommandError> {
    let transport = HttpTransport::new(config)?;
    let mut outputs = Outputs::new(config.output_file.clone());
    let progress = MultiProgress::new();

    let report = orchestrator::run(config, &transport, &mut outputs, &progress).await?;

    info!(
        selected = report.candidates.len(),
        packages = report.packages.len(),
        status = ?report.upload.as_ref().map(|upload| upload.http_status),
        outputs = outputs.values().len(),
        started = report
            .evidence
            .iter()
            .filter(|outcome| outcome.is_started())
            .count(),
        "deployment finished"
    );

    Ok(())
}
