use std::{io, path::Path};

use derive_more::{Display, Error, From};
use reqwest::Url;
use tokio::net::lookup_host;
use tracing::{debug, instrument};

/// Pre-flight check errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum PreflightError {
    /// Base URL cannot be parsed or has no host.
    #[display(fmt = "invalid base URL {}", _0)]
    InvalidBaseUrl(#[error(ignore)] String),

    /// Host name of the integration server cannot be resolved.
    #[display(fmt = "host {} is unreachable: {}", host, source)]
    #[from(ignore)]
    HostUnreachable {
        /// Host name.
        host: String,

        /// Resolution error.
        source: io::Error,
    },

    /// Package directory does not exist.
    #[display(fmt = "package directory {} does not exist", _0)]
    #[from(ignore)]
    PackageDirNotFound(#[error(ignore)] String),
}

/// Ensure the package directory exists.
pub(crate) fn check_package_dir(path: &Path) -> Result<(), PreflightError> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(PreflightError::PackageDirNotFound(
            path.display().to_string(),
        ))
    }
}

/// Ensure the host of the integration server resolves to at least one address.
///
/// IP address hosts are accepted as is.
#[instrument(err)]
pub(crate) async fn check_host(base_url: &str) -> Result<(), PreflightError> {
    let url = Url::parse(base_url.trim())
        .map_err(|error| PreflightError::InvalidBaseUrl(format!("{base_url}: {error}")))?;

    let Some(domain) = url.domain() else {
        return match url.host_str() {
            Some(_) => Ok(()),
            None => Err(PreflightError::InvalidBaseUrl(base_url.to_owned())),
        };
    };

    let port = url.port_or_known_default().unwrap_or(443);

    let unreachable = |source| PreflightError::HostUnreachable {
        host: domain.to_owned(),
        source,
    };

    let mut addresses = lookup_host((domain, port)).await.map_err(unreachable)?;

    match addresses.next() {
        Some(address) => {
            debug!(%address, "host resolved");
            Ok(())
        }
        None => Err(unreachable(io::Error::new(
            io::ErrorKind::NotFound,
            "no addresses found",
        ))),
    }
}
