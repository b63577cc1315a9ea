use std::io;

use derive_more::{Display, Error, From};
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::{
    archiver::Artifact,
    transport::{FilePart, Transport, TransportError, PACKAGES_ENDPOINT},
};

/// Query parameters sent along with every package upload.
const UPLOAD_QUERY: [(&str, &str); 2] = [("stateOnCreate", "STARTED"), ("replaceExisting", "true")];

/// Multipart field that carries the archive.
const UPLOAD_FIELD: &str = "file";

/// Package upload errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum UploadError {
    /// IO-related error.
    Io(io::Error),

    /// HTTP transport error.
    Transport(TransportError),

    /// Response body is not valid JSON.
    #[display(fmt = "unable to parse upload response: {}", _0)]
    Json(serde_json::Error),

    /// Server rejected the upload.
    #[display(fmt = "upload rejected with status {}: {}", status, body)]
    #[from(ignore)]
    Rejected {
        /// Response status code.
        status: StatusCode,

        /// Response body, kept for diagnostics.
        body: String,
    },

    /// Response body is valid JSON, but not an array of packages.
    #[display(fmt = "unexpected response shape: {}", _0)]
    #[from(ignore)]
    UnexpectedShape(#[error(ignore)] String),

    /// Upload was accepted for asynchronous processing, which wasn't requested.
    #[display(
        fmt = "upload was not confirmed within the gateway timeout, enable async_upload to check package status instead"
    )]
    NotConfirmed,
}

/// How the server handled the upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Packages were deployed before the response was sent.
    Completed,

    /// Gateway timed out while the server continues deploying packages.
    Accepted,
}

impl Disposition {
    /// Check if this disposition counts as a success.
    ///
    /// Synchronous uploads must be completed, while asynchronous ones may also be accepted.
    pub(crate) fn is_success(self, async_upload: bool) -> bool {
        match self {
            Self::Completed => true,
            Self::Accepted => async_upload,
        }
    }
}

/// Package entry of the upload response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub(crate) struct UploadRecord {
    /// Package name.
    #[serde(default, deserialize_with = "deserialize_text")]
    pub name: String,

    /// Server-side package identifier.
    #[serde(default, deserialize_with = "deserialize_text")]
    pub id: String,

    /// Package state after the upload.
    #[serde(default, deserialize_with = "deserialize_text")]
    pub status: String,

    /// Package version.
    #[serde(default, deserialize_with = "deserialize_text")]
    pub version: String,
}

/// Render any JSON scalar as text, with `null` becoming an empty string.
fn deserialize_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(text) => text,
        other => other.to_string(),
    })
}

/// Classified upload response.
#[derive(Debug, Clone)]
pub(crate) struct UploadResult {
    /// Response status code.
    pub http_status: StatusCode,

    /// Upload outcome derived from the status code.
    pub disposition: Disposition,

    /// Package entries reported by the server.
    pub records: Vec<UploadRecord>,
}

impl UploadResult {
    /// Find the response entry of a package.
    pub(crate) fn record(&self, name: &str) -> Option<&UploadRecord> {
        self.records.iter().find(|record| record.name == name)
    }
}

/// Upload the archive and classify the server response.
///
/// Any `2xx` status is a completed upload, which must come with a JSON array of packages.
/// `504 Gateway Timeout` means the deployment continues on the server side, so it's
/// accepted, with package entries parsed only if the body happens to contain them.
#[instrument(skip_all, fields(file_name = artifact.file_name()))]
pub(crate) async fn upload(
    transport: &dyn Transport,
    artifact: &Artifact,
) -> Result<UploadResult, UploadError> {
    let contents = tokio::fs::read(artifact.path()).await?;

    info!(size = contents.len(), "uploading archive");

    let response = transport
        .post_file(
            &[PACKAGES_ENDPOINT[0], PACKAGES_ENDPOINT[1], "upload"],
            &UPLOAD_QUERY,
            FilePart {
                field: UPLOAD_FIELD,
                file_name: artifact.file_name(),
                contents,
            },
        )
        .await?;

    match response.status {
        status if status.is_success() => Ok(UploadResult {
            http_status: status,
            disposition: Disposition::Completed,
            records: parse_records(&response.body)?,
        }),
        StatusCode::GATEWAY_TIMEOUT => {
            warn!("gateway timed out, deployment continues on the server");

            Ok(UploadResult {
                http_status: response.status,
                disposition: Disposition::Accepted,
                records: parse_records(&response.body).unwrap_or_default(),
            })
        }
        status => Err(UploadError::Rejected {
            status,
            body: response.body,
        }),
    }
}

/// Parse the upload response body, which must be a JSON array of package entries.
fn parse_records(body: &str) -> Result<Vec<UploadRecord>, UploadError> {
    let Value::Array(entries) = serde_json::from_str::<Value>(body)? else {
        return Err(UploadError::UnexpectedShape(body.to_owned()));
    };

    Ok(entries
        .into_iter()
        .map(serde_json::from_value::<UploadRecord>)
        .collect::<Result<Vec<_>, _>>()?)
}
