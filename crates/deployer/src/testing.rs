use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::transport::{FilePart, Response, Transport, TransportError};

/// Upload request captured by [`StubTransport`].
#[derive(Debug, Clone)]
pub(crate) struct UploadCall {
    /// Endpoint path segments joined with `/`.
    pub path: String,

    /// Query parameters.
    pub query: Vec<(String, String)>,

    /// Multipart field name.
    pub field: String,

    /// Uploaded file name.
    pub file_name: String,

    /// Uploaded file contents.
    pub contents: Vec<u8>,
}

/// Status request captured by [`StubTransport`].
#[derive(Debug, Clone)]
pub(crate) struct StatusCall {
    /// Endpoint path segments joined with `/`.
    pub path: String,

    /// Query parameters.
    pub query: Vec<(String, String)>,
}

/// In-memory [`Transport`] with scripted responses.
///
/// Status responses are scripted per package, the last scripted response
/// is repeated once the rest were consumed.
#[derive(Default)]
pub(crate) struct StubTransport {
    /// Response to every upload request.
    upload: Option<Response>,

    /// Scripted status responses by package name.
    statuses: Mutex<HashMap<String, VecDeque<Response>>>,

    /// Captured upload requests.
    uploads: Mutex<Vec<UploadCall>>,

    /// Captured status requests.
    status_calls: Mutex<Vec<StatusCall>>,
}

/// Copy query parameters for later inspection.
fn owned_query(query: &[(&str, &str)]) -> Vec<(String, String)> {
    query
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

impl StubTransport {
    /// Create a transport without scripted responses.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Script the response to upload requests.
    pub(crate) fn upload_response(mut self, status: StatusCode, body: &str) -> Self {
        self.upload = Some(Response {
            status,
            body: body.to_owned(),
        });
        self
    }

    /// Append scripted status responses for a package.
    pub(crate) fn status_responses<'a>(
        self,
        package: &str,
        responses: impl IntoIterator<Item = (StatusCode, &'a str)>,
    ) -> Self {
        self.statuses
            .lock()
            .unwrap()
            .entry(package.to_owned())
            .or_default()
            .extend(responses.into_iter().map(|(status, body)| Response {
                status,
                body: body.to_owned(),
            }));
        self
    }

    /// Captured upload requests.
    pub(crate) fn uploads(&self) -> Vec<UploadCall> {
        self.uploads.lock().unwrap().clone()
    }

    /// Captured status requests.
    pub(crate) fn status_calls(&self) -> Vec<StatusCall> {
        self.status_calls.lock().unwrap().clone()
    }

    /// Number of status requests made for a package.
    pub(crate) fn status_call_count(&self, package: &str) -> usize {
        let suffix = format!("/{package}");

        self.status_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.path.ends_with(&suffix))
            .count()
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn post_file(
        &self,
        path: &[&str],
        query: &[(&str, &str)],
        file: FilePart<'_>,
    ) -> Result<Response, TransportError> {
        self.uploads.lock().unwrap().push(UploadCall {
            path: path.join("/"),
            query: owned_query(query),
            field: file.field.to_owned(),
            file_name: file.file_name.to_owned(),
            contents: file.contents,
        });

        Ok(self.upload.clone().unwrap_or(Response {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: String::from("no upload response scripted"),
        }))
    }

    async fn get_json(
        &self,
        path: &[&str],
        query: &[(&str, &str)],
    ) -> Result<Response, TransportError> {
        self.status_calls.lock().unwrap().push(StatusCall {
            path: path.join("/"),
            query: owned_query(query),
        });

        let package = path.last().copied().unwrap_or_default();
        let mut statuses = self.statuses.lock().unwrap();

        let response = match statuses.get_mut(package) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };

        Ok(response.unwrap_or(Response {
            status: StatusCode::NOT_FOUND,
            body: String::from(r#"{"message":"package not found"}"#),
        }))
    }
}
