use async_trait::async_trait;
use common::config::Config;
use derive_more::{Display, Error, From};
use reqwest::{
    header::ACCEPT,
    multipart::{Form, Part},
    Client, RequestBuilder, StatusCode, Url,
};

/// Path segments shared by all package API endpoints.
pub(crate) const PACKAGES_ENDPOINT: [&str; 2] = ["esbapi", "packages"];

/// HTTP transport errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum TransportError {
    /// HTTP client error.
    Http(reqwest::Error),

    /// Base URL cannot be used to build endpoint URLs.
    #[display(fmt = "invalid base URL {}", _0)]
    #[from(ignore)]
    InvalidBaseUrl(#[error(ignore)] String),
}

/// Status code and body of a completed HTTP request.
#[derive(Debug, Clone)]
pub(crate) struct Response {
    /// Response status code.
    pub status: StatusCode,

    /// Response body text.
    pub body: String,
}

/// File sent as a part of a multipart request.
pub(crate) struct FilePart<'a> {
    /// Form field name.
    pub field: &'a str,

    /// File name reported to the server.
    pub file_name: &'a str,

    /// File contents.
    pub contents: Vec<u8>,
}

/// Authenticated access to the integration server API.
///
/// Both methods return any response the server produced, regardless of its status code,
/// leaving the classification to the caller.
#[async_trait]
pub(crate) trait Transport: Send + Sync {
    /// Send a multipart `POST` request with a single file.
    async fn post_file(
        &self,
        path: &[&str],
        query: &[(&str, &str)],
        file: FilePart<'_>,
    ) -> Result<Response, TransportError>;

    /// Send a `GET` request, that expects a JSON response.
    async fn get_json(&self, path: &[&str], query: &[(&str, &str)])
        -> Result<Response, TransportError>;
}

/// [`Transport`] implementation backed by [`reqwest`].
pub(crate) struct HttpTransport {
    /// Shared HTTP client.
    client: Client,

    /// Integration server base URL.
    base_url: Url,

    /// Bearer authentication token.
    token: String,
}

impl HttpTransport {
    /// Create a new transport using the server location and credentials from `config`.
    pub(crate) fn new(config: &Config) -> Result<Self, TransportError> {
        let base_url = Url::parse(config.base_url.trim())
            .map_err(|error| TransportError::InvalidBaseUrl(error.to_string()))?;

        if base_url.cannot_be_a_base() {
            return Err(TransportError::InvalidBaseUrl(base_url.to_string()));
        }

        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url,
            token: config.access_token.clone(),
        })
    }

    /// Build an endpoint URL by appending percent-encoded `path` segments to the base URL.
    fn url(&self, path: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();

        url.path_segments_mut()
            .map_err(|_| TransportError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(path);

        Ok(url)
    }

    /// Send an authenticated request and collect its response.
    async fn send(&self, request: RequestBuilder) -> Result<Response, TransportError> {
        let response = request.bearer_auth(&self.token).send().await?;

        Ok(Response {
            status: response.status(),
            body: response.text().await?,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_file(
        &self,
        path: &[&str],
        query: &[(&str, &str)],
        file: FilePart<'_>,
    ) -> Result<Response, TransportError> {
        let form = Form::new().part(
            file.field.to_owned(),
            Part::bytes(file.contents)
                .file_name(file.file_name.to_owned())
                .mime_str("application/zip")?,
        );

        self.send(
            self.client
                .post(self.url(path)?)
                .query(query)
                .multipart(form),
        )
        .await
    }

    async fn get_json(
        &self,
        path: &[&str],
        query: &[(&str, &str)],
    ) -> Result<Response, TransportError> {
        self.send(
            self.client
                .get(self.url(path)?)
                .query(query)
                .header(ACCEPT, "application/json"),
        )
        .await
    }
}
