use anyhow::Context;
use async_trait::async_trait;
use errors::ErrorMetadata;
use futures::{
    StreamExt,
    TryStreamExt,
};

use crate::http::{
    HttpRequest,
    HttpResponse,
    HttpResponseStream,
};

/// HTTP client seam shared by the deployment RPC client, the GitHub client
/// and the schema-update event source.
#[async_trait]
pub trait FetchClient: Send + Sync {
    /// Sends `request` and returns as soon as the response head arrives. Does
    /// not look at the status code.
    async fn fetch(&self, request: HttpRequest) -> anyhow::Result<HttpResponseStream>;

    /// Like [`FetchClient::fetch`], but reads the whole body.
    async fn fetch_buffered(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        self.fetch(request).await?.into_http_response().await
    }
}

#[derive(Clone)]
pub struct ReqwestFetchClient(reqwest::Client);

impl ReqwestFetchClient {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("convex-panel/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self(client))
    }
}

fn classify_transport_error(e: reqwest::Error) -> anyhow::Error {
    let msg = if e.is_timeout() {
        format!("Request timed out: {e}")
    } else if e.is_connect() {
        format!("Could not connect: {e}")
    } else {
        format!("Request failed: {e}")
    };
    anyhow::Error::new(e).context(ErrorMetadata::network(msg))
}

#[async_trait]
impl FetchClient for ReqwestFetchClient {
    async fn fetch(&self, request: HttpRequest) -> anyhow::Result<HttpResponseStream> {
        let HttpRequest {
            headers,
            url,
            method,
            body,
            timeout,
        } = request;
        tracing::debug!("{method} {url}");
        let mut request_builder = self.0.request(method, url.as_str()).headers(headers);
        if let Some(body) = body {
            request_builder = request_builder.body(body);
        }
        if let Some(timeout) = timeout {
            request_builder = request_builder.timeout(timeout);
        }
        let raw_response = request_builder
            .send()
            .await
            .map_err(classify_transport_error)?;
        let status = raw_response.status();
        let headers = raw_response.headers().to_owned();
        Ok(HttpResponseStream {
            status,
            headers,
            url: Some(url),
            body: Some(
                raw_response
                    .bytes_stream()
                    .map_err(classify_transport_error)
                    .boxed(),
            ),
        })
    }
}
