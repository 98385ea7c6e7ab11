use std::time::Duration;

use anyhow::Context;
use errors::{
    ErrorCode,
    ErrorMetadata,
};
use futures::{
    StreamExt,
    stream::BoxStream,
};
use http::{
    HeaderMap,
    Method,
    StatusCode,
    header::{
        ACCEPT,
        AUTHORIZATION,
        CONTENT_TYPE,
        HeaderName,
        HeaderValue,
    },
};
use serde::{
    Serialize,
    de::DeserializeOwned,
};
use url::Url;

use crate::knobs::HTTP_REQUEST_TIMEOUT;

pub mod fetch;

#[allow(clippy::declare_interior_mutable_const)]
pub const APPLICATION_JSON_CONTENT_TYPE: HeaderValue = HeaderValue::from_static("application/json");
#[allow(clippy::declare_interior_mutable_const)]
pub const TEXT_EVENT_STREAM_CONTENT_TYPE: HeaderValue =
    HeaderValue::from_static("text/event-stream");

/// Error bodies are truncated to this many bytes before they end up in an
/// error message.
const MAX_ERROR_BODY_LEN: usize = 1000;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub headers: HeaderMap,
    pub url: Url,
    pub method: Method,
    pub body: Option<Vec<u8>>,
    /// `None` for long-lived streaming requests.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            headers: HeaderMap::new(),
            url,
            method,
            body: None,
            timeout: Some(*HTTP_REQUEST_TIMEOUT),
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post_json(url: Url, body: &impl Serialize) -> anyhow::Result<Self> {
        let mut request = Self::new(Method::POST, url);
        request.body = Some(serde_json::to_vec(body)?);
        request
            .headers
            .insert(CONTENT_TYPE, APPLICATION_JSON_CONTENT_TYPE);
        Ok(request.accept(APPLICATION_JSON_CONTENT_TYPE))
    }

    pub fn header(mut self, name: HeaderName, value: &str) -> anyhow::Result<Self> {
        self.headers.insert(
            name.clone(),
            HeaderValue::from_str(value).with_context(|| format!("Invalid {name} header"))?,
        );
        Ok(self)
    }

    pub fn accept(mut self, value: HeaderValue) -> Self {
        self.headers.insert(ACCEPT, value);
        self
    }

    /// Sets `authorization: <scheme> <token>`. The token is marked sensitive
    /// so it never shows up in `Debug` output.
    pub fn authorization(mut self, scheme: &str, token: &str) -> anyhow::Result<Self> {
        let mut value = HeaderValue::from_str(&format!("{scheme} {token}"))
            .context("Credential contains characters that are not valid in a header")?;
        value.set_sensitive(true);
        self.headers.insert(AUTHORIZATION, value);
        Ok(self)
    }

    pub fn streaming(mut self) -> Self {
        self.timeout = None;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub body: Vec<u8>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub url: Option<Url>,
}

impl HttpResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>, url: Option<Url>) -> Self {
        Self {
            body,
            status,
            headers,
            url,
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_slice(&self.body).with_context(|| {
            format!(
                "Invalid JSON response from {}: {}",
                self.url
                    .as_ref()
                    .map(|u| u.to_string())
                    .unwrap_or_default(),
                truncated_body(&self.body)
            )
        })
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl From<HttpResponse> for HttpResponseStream {
    fn from(value: HttpResponse) -> Self {
        let body = bytes::Bytes::from(value.body);
        Self {
            body: Some(futures::stream::once(async move { Ok(body) }).boxed()),
            status: value.status,
            headers: value.headers,
            url: value.url,
        }
    }
}

pub struct HttpResponseStream {
    pub body: Option<BoxStream<'static, anyhow::Result<bytes::Bytes>>>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub url: Option<Url>,
}

impl HttpResponseStream {
    pub async fn into_http_response(self) -> anyhow::Result<HttpResponse> {
        let mut bytes = vec![];
        if let Some(mut body) = self.body {
            while let Some(chunk) = body.next().await.transpose()? {
                bytes.extend_from_slice(&chunk);
            }
        }
        Ok(HttpResponse {
            body: bytes,
            status: self.status,
            headers: self.headers,
            url: self.url,
        })
    }
}

/// Turns 4xx/5xx responses into errors tagged with the matching
/// [`ErrorMetadata`]. The (truncated) body is kept in the message since
/// both the deployment and GitHub put the useful explanation there.
pub fn categorize_http_response(response: HttpResponse) -> anyhow::Result<HttpResponse> {
    if !(response.status.is_server_error() || response.status.is_client_error()) {
        return Ok(response);
    }
    let error_code = ErrorCode::from_http_status_code(response.status)
        .unwrap_or(ErrorCode::BadRequest);
    let canonical_reason = response.status.canonical_reason().unwrap_or("Unknown");
    let body = truncated_body(&response.body);
    let msg = if body.is_empty() {
        format!("HTTP {} {canonical_reason}", response.status.as_u16())
    } else {
        format!("HTTP {} {canonical_reason}: {body}", response.status.as_u16())
    };
    let short_msg: &'static str = error_code.into();
    Err(ErrorMetadata {
        code: error_code,
        short_msg: short_msg.into(),
        msg: msg.into(),
    }
    .into())
}

fn truncated_body(body: &[u8]) -> String {
    let body_str = String::from_utf8_lossy(body);
    if body_str.len() > MAX_ERROR_BODY_LEN {
        let mut end = MAX_ERROR_BODY_LEN;
        while !body_str.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body_str[..end])
    } else {
        body_str.into_owned()
    }
}
