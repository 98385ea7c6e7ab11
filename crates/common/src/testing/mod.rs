//! Test helpers for types defined in this crate
use std::{
    collections::{
        BTreeMap,
        VecDeque,
    },
    fmt::Display,
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
pub use cmd_util::env::config_test as init_test_logging;
use errors::ErrorMetadata;
use futures::{
    StreamExt,
    stream,
};
use http::{
    HeaderMap,
    HeaderValue,
    Method,
    StatusCode,
};
use parking_lot::Mutex;
use serde::Serialize;

use crate::http::{
    APPLICATION_JSON_CONTENT_TYPE,
    HttpRequest,
    HttpResponseStream,
    TEXT_EVENT_STREAM_CONTENT_TYPE,
    fetch::FetchClient,
};

pub fn assert_contains(error: &impl Display, expected: &str) {
    assert!(
        format!("{}", error).contains(expected),
        "\nExpected: {expected}\nActual: {error}"
    );
}

/// What a [`StaticFetchClient`] route answers with.
#[derive(Clone, Debug)]
pub enum StaticResponse {
    Body {
        status: StatusCode,
        headers: HeaderMap,
        body: Vec<u8>,
    },
    /// A streamed body delivered chunk by chunk. With `hang` set the stream
    /// never ends after the last chunk, like an idle long-lived connection.
    Stream {
        status: StatusCode,
        chunks: Vec<String>,
        hang: bool,
    },
    /// The request fails before any response arrives.
    Failure(ErrorMetadata),
}

impl StaticResponse {
    pub fn json(status: StatusCode, body: &impl Serialize) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, APPLICATION_JSON_CONTENT_TYPE);
        Self::Body {
            status,
            headers,
            body: serde_json::to_vec(body).unwrap_or_default(),
        }
    }

    pub fn ok_json(body: &impl Serialize) -> Self {
        Self::json(StatusCode::OK, body)
    }

    pub fn status(status: StatusCode, body: &str) -> Self {
        Self::Body {
            status,
            headers: HeaderMap::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn with_header(self, name: &'static str, value: &str) -> Self {
        match self {
            Self::Body {
                status,
                mut headers,
                body,
            } => {
                if let Ok(value) = HeaderValue::from_str(value) {
                    headers.insert(name, value);
                }
                Self::Body {
                    status,
                    headers,
                    body,
                }
            },
            other => other,
        }
    }

    pub fn event_stream(chunks: impl IntoIterator<Item = impl Into<String>>, hang: bool) -> Self {
        Self::Stream {
            status: StatusCode::OK,
            chunks: chunks.into_iter().map(Into::into).collect(),
            hang,
        }
    }

    fn into_stream(self) -> anyhow::Result<HttpResponseStream> {
        match self {
            Self::Body {
                status,
                headers,
                body,
            } => Ok(HttpResponseStream {
                body: Some(stream::once(async move { Ok(Bytes::from(body)) }).boxed()),
                status,
                headers,
                url: None,
            }),
            Self::Stream {
                status,
                chunks,
                hang,
            } => {
                let mut headers = HeaderMap::new();
                headers.insert(http::header::CONTENT_TYPE, TEXT_EVENT_STREAM_CONTENT_TYPE);
                let body = stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))));
                let body = if hang {
                    body.chain(stream::pending()).boxed()
                } else {
                    body.boxed()
                };
                Ok(HttpResponseStream {
                    body: Some(body),
                    status,
                    headers,
                    url: None,
                })
            },
            Self::Failure(e) => Err(e.into()),
        }
    }
}

/// A [`FetchClient`] that answers from scripted routes keyed by method and
/// URL path. Each route replays its responses in order and keeps repeating
/// the last one. Every request is recorded for later inspection.
#[derive(Clone, Default)]
pub struct StaticFetchClient {
    inner: Arc<Mutex<StaticFetchClientInner>>,
}

#[derive(Default)]
struct StaticFetchClientInner {
    routes: BTreeMap<(String, String), VecDeque<StaticResponse>>,
    requests: Vec<HttpRequest>,
}

impl StaticFetchClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, method: Method, path: &str, response: StaticResponse) -> &Self {
        self.inner
            .lock()
            .routes
            .entry((method.to_string(), path.to_string()))
            .or_default()
            .push_back(response);
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.inner.lock().requests.clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<HttpRequest> {
        self.inner
            .lock()
            .requests
            .iter()
            .filter(|r| r.url.path() == path)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FetchClient for StaticFetchClient {
    async fn fetch(&self, request: HttpRequest) -> anyhow::Result<HttpResponseStream> {
        let key = (request.method.to_string(), request.url.path().to_string());
        let response = {
            let mut inner = self.inner.lock();
            inner.requests.push(request.clone());
            match inner.routes.get_mut(&key) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        let Some(response) = response else {
            anyhow::bail!(ErrorMetadata::not_found(
                "NoScriptedResponse",
                format!("No scripted response for {} {}", key.0, key.1)
            ));
        };
        response.into_stream()
    }
}

#[cfg(test)]
mod tests {
    use http::{
        Method,
        StatusCode,
    };
    use serde_json::json;

    use super::{
        StaticFetchClient,
        StaticResponse,
    };
    use crate::http::{
        HttpRequest,
        fetch::FetchClient,
    };

    #[tokio::test]
    async fn test_routes_replay_in_order() -> anyhow::Result<()> {
        let client = StaticFetchClient::new();
        client
            .route(
                Method::GET,
                "/a",
                StaticResponse::status(StatusCode::BAD_GATEWAY, ""),
            )
            .route(Method::GET, "/a", StaticResponse::ok_json(&json!({"ok": 1})));
        let url: url::Url = "https://example.com/a".parse()?;
        let first = client.fetch_buffered(HttpRequest::get(url.clone())).await?;
        assert_eq!(first.status, StatusCode::BAD_GATEWAY);
        for _ in 0..2 {
            let next = client.fetch_buffered(HttpRequest::get(url.clone())).await?;
            assert_eq!(next.json::<serde_json::Value>()?, json!({"ok": 1}));
        }
        assert_eq!(client.requests_to("/a").len(), 3);
        assert!(
            client
                .fetch(HttpRequest::get("https://example.com/b".parse()?))
                .await
                .is_err()
        );
        Ok(())
    }
}
