//! Live schema updates pushed by the panel's event service over
//! server-sent events.
use std::{
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use common::{
    http::{
        HttpRequest,
        TEXT_EVENT_STREAM_CONTENT_TYPE,
        categorize_http_response,
        fetch::FetchClient,
    },
    is_canceled::{
        cancelable,
        sleep_cancelable,
    },
    knobs::{
        SCHEMA_SYNC_MAX_RECONNECT_ATTEMPTS,
        SCHEMA_SYNC_RECONNECT_INTERVAL,
    },
    local_store::{
        LocalStore,
        StoreKey,
    },
};
use errors::ErrorMetadataAnyhowExt;
use futures::{
    StreamExt,
    stream::BoxStream,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

/// One dispatched server-sent event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental `text/event-stream` parser. Chunks may split lines (or UTF-8
/// sequences) anywhere.
#[derive(Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
}

impl SseParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = vec![];
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.last_id = Some(value.to_string()),
            // `retry` is ignored; reconnects use a fixed interval.
            _ => {},
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
            id: self.last_id.clone(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SchemaUpdate {
    /// `owner/name`.
    pub repo: String,
    pub branch: String,
    pub commit: String,
    /// Schema files touched by the push.
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchemaSyncEvent {
    Connected { subscription_id: Option<String> },
    SchemaUpdate(SchemaUpdate),
    Heartbeat,
}

impl SchemaSyncEvent {
    fn from_sse(event: &SseEvent) -> Option<Self> {
        #[derive(Deserialize)]
        struct ConnectedData {
            #[serde(default, alias = "subscriptionId")]
            subscription_id: Option<String>,
        }
        match event.event.as_str() {
            "connected" => {
                let data = serde_json::from_str::<ConnectedData>(&event.data).ok();
                Some(Self::Connected {
                    subscription_id: data.and_then(|d| d.subscription_id),
                })
            },
            "schema_update" => match serde_json::from_str(&event.data) {
                Ok(update) => Some(Self::SchemaUpdate(update)),
                Err(e) => {
                    tracing::warn!("Dropping malformed schema_update event: {e}");
                    None
                },
            },
            "heartbeat" => Some(Self::Heartbeat),
            other => {
                tracing::debug!("Ignoring {other} event");
                None
            },
        }
    }
}

enum StreamEnd {
    Disconnected,
    ReceiverDropped,
}

pub struct SchemaSyncSubscriber {
    events_api_url: Url,
    fetch_client: Arc<dyn FetchClient>,
    store: LocalStore,
    repos: Vec<String>,
    reconnect_interval: Duration,
    max_reconnect_attempts: u32,
}

impl SchemaSyncSubscriber {
    pub fn new(
        events_api_url: Url,
        fetch_client: Arc<dyn FetchClient>,
        store: LocalStore,
        repos: Vec<String>,
    ) -> Self {
        Self {
            events_api_url,
            fetch_client,
            store,
            repos,
            reconnect_interval: *SCHEMA_SYNC_RECONNECT_INTERVAL,
            max_reconnect_attempts: *SCHEMA_SYNC_MAX_RECONNECT_ATTEMPTS,
        }
    }

    pub fn with_reconnect(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.reconnect_interval = interval;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    fn subscribe_url(&self) -> anyhow::Result<Url> {
        let mut url = self.events_api_url.join("v1/events/subscribe")?;
        url.query_pairs_mut()
            .append_pair("repos", &self.repos.join(","))
            .append_pair("device_id", &self.store.device_id()?);
        Ok(url)
    }

    async fn connect(&self) -> anyhow::Result<BoxStream<'static, anyhow::Result<Bytes>>> {
        let mut request = HttpRequest::get(self.subscribe_url()?)
            .accept(TEXT_EVENT_STREAM_CONTENT_TYPE)
            .streaming();
        if let Some(token) = self.store.get_string(&StoreKey::GithubToken)? {
            request = request.authorization("Bearer", &token)?;
        }
        let response = self.fetch_client.fetch(request).await?;
        if !response.status.is_success() {
            categorize_http_response(response.into_http_response().await?)?;
            anyhow::bail!("Event stream answered with an unexpected status");
        }
        response
            .body
            .ok_or_else(|| anyhow::anyhow!("Event stream response has no body"))
    }

    async fn pump(
        mut body: BoxStream<'static, anyhow::Result<Bytes>>,
        events: &mpsc::Sender<SchemaSyncEvent>,
    ) -> anyhow::Result<StreamEnd> {
        let mut parser = SseParser::default();
        while let Some(chunk) = body.next().await {
            for sse in parser.push(&chunk?) {
                let Some(event) = SchemaSyncEvent::from_sse(&sse) else {
                    continue;
                };
                if events.send(event).await.is_err() {
                    return Ok(StreamEnd::ReceiverDropped);
                }
            }
        }
        Ok(StreamEnd::Disconnected)
    }

    /// Forwards events to `events` until `cancel` fires, the receiver goes
    /// away, or too many consecutive connection attempts fail. A rejected
    /// credential ends the subscription immediately.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        events: mpsc::Sender<SchemaSyncEvent>,
    ) -> anyhow::Result<()> {
        let mut failed_attempts = 0;
        loop {
            match cancelable(cancel, self.connect()).await {
                Ok(body) => {
                    failed_attempts = 0;
                    tracing::info!("Subscribed to schema updates for {:?}", self.repos);
                    match cancelable(cancel, Self::pump(body, &events)).await {
                        Ok(StreamEnd::ReceiverDropped) => return Ok(()),
                        Ok(StreamEnd::Disconnected) => {
                            tracing::info!("Schema update stream closed, reconnecting");
                        },
                        Err(e) if e.is_canceled() => return Err(e),
                        Err(e) => tracing::warn!("Schema update stream failed: {e:#}"),
                    }
                },
                Err(e) if e.is_canceled() || e.is_unauthenticated() => return Err(e),
                Err(e) => {
                    failed_attempts += 1;
                    if failed_attempts >= self.max_reconnect_attempts {
                        tracing::error!(
                            "Giving up on schema updates after {failed_attempts} attempts: {e:#}"
                        );
                        return Err(e);
                    }
                    tracing::warn!(
                        "Schema update connection failed (attempt {failed_attempts} of {}): {e:#}",
                        self.max_reconnect_attempts
                    );
                },
            }
            if events.is_closed() {
                return Ok(());
            }
            sleep_cancelable(cancel, self.reconnect_interval).await?;
        }
    }
}
