//! OAuth device flow for connecting a GitHub account. The auth service
//! proxies GitHub's device endpoints so no client secret ships with the
//! panel.
use std::{
    sync::Arc,
    time::Duration,
};

use common::{
    http::{
        HttpRequest,
        categorize_http_response,
        fetch::FetchClient,
    },
    is_canceled::{
        cancelable,
        sleep_cancelable,
    },
    knobs::{
        DEVICE_FLOW_DEFAULT_INTERVAL,
        DEVICE_FLOW_SLOW_DOWN_INCREMENT,
    },
    local_store::{
        LocalStore,
        StoreKey,
    },
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

/// What the user needs to finish authorizing on another device.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Minimum seconds between polls.
    #[serde(default)]
    pub interval: Option<u64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TokenResponse {
    Granted {
        access_token: String,
    },
    Error {
        error: String,
        #[serde(default)]
        error_description: Option<String>,
        #[serde(default)]
        interval: Option<u64>,
    },
}

pub struct DeviceFlow {
    auth_api_url: Url,
    fetch_client: Arc<dyn FetchClient>,
    store: LocalStore,
}

impl DeviceFlow {
    pub fn new(auth_api_url: Url, fetch_client: Arc<dyn FetchClient>, store: LocalStore) -> Self {
        Self {
            auth_api_url,
            fetch_client,
            store,
        }
    }

    pub async fn request_code(&self) -> anyhow::Result<DeviceCode> {
        let url = self.auth_api_url.join("v1/github/device/code")?;
        let response = self
            .fetch_client
            .fetch_buffered(HttpRequest::post_json(url, &json!({}))?)
            .await?;
        let code: DeviceCode = categorize_http_response(response)?.json()?;
        tracing::info!(
            "Enter code {} at {} to connect GitHub",
            code.user_code,
            code.verification_uri
        );
        Ok(code)
    }

    /// Polls until the user approves or denies the request, the code
    /// expires, or `cancel` fires. The granted token is stored locally and
    /// returned.
    pub async fn poll_for_token(
        &self,
        code: &DeviceCode,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let url = self.auth_api_url.join("v1/github/device/token")?;
        let deadline = code
            .expires_in
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        let mut interval = code
            .interval
            .map(Duration::from_secs)
            .unwrap_or(*DEVICE_FLOW_DEFAULT_INTERVAL);
        loop {
            sleep_cancelable(cancel, interval).await?;
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                anyhow::bail!(device_code_expired());
            }
            let request =
                HttpRequest::post_json(url.clone(), &json!({ "device_code": code.device_code }))?;
            let response = match cancelable(cancel, self.fetch_client.fetch_buffered(request)).await
            {
                Ok(response) => response,
                Err(e) if e.is_retriable() => {
                    tracing::warn!("Device flow poll failed, will retry: {e:#}");
                    continue;
                },
                Err(e) => return Err(e),
            };
            if response.status.is_server_error() {
                tracing::warn!("Device flow poll returned {}, will retry", response.status);
                continue;
            }
            // OAuth error responses may come back as 400 with a JSON body.
            let parsed = match response.json::<TokenResponse>() {
                Ok(parsed) => parsed,
                Err(e) => return Err(categorize_http_response(response).err().unwrap_or(e)),
            };
            match parsed {
                TokenResponse::Granted { access_token } => {
                    self.store
                        .set_string(&StoreKey::GithubToken, access_token.clone())?;
                    tracing::info!("GitHub account connected");
                    return Ok(access_token);
                },
                TokenResponse::Error {
                    error,
                    error_description,
                    interval: server_interval,
                } => match error.as_str() {
                    "authorization_pending" => {},
                    "slow_down" => {
                        interval = server_interval
                            .map(Duration::from_secs)
                            .unwrap_or(interval + *DEVICE_FLOW_SLOW_DOWN_INCREMENT);
                        tracing::debug!("Device flow asked to slow down to {interval:?}");
                    },
                    "expired_token" => anyhow::bail!(device_code_expired()),
                    "access_denied" => anyhow::bail!(ErrorMetadata::forbidden(
                        "GithubAccessDenied",
                        "GitHub authorization was denied"
                    )),
                    _ => anyhow::bail!(ErrorMetadata::bad_request(
                        "DeviceFlowFailed",
                        error_description.unwrap_or(error)
                    )),
                },
            }
        }
    }

    pub fn disconnect(&self) -> anyhow::Result<()> {
        self.store.remove(&StoreKey::GithubToken)
    }
}

fn device_code_expired() -> ErrorMetadata {
    ErrorMetadata::bad_request(
        "DeviceCodeExpired",
        "The GitHub device code expired before it was approved. Start again.",
    )
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::Duration,
    };

    use common::{
        local_store::{
            LocalStore,
            StoreKey,
        },
        testing::{
            StaticFetchClient,
            StaticResponse,
        },
    };
    use errors::ErrorMetadataAnyhowExt;
    use http::{
        Method,
        StatusCode,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::{
        DeviceCode,
        DeviceFlow,
    };

    const TOKEN_PATH: &str = "/v1/github/device/token";

    fn flow(fetch: &StaticFetchClient) -> anyhow::Result<(DeviceFlow, LocalStore)> {
        let store = LocalStore::in_memory();
        let flow = DeviceFlow::new(
            "https://auth.panel.test/".parse()?,
            Arc::new(fetch.clone()),
            store.clone(),
        );
        Ok((flow, store))
    }

    fn code(interval: Option<u64>) -> DeviceCode {
        DeviceCode {
            device_code: "dc_1".into(),
            user_code: "ABCD-1234".into(),
            verification_uri: "https://github.com/login/device".into(),
            expires_in: Some(900),
            interval,
        }
    }

    fn oauth_error(error: &str) -> StaticResponse {
        StaticResponse::ok_json(&json!({ "error": error }))
    }

    #[tokio::test]
    async fn test_request_code() -> anyhow::Result<()> {
        let fetch = StaticFetchClient::new();
        fetch.route(
            Method::POST,
            "/v1/github/device/code",
            StaticResponse::ok_json(&json!({
                "device_code": "dc_1",
                "user_code": "ABCD-1234",
                "verification_uri": "https://github.com/login/device",
                "expires_in": 900,
                "interval": 5,
            })),
        );
        let (flow, _) = flow(&fetch)?;
        assert_eq!(flow.request_code().await?, code(Some(5)));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_then_slow_down_then_granted() -> anyhow::Result<()> {
        let fetch = StaticFetchClient::new();
        fetch
            .route(Method::POST, TOKEN_PATH, oauth_error("authorization_pending"))
            .route(Method::POST, TOKEN_PATH, oauth_error("slow_down"))
            .route(
                Method::POST,
                TOKEN_PATH,
                StaticResponse::ok_json(&json!({"access_token": "gho_abc", "token_type": "bearer"})),
            );
        let (flow, store) = flow(&fetch)?;
        let start = Instant::now();
        let token = flow
            .poll_for_token(&code(None), &CancellationToken::new())
            .await?;
        assert_eq!(token, "gho_abc");
        // 5s, 5s, then 10s after slowing down.
        assert_eq!(start.elapsed(), Duration::from_secs(20));
        assert_eq!(
            store.get_string(&StoreKey::GithubToken)?.as_deref(),
            Some("gho_abc")
        );
        let requests = fetch.requests_to(TOKEN_PATH);
        assert_eq!(requests.len(), 3);
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(requests[0].body.as_deref().unwrap_or_default())?,
            json!({"device_code": "dc_1"})
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_down_uses_server_interval() -> anyhow::Result<()> {
        let fetch = StaticFetchClient::new();
        fetch
            .route(
                Method::POST,
                TOKEN_PATH,
                StaticResponse::ok_json(&json!({"error": "slow_down", "interval": 7})),
            )
            .route(
                Method::POST,
                TOKEN_PATH,
                StaticResponse::ok_json(&json!({"access_token": "gho_abc"})),
            );
        let (flow, _) = flow(&fetch)?;
        let start = Instant::now();
        flow.poll_for_token(&code(Some(2)), &CancellationToken::new())
            .await?;
        assert_eq!(start.elapsed(), Duration::from_secs(2 + 7));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_errors() -> anyhow::Result<()> {
        let fetch = StaticFetchClient::new();
        fetch.route(Method::POST, TOKEN_PATH, oauth_error("expired_token"));
        let (expired, expired_store) = flow(&fetch)?;
        let err = expired
            .poll_for_token(&code(Some(1)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_bad_request());
        assert_eq!(err.short_msg(), "DeviceCodeExpired");
        assert_eq!(expired_store.get_string(&StoreKey::GithubToken)?, None);

        let fetch = StaticFetchClient::new();
        fetch.route(
            Method::POST,
            TOKEN_PATH,
            StaticResponse::json(StatusCode::BAD_REQUEST, &json!({"error": "access_denied"})),
        );
        let (denied, denied_store) = flow(&fetch)?;
        let err = denied
            .poll_for_token(&code(Some(1)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_forbidden());
        assert_eq!(denied_store.get_string(&StoreKey::GithubToken)?, None);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_expiry() -> anyhow::Result<()> {
        let fetch = StaticFetchClient::new();
        fetch.route(Method::POST, TOKEN_PATH, oauth_error("authorization_pending"));
        let (flow, _) = flow(&fetch)?;
        let code = DeviceCode {
            expires_in: Some(12),
            ..code(Some(5))
        };
        let err = flow
            .poll_for_token(&code, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.short_msg(), "DeviceCodeExpired");
        assert_eq!(fetch.requests_to(TOKEN_PATH).len(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling() -> anyhow::Result<()> {
        let fetch = StaticFetchClient::new();
        fetch.route(Method::POST, TOKEN_PATH, oauth_error("authorization_pending"));
        let (flow, _) = flow(&fetch)?;
        let cancel = CancellationToken::new();
        let code = code(Some(5));
        let poll = flow.poll_for_token(&code, &cancel);
        let user_cancels = async {
            tokio::time::sleep(Duration::from_secs(12)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(poll, user_cancels);
        assert!(result.unwrap_err().is_canceled());
        assert_eq!(fetch.requests_to(TOKEN_PATH).len(), 2);
        Ok(())
    }
}
