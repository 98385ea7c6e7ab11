//! Retry with exponential backoff for GitHub requests.
//!
//! Network failures, 429s, 5xxs and exhausted rate limits are retried; other
//! client errors are returned immediately. A delay requested by GitHub
//! (`Retry-After`, or `x-ratelimit-reset` once `x-ratelimit-remaining` hits
//! zero) replaces the computed backoff, capped at the maximum backoff.
use std::time::Duration;

use chrono::{
    DateTime,
    Utc,
};
use common::{
    backoff::Backoff,
    http::{
        HttpRequest,
        HttpResponse,
        categorize_http_response,
        fetch::FetchClient,
    },
    knobs::{
        GITHUB_MAX_RETRIES,
        GITHUB_RETRY_INITIAL_BACKOFF,
        GITHUB_RETRY_MAX_BACKOFF,
    },
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use http::StatusCode;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: *GITHUB_RETRY_INITIAL_BACKOFF,
            max_backoff: *GITHUB_RETRY_MAX_BACKOFF,
            max_retries: *GITHUB_MAX_RETRIES,
        }
    }
}

fn rate_limit_exhausted(response: &HttpResponse) -> bool {
    response.header_str("x-ratelimit-remaining") == Some("0")
}

fn should_retry(response: &HttpResponse) -> bool {
    response.status == StatusCode::TOO_MANY_REQUESTS
        || response.status.is_server_error()
        || (response.status == StatusCode::FORBIDDEN && rate_limit_exhausted(response))
}

/// The delay GitHub asked for, if any. `Retry-After` may be either a number
/// of seconds or an HTTP date.
pub fn requested_delay(response: &HttpResponse, now: DateTime<Utc>) -> Option<Duration> {
    let until = |at: DateTime<Utc>| (at - now).to_std().unwrap_or(Duration::ZERO);
    if let Some(retry_after) = response.header_str(http::header::RETRY_AFTER.as_str()) {
        let retry_after = retry_after.trim();
        if let Ok(seconds) = retry_after.parse::<u64>() {
            return Some(Duration::from_secs(seconds));
        }
        if let Ok(at) = DateTime::parse_from_rfc2822(retry_after) {
            return Some(until(at.with_timezone(&Utc)));
        }
        tracing::warn!("Ignoring unparseable Retry-After {retry_after:?}");
    }
    if rate_limit_exhausted(response) {
        let reset = response.header_str("x-ratelimit-reset")?.parse::<i64>().ok()?;
        return Some(until(DateTime::from_timestamp(reset, 0)?));
    }
    None
}

/// Sends `request`, retrying per `policy`. Returns the first non-retriable
/// outcome, with error statuses already turned into errors.
pub async fn with_retry(
    fetch_client: &dyn FetchClient,
    request: HttpRequest,
    policy: &RetryPolicy,
) -> anyhow::Result<HttpResponse> {
    let mut backoff = Backoff::without_jitter(policy.initial_backoff, policy.max_backoff);
    loop {
        let attempt = backoff.failures();
        let (requested, e) = match fetch_client.fetch_buffered(request.clone()).await {
            Ok(response) if !should_retry(&response) => return categorize_http_response(response),
            Ok(response) => {
                let requested = requested_delay(&response, Utc::now());
                let rate_limited = rate_limit_exhausted(&response);
                let e = categorize_http_response(response).err().unwrap_or_else(|| {
                    anyhow::anyhow!("Retriable response categorized as success")
                });
                let e = if rate_limited {
                    e.context(ErrorMetadata::rate_limited(
                        "GithubRateLimited",
                        "GitHub API rate limit exceeded",
                    ))
                } else {
                    e
                };
                (requested, e)
            },
            Err(e) if e.is_retriable() => (None, e),
            Err(e) => return Err(e),
        };
        if attempt >= policy.max_retries {
            tracing::error!(
                "{} {} failed after {attempt} retries: {e:#}",
                request.method,
                request.url.path()
            );
            return Err(e);
        }
        let computed = backoff.fail(&mut rand::rng());
        let delay = requested.unwrap_or(computed).min(policy.max_backoff);
        tracing::warn!(
            "{} {} failed ({e:#}), retry {} of {} in {}ms",
            request.method,
            request.url.path(),
            attempt + 1,
            policy.max_retries,
            delay.as_millis()
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{
        TimeZone,
        Utc,
    };
    use common::{
        http::{
            HttpRequest,
            HttpResponse,
        },
        testing::{
            StaticFetchClient,
            StaticResponse,
        },
    };
    use errors::{
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
    };
    use http::{
        HeaderMap,
        HeaderValue,
        Method,
        StatusCode,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::time::Instant;

    use super::{
        RetryPolicy,
        requested_delay,
        with_retry,
    };

    const PATH: &str = "/user/repos";

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(10000),
            max_retries: 3,
        }
    }

    fn request() -> anyhow::Result<HttpRequest> {
        Ok(HttpRequest::get(
            format!("https://api.github.com{PATH}").parse()?,
        ))
    }

    fn response_with(headers: &[(&'static str, &str)]) -> HttpResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        HttpResponse::new(StatusCode::TOO_MANY_REQUESTS, map, vec![], None)
    }

    #[test]
    fn test_requested_delay() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap();
        assert_eq!(
            requested_delay(&response_with(&[("retry-after", "7")]), now),
            Some(Duration::from_secs(7))
        );
        assert_eq!(
            requested_delay(
                &response_with(&[("retry-after", "Wed, 21 Oct 2015 07:28:30 GMT")]),
                now
            ),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            requested_delay(
                &response_with(&[("retry-after", "Wed, 21 Oct 2015 07:27:00 GMT")]),
                now
            ),
            Some(Duration::ZERO)
        );
        let reset = (now.timestamp() + 12).to_string();
        assert_eq!(
            requested_delay(
                &response_with(&[("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", &reset)]),
                now
            ),
            Some(Duration::from_secs(12))
        );
        assert_eq!(
            requested_delay(
                &response_with(&[("x-ratelimit-remaining", "17"), ("x-ratelimit-reset", &reset)]),
                now
            ),
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_schedule() -> anyhow::Result<()> {
        let client = StaticFetchClient::new();
        for _ in 0..3 {
            client.route(
                Method::GET,
                PATH,
                StaticResponse::status(StatusCode::SERVICE_UNAVAILABLE, "busy"),
            );
        }
        client.route(Method::GET, PATH, StaticResponse::ok_json(&json!([])));

        let start = Instant::now();
        let response = with_retry(&client, request()?, &policy()).await?;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(start.elapsed(), Duration::from_millis(1000 + 2000 + 4000));
        assert_eq!(client.requests_to(PATH).len(), 4);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() -> anyhow::Result<()> {
        let client = StaticFetchClient::new();
        client.route(
            Method::GET,
            PATH,
            StaticResponse::Failure(ErrorMetadata::network("connection reset")),
        );
        let err = with_retry(&client, request()?, &policy())
            .await
            .unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(client.requests_to(PATH).len(), 4);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_are_not_retried() -> anyhow::Result<()> {
        let client = StaticFetchClient::new();
        client.route(
            Method::GET,
            PATH,
            StaticResponse::status(StatusCode::NOT_FOUND, "Not Found"),
        );
        let err = with_retry(&client, request()?, &policy())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(client.requests_to(PATH).len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_is_honoured_and_capped() -> anyhow::Result<()> {
        let client = StaticFetchClient::new();
        client
            .route(
                Method::GET,
                PATH,
                StaticResponse::status(StatusCode::TOO_MANY_REQUESTS, "")
                    .with_header("retry-after", "3"),
            )
            .route(
                Method::GET,
                PATH,
                StaticResponse::status(StatusCode::TOO_MANY_REQUESTS, "")
                    .with_header("retry-after", "600"),
            )
            .route(Method::GET, PATH, StaticResponse::ok_json(&json!([])));
        let start = Instant::now();
        with_retry(&client, request()?, &policy()).await?;
        assert_eq!(start.elapsed(), Duration::from_secs(3 + 10));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_rate_limit_on_forbidden() -> anyhow::Result<()> {
        let client = StaticFetchClient::new();
        client.route(
            Method::GET,
            PATH,
            StaticResponse::status(StatusCode::FORBIDDEN, "API rate limit exceeded")
                .with_header("x-ratelimit-remaining", "0"),
        );
        let err = with_retry(&client, request()?, &policy())
            .await
            .unwrap_err();
        assert_eq!(err.short_msg(), "GithubRateLimited");
        assert_eq!(client.requests_to(PATH).len(), 4);

        let client = StaticFetchClient::new();
        client.route(
            Method::GET,
            PATH,
            StaticResponse::status(StatusCode::FORBIDDEN, "Resource not accessible")
                .with_header("x-ratelimit-remaining", "4999"),
        );
        let err = with_retry(&client, request()?, &policy())
            .await
            .unwrap_err();
        assert_eq!(client.requests_to(PATH).len(), 1);
        assert!(!err.is_retriable());
        Ok(())
    }
}
