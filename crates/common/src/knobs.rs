//! Tunable limits and parameters for the panel's client core.
//!
//! Every knob can be overridden with an environment variable of the same
//! name.
#![deny(missing_docs)]

use std::{
    sync::LazyLock,
    time::Duration,
};

use cmd_util::env::env_config;

/// Number of documents requested per page by the table browser.
pub static PANEL_PAGE_SIZE: LazyLock<usize> = LazyLock::new(|| env_config("PANEL_PAGE_SIZE", 50));

/// Timeout applied to every outgoing HTTP request. Streaming requests (the
/// schema-update event source) are exempt.
pub static HTTP_REQUEST_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("HTTP_REQUEST_TIMEOUT_SECS", 30)));

/// First delay of the GitHub retry schedule.
pub static GITHUB_RETRY_INITIAL_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("GITHUB_RETRY_INITIAL_BACKOFF_MS", 1000)));

/// Cap on a single GitHub retry delay, including delays requested by the
/// server through `Retry-After`.
pub static GITHUB_RETRY_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("GITHUB_RETRY_MAX_BACKOFF_MS", 10000)));

/// How many times a failed GitHub request is retried before giving up.
pub static GITHUB_MAX_RETRIES: LazyLock<u32> =
    LazyLock::new(|| env_config("GITHUB_MAX_RETRIES", 3));

/// `per_page` for paginated GitHub listings. GitHub caps this at 100.
pub static GITHUB_PAGE_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("GITHUB_PAGE_SIZE", 100).clamp(1, 100));

/// Poll interval for the device flow when the server does not send one.
pub static DEVICE_FLOW_DEFAULT_INTERVAL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("DEVICE_FLOW_DEFAULT_INTERVAL_SECS", 5)));

/// Amount added to the device flow poll interval on every `slow_down`.
pub static DEVICE_FLOW_SLOW_DOWN_INCREMENT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("DEVICE_FLOW_SLOW_DOWN_SECS", 5)));

/// Fixed delay between schema-update stream reconnect attempts.
pub static SCHEMA_SYNC_RECONNECT_INTERVAL: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_millis(env_config("SCHEMA_SYNC_RECONNECT_INTERVAL_MS", 3000))
});

/// Consecutive failed connection attempts after which the schema-update
/// subscriber gives up.
pub static SCHEMA_SYNC_MAX_RECONNECT_ATTEMPTS: LazyLock<u32> =
    LazyLock::new(|| env_config("SCHEMA_SYNC_MAX_RECONNECT_ATTEMPTS", 10));

/// Narrowest the sidebar may be resized to, in pixels.
pub static SIDEBAR_MIN_WIDTH: LazyLock<u32> =
    LazyLock::new(|| env_config("SIDEBAR_MIN_WIDTH", 180));

/// Widest the sidebar may be resized to, in pixels.
pub static SIDEBAR_MAX_WIDTH: LazyLock<u32> =
    LazyLock::new(|| env_config("SIDEBAR_MAX_WIDTH", 480));
