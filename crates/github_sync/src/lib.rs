//! GitHub integration for the panel: a retrying REST client for picking a
//! repository and reading its schema, the OAuth device flow used to connect
//! an account, the schema-update event stream and the per-project repo
//! selection.
pub mod client;
pub mod device_flow;
pub mod repo_selection;
pub mod retry;
pub mod schema_sync;

pub use self::{
    client::{
        GithubClient,
        RepoSearch,
    },
    device_flow::{
        DeviceCode,
        DeviceFlow,
    },
    repo_selection::{
        RepoSelection,
        RepoSelectionStore,
    },
    retry::{
        RetryPolicy,
        with_retry,
    },
    schema_sync::{
        SchemaSyncEvent,
        SchemaSyncSubscriber,
        SchemaUpdate,
    },
};
