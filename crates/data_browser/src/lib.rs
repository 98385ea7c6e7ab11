//! Headless core of the panel's data browser: filter expressions, paginated
//! document fetching, filter history, document edits and the table list of
//! one deployment.
pub mod banner;
pub mod filters;
pub mod history;
pub mod mutations;
pub mod pagination;
pub mod rpc;
pub mod tables;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod view_settings;

pub use self::{
    banner::ErrorBanner,
    filters::{
        FilterClause,
        FilterExpression,
        FilterOp,
        FilterToken,
        Order,
        SortConfig,
    },
    history::{
        HistoryClient,
        HistoryScope,
        TableFilterState,
    },
    mutations::DocumentMutator,
    pagination::{
        DocumentFetcher,
        FetchOutcome,
    },
    rpc::{
        ComponentId,
        DeploymentRpc,
        HttpDeploymentRpc,
    },
    tables::TablesCache,
};
