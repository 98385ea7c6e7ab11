//! Calls into a deployment: system queries and mutations over the HTTP
//! function API, and the table shapes endpoint.
use std::{
    fmt,
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use common::http::{
    HttpRequest,
    categorize_http_response,
    fetch::FetchClient,
};
use errors::ErrorMetadata;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::{
    Value as JsonValue,
    json,
};
use url::Url;

/// Function paths the browser relies on.
pub mod system_udfs {
    pub const PAGINATED_TABLE_DOCUMENTS: &str = "_system/frontend/paginatedTableDocuments:default";
    pub const GET_TABLE_MAPPING: &str = "_system/frontend/getTableMapping";
    pub const INDEXES: &str = "_system/frontend/indexes";
    pub const PATCH_DOCUMENTS_FIELDS: &str = "_system/frontend/patchDocumentsFields";
    pub const DELETE_DOCUMENTS: &str = "_system/frontend/deleteDocuments";
    pub const ADD_DOCUMENT: &str = "_system/frontend/addDocument";

    pub const FILTER_HISTORY_PUSH: &str = "filterHistory:push";
    pub const FILTER_HISTORY_UNDO: &str = "filterHistory:undo";
    pub const FILTER_HISTORY_REDO: &str = "filterHistory:redo";
    pub const FILTER_HISTORY_STATUS: &str = "filterHistory:getStatus";
}

/// Component a table lives in. `None` everywhere means the root app.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(String);

impl ComponentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait DeploymentRpc: Send + Sync + 'static {
    async fn query(&self, path: &str, args: JsonValue) -> anyhow::Result<JsonValue>;
    async fn mutation(&self, path: &str, args: JsonValue) -> anyhow::Result<JsonValue>;
    /// Table name to shape JSON, as served by `/api/shapes2`.
    async fn shapes(&self, component: Option<&ComponentId>) -> anyhow::Result<JsonValue>;
}

#[async_trait]
impl<R: DeploymentRpc + ?Sized> DeploymentRpc for Arc<R> {
    async fn query(&self, path: &str, args: JsonValue) -> anyhow::Result<JsonValue> {
        (**self).query(path, args).await
    }

    async fn mutation(&self, path: &str, args: JsonValue) -> anyhow::Result<JsonValue> {
        (**self).mutation(path, args).await
    }

    async fn shapes(&self, component: Option<&ComponentId>) -> anyhow::Result<JsonValue> {
        (**self).shapes(component).await
    }
}

#[derive(Serialize)]
struct UdfPostRequest<'a> {
    path: &'a str,
    args: JsonValue,
    format: &'static str,
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
enum UdfResponse {
    Success {
        value: JsonValue,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error_message: String,
        #[serde(default)]
        error_data: Option<JsonValue>,
    },
}

/// [`DeploymentRpc`] over the deployment's HTTP API, authenticated with an
/// admin key.
pub struct HttpDeploymentRpc {
    deployment_url: Url,
    admin_key: String,
    fetch_client: Arc<dyn FetchClient>,
}

impl HttpDeploymentRpc {
    pub fn new(
        deployment_url: Url,
        admin_key: String,
        fetch_client: Arc<dyn FetchClient>,
    ) -> Self {
        Self {
            deployment_url,
            admin_key,
            fetch_client,
        }
    }

    pub fn deployment_url(&self) -> &Url {
        &self.deployment_url
    }

    fn endpoint(&self, path: &str) -> anyhow::Result<Url> {
        self.deployment_url
            .join(path)
            .with_context(|| format!("Invalid deployment URL {}", self.deployment_url))
    }

    async fn call(&self, endpoint: &str, path: &str, args: JsonValue) -> anyhow::Result<JsonValue> {
        tracing::debug!("Calling {path} via {endpoint}");
        let request = HttpRequest::post_json(
            self.endpoint(endpoint)?,
            &UdfPostRequest {
                path,
                args,
                format: "json",
            },
        )?
        .authorization("Convex", &self.admin_key)?;
        let response = self.fetch_client.fetch_buffered(request).await?;
        let response = categorize_http_response(response)?;
        match response.json::<UdfResponse>()? {
            UdfResponse::Success { value } => Ok(value),
            UdfResponse::Error {
                error_message,
                error_data,
            } => {
                if let Some(data) = error_data {
                    tracing::debug!("{path} failed with data {data}");
                }
                Err(ErrorMetadata::bad_request("FunctionFailed", error_message).into())
            },
        }
    }
}

#[async_trait]
impl DeploymentRpc for HttpDeploymentRpc {
    async fn query(&self, path: &str, args: JsonValue) -> anyhow::Result<JsonValue> {
        self.call("api/query", path, args).await
    }

    async fn mutation(&self, path: &str, args: JsonValue) -> anyhow::Result<JsonValue> {
        self.call("api/mutation", path, args).await
    }

    async fn shapes(&self, component: Option<&ComponentId>) -> anyhow::Result<JsonValue> {
        let mut url = self.endpoint("api/shapes2")?;
        if let Some(component) = component {
            url.query_pairs_mut()
                .append_pair("component", &component.to_string());
        }
        let request = HttpRequest::get(url).authorization("Convex", &self.admin_key)?;
        let response = self.fetch_client.fetch_buffered(request).await?;
        categorize_http_response(response)?.json()
    }
}

/// `componentId` argument shared by the system functions.
pub(crate) fn component_arg(component: Option<&ComponentId>) -> JsonValue {
    match component {
        Some(c) => json!(c.to_string()),
        None => JsonValue::Null,
    }
}
