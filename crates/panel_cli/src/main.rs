use std::{
    collections::BTreeMap,
    sync::Arc,
};

use clap::Parser;
use cmd_util::env::config_tool;
use common::{
    http::fetch::{
        FetchClient,
        ReqwestFetchClient,
    },
    local_store::{
        LocalStore,
        StoreKey,
    },
};
use data_browser::{
    ComponentId,
    DocumentFetcher,
    DocumentMutator,
    ErrorBanner,
    FilterClause,
    FilterExpression,
    HttpDeploymentRpc,
    Order,
    SortConfig,
    TablesCache,
    filters::{
        parse_free_text,
        sort_documents,
    },
    tables::IndexKind,
    view_settings::TableViewSettings,
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use github_sync::{
    DeviceFlow,
    GithubClient,
    RepoSearch,
    RepoSelection,
    RepoSelectionStore,
    SchemaSyncEvent,
    SchemaSyncSubscriber,
};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use value::{
    TableDocument,
    TableName,
};

use crate::config::{
    Command,
    PanelConfig,
    parse_repo,
};

mod config;

struct Deployment {
    rpc: Arc<HttpDeploymentRpc>,
    /// Host name, used to key saved views.
    name: String,
    component: Option<ComponentId>,
}

impl Deployment {
    fn connect(config: &PanelConfig, fetch_client: Arc<dyn FetchClient>) -> anyhow::Result<Self> {
        let url = config.deployment_url.clone().ok_or_else(|| {
            ErrorMetadata::bad_request(
                "MissingDeploymentUrl",
                "Pass --deployment-url or set CONVEX_DEPLOYMENT_URL",
            )
        })?;
        let admin_key = config.admin_key.clone().ok_or_else(|| {
            ErrorMetadata::bad_request(
                "MissingAdminKey",
                "Pass --admin-key or set CONVEX_ADMIN_KEY",
            )
        })?;
        let name = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => url.to_string(),
        };
        Ok(Self {
            rpc: Arc::new(HttpDeploymentRpc::new(url, admin_key, fetch_client)),
            name,
            component: config.component.clone().map(ComponentId::new),
        })
    }

    async fn tables(&self) -> anyhow::Result<TablesCache<HttpDeploymentRpc>> {
        let tables = TablesCache::new(self.rpc.clone(), self.component.clone());
        tables.refresh().await?;
        Ok(tables)
    }
}

/// Cancels `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    })
}

fn document_line(document: &TableDocument, visible_fields: Option<&[String]>) -> JsonValue {
    match (visible_fields, document.to_json()) {
        (Some(fields), JsonValue::Object(object)) => JsonValue::Object(
            object
                .into_iter()
                .filter(|(k, _)| k == "_id" || fields.contains(k))
                .collect(),
        ),
        (_, json) => json,
    }
}

async fn list_tables(deployment: &Deployment) -> anyhow::Result<()> {
    for table in deployment.tables().await?.tables() {
        let shape = table
            .shape
            .as_ref()
            .map(|s| s.describe())
            .unwrap_or_else(|| "(shape not computed)".to_string());
        println!("{}\t{shape}", table.name);
    }
    Ok(())
}

async fn browse(
    deployment: &Deployment,
    store: &LocalStore,
    table: Option<String>,
    filters: Vec<FilterClause>,
    desc: bool,
    sort: Option<SortConfig>,
    limit: usize,
    save: bool,
) -> anyhow::Result<()> {
    let tables = deployment.tables().await?;
    let table = match table {
        Some(name) => {
            let name: TableName = name.parse()?;
            tables.select(name.clone())?;
            name
        },
        None => tables.auto_select(None).ok_or_else(|| {
            ErrorMetadata::not_found("NoTables", "This deployment has no tables yet")
        })?,
    };

    let saved = TableViewSettings::load(store, &deployment.name, &table)?;
    let mut expression = if filters.is_empty() {
        saved.filters.clone()
    } else {
        FilterExpression::new(filters)
    };
    let sort = sort.or_else(|| saved.sort.clone());
    if let Some(order) = sort.as_ref().and_then(|s| s.server_order()) {
        expression = expression.with_order(order);
    }
    if desc {
        expression = expression.with_order(Order::Desc);
    }
    expression.validate()?;
    if save {
        TableViewSettings {
            filters: expression.clone(),
            sort: sort.clone(),
            visible_fields: saved.visible_fields.clone(),
        }
        .save(store, &deployment.name, &table)?;
        tracing::info!("Saved view for {table}");
    }

    let fetcher = DocumentFetcher::new(deployment.rpc.clone(), ErrorBanner::new());
    fetcher.select(table, deployment.component.clone(), &expression);
    let mut documents = fetcher.load_all(limit).await?;
    if let Some(sort) = sort.as_ref().filter(|s| s.server_order().is_none()) {
        sort_documents(&mut documents, sort);
    }
    for document in &documents {
        println!(
            "{}",
            document_line(document, saved.visible_fields.as_deref())
        );
    }
    if !fetcher.is_done() {
        eprintln!("(showing the first {} documents)", documents.len());
    }
    Ok(())
}

async fn list_indexes(deployment: &Deployment, table: &str) -> anyhow::Result<()> {
    let table: TableName = table.parse()?;
    let tables = deployment.tables().await?;
    for index in tables.indexes(&table).await? {
        let definition = match &index.kind {
            IndexKind::Database { fields } => format!("db({})", fields.join(", ")),
            IndexKind::Search {
                search_field,
                filter_fields,
            } => format!("search({search_field}; {})", filter_fields.join(", ")),
            IndexKind::Vector {
                vector_field,
                dimensions,
                filter_fields,
            } => format!(
                "vector({vector_field}[{dimensions}]; {})",
                filter_fields.join(", ")
            ),
        };
        let state = index.backfill_state.as_deref().unwrap_or("ready");
        println!("{}\t{definition}\t{state}", index.name);
    }
    Ok(())
}

async fn patch(
    deployment: &Deployment,
    table: &str,
    ids: &[String],
    fields: Vec<(String, String)>,
) -> anyhow::Result<()> {
    let table: TableName = table.parse()?;
    let fetcher = DocumentFetcher::new(deployment.rpc.clone(), ErrorBanner::new());
    let mutator = DocumentMutator::for_fetcher(&fetcher);
    let fields: BTreeMap<_, _> = fields
        .into_iter()
        .map(|(field, value)| (field, parse_free_text(&value)))
        .collect();
    let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
    mutator
        .patch(&table, deployment.component.as_ref(), &ids, fields)
        .await?;
    println!("Patched {} document(s)", ids.len());
    Ok(())
}

async fn delete(deployment: &Deployment, table: &str, ids: &[String]) -> anyhow::Result<()> {
    let table: TableName = table.parse()?;
    let fetcher = DocumentFetcher::new(deployment.rpc.clone(), ErrorBanner::new());
    let mutator = DocumentMutator::for_fetcher(&fetcher);
    let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
    mutator
        .delete(&table, deployment.component.as_ref(), &ids)
        .await?;
    println!("Deleted {} document(s)", ids.len());
    Ok(())
}

async fn github_login(
    config: &PanelConfig,
    fetch_client: Arc<dyn FetchClient>,
    store: LocalStore,
) -> anyhow::Result<()> {
    let flow = DeviceFlow::new(config.auth_api_url.clone(), fetch_client, store);
    let code = flow.request_code().await?;
    println!(
        "Open {} and enter the code {}",
        code.verification_uri, code.user_code
    );
    let cancel = CancellationToken::new();
    let ctrl_c = cancel_on_ctrl_c(cancel.clone());
    let result = flow.poll_for_token(&code, &cancel).await;
    ctrl_c.abort();
    result?;
    println!("GitHub connected");
    Ok(())
}

async fn github_repos(github: GithubClient, search: Option<String>) -> anyhow::Result<()> {
    let repos = match search {
        Some(query) => RepoSearch::new(Arc::new(github)).search(&query).await?,
        None => github.list_repos().await?,
    };
    for repo in repos {
        let visibility = if repo.private { "private" } else { "public" };
        println!("{}\t{visibility}", repo.full_name);
    }
    Ok(())
}

async fn github_link(
    github: &GithubClient,
    store: LocalStore,
    team: &str,
    project: &str,
    repo: &str,
    branch: String,
    schema_path: Option<String>,
) -> anyhow::Result<()> {
    let (owner, name) = parse_repo(repo)?;
    let branches = github.list_branches(&owner, &name).await?;
    if !branches.iter().any(|b| b.name == branch) {
        anyhow::bail!(ErrorMetadata::not_found(
            "BranchNotFound",
            format!("{repo} has no branch named {branch}")
        ));
    }
    let selection = RepoSelection {
        owner,
        repo: name,
        branch,
        schema_path,
    };
    RepoSelectionStore::new(store).save(team, project, &selection)?;
    println!(
        "Linked {team}/{project} to {}@{}",
        selection.full_name(),
        selection.branch
    );
    Ok(())
}

async fn watch_schema(
    config: &PanelConfig,
    fetch_client: Arc<dyn FetchClient>,
    store: LocalStore,
    repos: Vec<String>,
    team: Option<String>,
    project: Option<String>,
) -> anyhow::Result<()> {
    let repos = match (repos.is_empty(), team, project) {
        (false, ..) => repos,
        (true, Some(team), Some(project)) => {
            let selection = RepoSelectionStore::new(store.clone())
                .load(&team, &project)?
                .ok_or_else(|| {
                    ErrorMetadata::not_found(
                        "NoLinkedRepo",
                        format!("{team}/{project} is not linked to a repository"),
                    )
                })?;
            vec![selection.full_name()]
        },
        (true, ..) => anyhow::bail!(ErrorMetadata::bad_request(
            "NoReposToWatch",
            "Name repositories to watch or pass --team and --project"
        )),
    };
    for repo in &repos {
        parse_repo(repo)?;
    }

    let github = GithubClient::new(fetch_client.clone(), store.clone())?;
    let subscriber = SchemaSyncSubscriber::new(
        config.auth_api_url.clone(),
        fetch_client,
        store,
        repos.clone(),
    );
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let ctrl_c = cancel_on_ctrl_c(cancel.clone());
    let print_events = async {
        while let Some(event) = rx.recv().await {
            match event {
                SchemaSyncEvent::Connected { .. } => {
                    println!("Watching {}", repos.join(", "));
                },
                SchemaSyncEvent::Heartbeat => tracing::debug!("Schema stream heartbeat"),
                SchemaSyncEvent::SchemaUpdate(update) => {
                    println!(
                        "{}@{} changed at {}: {}",
                        update.repo,
                        update.branch,
                        update.commit,
                        update.files.join(", ")
                    );
                    if !github.is_connected()? {
                        continue;
                    }
                    let (owner, name) = parse_repo(&update.repo)?;
                    for file in &update.files {
                        match github
                            .get_file_content(&owner, &name, file, &update.commit)
                            .await
                        {
                            Ok(content) => println!("--- {file}\n{content}"),
                            Err(e) => tracing::warn!("Could not fetch {file}: {e:#}"),
                        }
                    }
                },
            }
        }
        anyhow::Ok(())
    };
    let (watched, printed) = tokio::join!(subscriber.run(&cancel, tx), print_events);
    ctrl_c.abort();
    printed?;
    match watched {
        Err(e) if e.is_canceled() => Ok(()),
        other => other,
    }
}

async fn run(config: PanelConfig) -> anyhow::Result<()> {
    let store = LocalStore::open_file(&config.state_file)?;
    if let Some(token) = &config.github_token {
        store.set_string(&StoreKey::GithubToken, token.clone())?;
    }
    let fetch_client: Arc<dyn FetchClient> = Arc::new(ReqwestFetchClient::new()?);
    match &config.command {
        Command::Tables => list_tables(&Deployment::connect(&config, fetch_client)?).await,
        Command::Browse {
            table,
            filters,
            desc,
            sort,
            limit,
            save,
        } => {
            browse(
                &Deployment::connect(&config, fetch_client)?,
                &store,
                table.clone(),
                filters.clone(),
                *desc,
                sort.clone(),
                *limit,
                *save,
            )
            .await
        },
        Command::Indexes { table } => {
            list_indexes(&Deployment::connect(&config, fetch_client)?, table).await
        },
        Command::Patch { table, ids, fields } => {
            patch(
                &Deployment::connect(&config, fetch_client)?,
                table,
                ids,
                fields.clone(),
            )
            .await
        },
        Command::Delete { table, ids } => {
            delete(&Deployment::connect(&config, fetch_client)?, table, ids).await
        },
        Command::GithubLogin => github_login(&config, fetch_client, store).await,
        Command::GithubLogout => {
            DeviceFlow::new(config.auth_api_url.clone(), fetch_client, store).disconnect()?;
            println!("GitHub disconnected");
            Ok(())
        },
        Command::GithubRepos { search } => {
            github_repos(GithubClient::new(fetch_client, store)?, search.clone()).await
        },
        Command::GithubLink {
            team,
            project,
            repo,
            branch,
            schema_path,
        } => {
            let github = GithubClient::new(fetch_client, store.clone())?;
            github_link(
                &github,
                store,
                team,
                project,
                repo,
                branch.clone(),
                schema_path.clone(),
            )
            .await
        },
        Command::WatchSchema {
            repos,
            team,
            project,
        } => {
            watch_schema(
                &config,
                fetch_client,
                store,
                repos.clone(),
                team.clone(),
                project.clone(),
            )
            .await
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::from_filename(".env.local").ok();
    dotenvy::dotenv().ok();
    let _guard = config_tool();
    let config = PanelConfig::parse();
    tracing::debug!("Starting with {config:?}");
    match run(config).await {
        Err(e) if e.is_canceled() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use value::TableDocument;

    use super::document_line;

    #[test]
    fn test_document_line_keeps_visible_fields() -> anyhow::Result<()> {
        let document = TableDocument::from_json(
            &"users".parse()?,
            json!({"_id": "u1", "_creationTime": 1.0, "name": "Ada", "age": 36.0}),
        )?;
        assert_eq!(
            document_line(&document, Some(&["name".to_string()])),
            json!({"_id": "u1", "name": "Ada"})
        );
        assert_eq!(
            document_line(&document, None),
            json!({"_id": "u1", "_creationTime": 1.0, "name": "Ada", "age": 36.0})
        );
        Ok(())
    }
}
