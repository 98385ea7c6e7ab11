use std::{
    fmt,
    path::PathBuf,
};

use clap::{
    Parser,
    Subcommand,
};
use cmd_util::keyvalue::parse_key_value;
use data_browser::{
    FilterClause,
    FilterOp,
    Order,
    SortConfig,
    filters::parse_free_text,
};
use errors::ErrorMetadata;
use url::Url;

#[derive(Parser)]
#[clap(version, about = "Browse and edit a deployment's data from the terminal")]
pub struct PanelConfig {
    /// Deployment to talk to, e.g. https://happy-otter-123.convex.cloud
    #[clap(long, env = "CONVEX_DEPLOYMENT_URL", global = true)]
    pub deployment_url: Option<Url>,

    #[clap(long, env = "CONVEX_ADMIN_KEY", hide_env_values = true, global = true)]
    pub admin_key: Option<String>,

    /// Component to browse instead of the root app.
    #[clap(long, global = true)]
    pub component: Option<String>,

    /// Service proxying GitHub's device flow and the schema-update stream.
    #[clap(
        long,
        env = "PANEL_AUTH_API_URL",
        default_value = "https://api.convexpanel.dev/",
        global = true
    )]
    pub auth_api_url: Url,

    /// Use this GitHub token instead of the one saved by `github-login`.
    #[clap(long, env = "GITHUB_TOKEN", hide_env_values = true, global = true)]
    pub github_token: Option<String>,

    /// Where panel state (tokens, saved views, repo links) is kept.
    #[clap(
        long,
        env = "PANEL_STATE_FILE",
        default_value = ".convex-panel.json",
        global = true
    )]
    pub state_file: PathBuf,

    #[clap(subcommand)]
    pub command: Command,
}

impl fmt::Debug for PanelConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PanelConfig")
            .field("deployment_url", &self.deployment_url)
            .field("component", &self.component)
            .field("auth_api_url", &self.auth_api_url)
            .field("state_file", &self.state_file)
            .finish()
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List tables with their inferred shapes.
    Tables,
    /// Print documents of a table as JSON lines.
    Browse {
        /// Defaults to the last browsed table, then the first user table.
        table: Option<String>,
        /// Filter clause `field:op:value`, op one of eq, neq, gt, gte, lt,
        /// lte, type, notype. Repeatable; clauses are ANDed.
        #[clap(long = "where", value_parser = parse_filter_clause)]
        filters: Vec<FilterClause>,
        /// Newest documents first.
        #[clap(long)]
        desc: bool,
        /// Client-side sort `field` or `field:desc`.
        #[clap(long, value_parser = parse_sort)]
        sort: Option<SortConfig>,
        #[clap(long, default_value_t = 50)]
        limit: usize,
        /// Remember these filters and sort for the table.
        #[clap(long)]
        save: bool,
    },
    /// List a table's indexes.
    Indexes { table: String },
    /// Set fields on documents, e.g. `--set age=21 --set name='"Ada"'`.
    Patch {
        table: String,
        #[clap(required = true)]
        ids: Vec<String>,
        #[clap(long = "set", required = true, value_parser = parse_key_value::<String, String>)]
        fields: Vec<(String, String)>,
    },
    Delete {
        table: String,
        #[clap(required = true)]
        ids: Vec<String>,
    },
    /// Connect a GitHub account with the device flow.
    GithubLogin,
    GithubLogout,
    /// List (or search) repositories the GitHub account can see.
    GithubRepos {
        #[clap(long)]
        search: Option<String>,
    },
    /// Link a repository and branch to a team's project.
    GithubLink {
        team: String,
        project: String,
        /// `owner/name`
        repo: String,
        #[clap(long, default_value = "main")]
        branch: String,
        #[clap(long)]
        schema_path: Option<String>,
    },
    /// Stream schema updates for the given `owner/name` repositories, or for
    /// the repository linked to `--team`/`--project`.
    WatchSchema {
        repos: Vec<String>,
        #[clap(long, requires = "project")]
        team: Option<String>,
        #[clap(long, requires = "team")]
        project: Option<String>,
    },
}

pub fn parse_filter_clause(s: &str) -> anyhow::Result<FilterClause> {
    let mut parts = s.splitn(3, ':');
    let (Some(field), Some(op), Some(value)) = (parts.next(), parts.next(), parts.next()) else {
        anyhow::bail!(ErrorMetadata::bad_request(
            "InvalidFilterClause",
            format!("Expected field:op:value, got {s:?}")
        ));
    };
    let op: FilterOp = op.parse().map_err(|_| {
        ErrorMetadata::bad_request("InvalidFilterOp", format!("Unknown filter operator {op:?}"))
    })?;
    Ok(FilterClause::new(field, op, parse_free_text(value)))
}

pub fn parse_sort(s: &str) -> anyhow::Result<SortConfig> {
    let (field, direction) = match s.rsplit_once(':') {
        Some((field, "asc")) => (field, Order::Asc),
        Some((field, "desc")) => (field, Order::Desc),
        _ => (s, Order::Asc),
    };
    anyhow::ensure!(!field.is_empty(), "Sort field cannot be empty");
    Ok(SortConfig::new(field, direction))
}

/// `owner/name` → (`owner`, `name`).
pub fn parse_repo(s: &str) -> anyhow::Result<(String, String)> {
    match s.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() => {
            Ok((owner.to_string(), name.to_string()))
        },
        _ => anyhow::bail!(ErrorMetadata::bad_request(
            "InvalidRepoName",
            format!("Expected owner/name, got {s:?}")
        )),
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use data_browser::{
        FilterOp,
        Order,
        SortConfig,
    };
    use pretty_assertions::assert_eq;
    use value::DynamicValue;

    use super::{
        Command,
        PanelConfig,
        parse_filter_clause,
        parse_repo,
        parse_sort,
    };

    #[test]
    fn test_parse_filter_clause() -> anyhow::Result<()> {
        let clause = parse_filter_clause("age:gte:18")?;
        assert_eq!(clause.field, "age");
        assert_eq!(clause.op, FilterOp::Gte);
        assert_eq!(clause.value, DynamicValue::Float64(18.0));

        let clause = parse_filter_clause("url:eq:https://a.b/c")?;
        assert_eq!(clause.value, DynamicValue::from("https://a.b/c"));
        assert_eq!(parse_filter_clause("tags:notype:array")?.op, FilterOp::IsNotType);

        assert!(parse_filter_clause("age:gte").is_err());
        assert!(parse_filter_clause("age:around:18").is_err());
        Ok(())
    }

    #[test]
    fn test_parse_sort_and_repo() -> anyhow::Result<()> {
        assert_eq!(parse_sort("name")?, SortConfig::new("name", Order::Asc));
        assert_eq!(
            parse_sort("profile.age:desc")?,
            SortConfig::new("profile.age", Order::Desc)
        );
        assert!(parse_sort(":desc").is_err());
        assert_eq!(parse_repo("octo/app")?, ("octo".into(), "app".into()));
        assert!(parse_repo("octo/").is_err());
        Ok(())
    }

    #[test]
    fn test_browse_arguments() -> anyhow::Result<()> {
        let config = PanelConfig::try_parse_from([
            "convex-panel",
            "browse",
            "users",
            "--where",
            "age:gte:18",
            "--desc",
            "--limit",
            "10",
            "--deployment-url",
            "https://happy-otter-123.convex.cloud",
        ])?;
        let Command::Browse {
            table,
            filters,
            desc,
            limit,
            ..
        } = config.command
        else {
            anyhow::bail!("expected browse");
        };
        assert_eq!(table.as_deref(), Some("users"));
        assert_eq!(filters.len(), 1);
        assert!(desc);
        assert_eq!(limit, 10);
        assert_eq!(
            config.deployment_url.map(|u| u.to_string()).as_deref(),
            Some("https://happy-otter-123.convex.cloud/")
        );
        Ok(())
    }
}
