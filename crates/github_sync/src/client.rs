//! Typed GitHub REST client used to pick a repository and branch and to read
//! schema files from them.
use std::sync::Arc;

use anyhow::Context;
use common::{
    http::{
        HttpRequest,
        HttpResponse,
        fetch::FetchClient,
    },
    is_canceled::cancelable,
    knobs::GITHUB_PAGE_SIZE,
    local_store::{
        LocalStore,
        StoreKey,
    },
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use http::header::HeaderValue;
use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
    de::DeserializeOwned,
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::retry::{
    RetryPolicy,
    with_retry,
};

pub const GITHUB_API_URL: &str = "https://api.github.com/";
const GITHUB_API_VERSION: &str = "2022-11-28";
#[allow(clippy::declare_interior_mutable_const)]
const GITHUB_JSON: HeaderValue = HeaderValue::from_static("application/vnd.github+json");

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoOwner {
    pub login: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    pub id: u64,
    pub name: String,
    pub full_name: String,
    pub owner: RepoOwner,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default_branch: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct CommitRef {
    pub sha: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Branch {
    pub name: String,
    pub commit: CommitRef,
    #[serde(default)]
    pub protected: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct GitAuthor {
    pub name: String,
    pub date: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct CommitDetails {
    pub message: String,
    #[serde(default)]
    pub author: Option<GitAuthor>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Commit {
    pub sha: String,
    pub commit: CommitDetails,
    #[serde(default)]
    pub html_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ChangedFile {
    pub filename: String,
    pub status: String,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Comparison {
    /// `ahead`, `behind`, `diverged` or `identical`.
    pub status: String,
    pub ahead_by: u64,
    pub behind_by: u64,
    pub total_commits: u64,
    #[serde(default)]
    pub commits: Vec<Commit>,
    #[serde(default)]
    pub files: Vec<ChangedFile>,
}

#[derive(Deserialize)]
struct SearchResults {
    items: Vec<Repo>,
}

#[derive(Deserialize)]
struct FileContent {
    content: String,
    encoding: String,
}

pub struct GithubClient {
    api_url: Url,
    fetch_client: Arc<dyn FetchClient>,
    store: LocalStore,
    retry: RetryPolicy,
}

impl GithubClient {
    pub fn new(fetch_client: Arc<dyn FetchClient>, store: LocalStore) -> anyhow::Result<Self> {
        Ok(Self::with_api_url(
            GITHUB_API_URL.parse()?,
            fetch_client,
            store,
            RetryPolicy::default(),
        ))
    }

    pub fn with_api_url(
        api_url: Url,
        fetch_client: Arc<dyn FetchClient>,
        store: LocalStore,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            api_url,
            fetch_client,
            store,
            retry,
        }
    }

    pub fn is_connected(&self) -> anyhow::Result<bool> {
        Ok(self.store.get_string(&StoreKey::GithubToken)?.is_some())
    }

    fn token(&self) -> anyhow::Result<String> {
        self.store.get_string(&StoreKey::GithubToken)?.ok_or_else(|| {
            ErrorMetadata::unauthenticated("GithubNotConnected", "Connect a GitHub account first")
                .into()
        })
    }

    fn url(&self, segments: &[&str], query: &[(&str, &str)]) -> anyhow::Result<Url> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow::anyhow!("GitHub API URL {} cannot be a base", self.api_url))?
            .pop_if_empty()
            .extend(segments);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn get(&self, url: Url) -> anyhow::Result<HttpResponse> {
        let request = HttpRequest::get(url)
            .accept(GITHUB_JSON)
            .header(
                http::header::HeaderName::from_static("x-github-api-version"),
                GITHUB_API_VERSION,
            )?
            .authorization("Bearer", &self.token()?)?;
        match with_retry(&*self.fetch_client, request, &self.retry).await {
            Err(e) if e.is_unauthenticated() => {
                tracing::warn!("GitHub rejected the stored token, disconnecting: {e:#}");
                self.store.remove(&StoreKey::GithubToken)?;
                Err(e.context(ErrorMetadata::unauthenticated(
                    "GithubTokenExpired",
                    "Your GitHub session expired. Connect GitHub again.",
                )))
            },
            other => other,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> anyhow::Result<T> {
        self.get(url).await?.json()
    }

    /// Follows `page=` until a page comes back short.
    async fn get_all_pages<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> anyhow::Result<Vec<T>> {
        let per_page = *GITHUB_PAGE_SIZE;
        let per_page_str = per_page.to_string();
        let mut out = vec![];
        for page in 1.. {
            let page_str = page.to_string();
            let mut pairs = query.to_vec();
            pairs.push(("per_page", &per_page_str));
            pairs.push(("page", &page_str));
            let items: Vec<T> = self.get_json(self.url(segments, &pairs)?).await?;
            let done = items.len() < per_page;
            out.extend(items);
            if done {
                break;
            }
        }
        Ok(out)
    }

    /// Every repository the user can access, most recently updated first.
    pub async fn list_repos(&self) -> anyhow::Result<Vec<Repo>> {
        self.get_all_pages(&["user", "repos"], &[("sort", "updated")])
            .await
    }

    /// First page of repository search results for `query`, restricted to
    /// repositories the user can see.
    pub async fn search_repos(&self, query: &str) -> anyhow::Result<Vec<Repo>> {
        let per_page = GITHUB_PAGE_SIZE.to_string();
        let url = self.url(
            &["search", "repositories"],
            &[("q", query), ("per_page", &per_page)],
        )?;
        let results: SearchResults = self.get_json(url).await?;
        Ok(results.items)
    }

    pub async fn list_branches(&self, owner: &str, repo: &str) -> anyhow::Result<Vec<Branch>> {
        self.get_all_pages(&["repos", owner, repo, "branches"], &[])
            .await
    }

    /// Contents of the file at `path` on `git_ref`, decoded.
    pub async fn get_file_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> anyhow::Result<String> {
        let mut segments = vec!["repos", owner, repo, "contents"];
        segments.extend(path.split('/').filter(|s| !s.is_empty()));
        let file: FileContent = self
            .get_json(self.url(&segments, &[("ref", git_ref)])?)
            .await?;
        if file.encoding != "base64" {
            anyhow::bail!(ErrorMetadata::bad_request(
                "UnsupportedEncoding",
                format!("{path} is served as {}, not base64", file.encoding)
            ));
        }
        // GitHub wraps the base64 payload at 60 columns.
        let compact: String = file
            .content
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        let bytes = base64::decode(compact).with_context(|| {
            ErrorMetadata::bad_request("InvalidFileContent", format!("{path} is not valid base64"))
        })?;
        String::from_utf8(bytes).with_context(|| {
            ErrorMetadata::bad_request("BinaryFile", format!("{path} is not a text file"))
        })
    }

    /// Latest commits on `branch`, optionally only those touching `path`.
    pub async fn list_commits(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        path: Option<&str>,
    ) -> anyhow::Result<Vec<Commit>> {
        let per_page = GITHUB_PAGE_SIZE.to_string();
        let mut query = vec![("sha", branch), ("per_page", per_page.as_str())];
        if let Some(path) = path {
            query.push(("path", path));
        }
        self.get_json(self.url(&["repos", owner, repo, "commits"], &query)?)
            .await
    }

    pub async fn compare_commits(
        &self,
        owner: &str,
        repo: &str,
        base: &str,
        head: &str,
    ) -> anyhow::Result<Comparison> {
        let range = format!("{base}...{head}");
        self.get_json(self.url(&["repos", owner, repo, "compare", &range], &[])?)
            .await
    }
}

/// Search-as-you-type: starting a search cancels the one still running.
pub struct RepoSearch {
    client: Arc<GithubClient>,
    current: Mutex<Option<CancellationToken>>,
}

impl RepoSearch {
    pub fn new(client: Arc<GithubClient>) -> Self {
        Self {
            client,
            current: Mutex::new(None),
        }
    }

    /// Returns a `Canceled` error if a newer search started first.
    pub async fn search(&self, query: &str) -> anyhow::Result<Vec<Repo>> {
        let token = CancellationToken::new();
        if let Some(previous) = self.current.lock().replace(token.clone()) {
            previous.cancel();
        }
        cancelable(&token, self.client.search_repos(query)).await
    }

    pub fn cancel(&self) {
        if let Some(token) = self.current.lock().take() {
            token.cancel();
        }
    }
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
            assert_contains,
        },
    };
    use errors::ErrorMetadataAnyhowExt;
    use http::{
        Method,
        StatusCode,
        header::AUTHORIZATION,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::{
        GithubClient,
        RepoSearch,
    };
    use crate::retry::RetryPolicy;

    fn client(fetch: &StaticFetchClient) -> anyhow::Result<(GithubClient, LocalStore)> {
        let store = LocalStore::in_memory();
        store.set_string(&StoreKey::GithubToken, "gho_token")?;
        let client = GithubClient::with_api_url(
            "https://api.github.test/".parse()?,
            Arc::new(fetch.clone()),
            store.clone(),
            RetryPolicy {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(100),
                max_retries: 3,
            },
        );
        Ok((client, store))
    }

    fn repo(id: u64) -> serde_json::Value {
        json!({
            "id": id,
            "name": format!("repo{id}"),
            "full_name": format!("octo/repo{id}"),
            "owner": {"login": "octo"},
            "private": false,
            "default_branch": "main",
        })
    }

    #[tokio::test]
    async fn test_list_repos_follows_pages() -> anyhow::Result<()> {
        let fetch = StaticFetchClient::new();
        let full_page: Vec<_> = (0..100).map(repo).collect();
        fetch
            .route(Method::GET, "/user/repos", StaticResponse::ok_json(&full_page))
            .route(
                Method::GET,
                "/user/repos",
                StaticResponse::ok_json(&vec![repo(100), repo(101)]),
            );
        let (client, _) = client(&fetch)?;
        let repos = client.list_repos().await?;
        assert_eq!(repos.len(), 102);
        assert_eq!(repos[101].full_name, "octo/repo101");

        let requests = fetch.requests_to("/user/repos");
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[1].url.query(),
            Some("sort=updated&per_page=100&page=2")
        );
        assert_eq!(requests[0].headers[AUTHORIZATION], "Bearer gho_token");
        Ok(())
    }

    #[tokio::test]
    async fn test_file_content_is_decoded() -> anyhow::Result<()> {
        let fetch = StaticFetchClient::new();
        fetch.route(
            Method::GET,
            "/repos/octo/app/contents/convex/schema.ts",
            StaticResponse::ok_json(&json!({
                "encoding": "base64",
                "content": "ZXhwb3J0IGRlZmF1bHQg\nZGVmaW5lU2NoZW1hKHt9KQ==\n",
            })),
        );
        fetch.route(
            Method::GET,
            "/repos/octo/app/contents/logo.png",
            StaticResponse::ok_json(&json!({"encoding": "base64", "content": "/w=="})),
        );
        let (client, _) = client(&fetch)?;
        let content = client
            .get_file_content("octo", "app", "convex/schema.ts", "main")
            .await?;
        assert_eq!(content, "export default defineSchema({})");
        let request = &fetch.requests()[0];
        assert_eq!(request.url.query(), Some("ref=main"));

        let err = client
            .get_file_content("octo", "app", "logo.png", "main")
            .await
            .unwrap_err();
        assert_eq!(err.short_msg(), "BinaryFile");
        assert_contains(&err, "logo.png is not a text file");
        Ok(())
    }

    #[tokio::test]
    async fn test_unauthorized_clears_token() -> anyhow::Result<()> {
        let fetch = StaticFetchClient::new();
        fetch.route(
            Method::GET,
            "/repos/octo/app/branches",
            StaticResponse::status(StatusCode::UNAUTHORIZED, "Bad credentials"),
        );
        let (client, store) = client(&fetch)?;
        let err = client.list_branches("octo", "app").await.unwrap_err();
        assert!(err.is_unauthenticated());
        assert_eq!(err.short_msg(), "GithubTokenExpired");
        assert_eq!(store.get_string(&StoreKey::GithubToken)?, None);
        assert!(!client.is_connected()?);

        // No token: fails locally without a request.
        let err = client.list_branches("octo", "app").await.unwrap_err();
        assert_eq!(err.short_msg(), "GithubNotConnected");
        assert_eq!(fetch.requests().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_compare_and_commits() -> anyhow::Result<()> {
        let fetch = StaticFetchClient::new();
        let commit = json!({
            "sha": "abc123",
            "commit": {"message": "Add users table", "author": {"name": "Ada", "date": "2024-01-01T00:00:00Z"}},
        });
        fetch
            .route(
                Method::GET,
                "/repos/octo/app/compare/main...feature",
                StaticResponse::ok_json(&json!({
                    "status": "ahead",
                    "ahead_by": 1,
                    "behind_by": 0,
                    "total_commits": 1,
                    "commits": [commit.clone()],
                    "files": [{"filename": "convex/schema.ts", "status": "modified", "additions": 3, "deletions": 1}],
                })),
            )
            .route(
                Method::GET,
                "/repos/octo/app/commits",
                StaticResponse::ok_json(&json!([commit])),
            );
        let (client, _) = client(&fetch)?;
        let comparison = client
            .compare_commits("octo", "app", "main", "feature")
            .await?;
        assert_eq!(comparison.ahead_by, 1);
        assert_eq!(comparison.files[0].filename, "convex/schema.ts");

        let commits = client
            .list_commits("octo", "app", "main", Some("convex/schema.ts"))
            .await?;
        assert_eq!(commits[0].commit.message, "Add users table");
        let request = &fetch.requests_to("/repos/octo/app/commits")[0];
        assert_eq!(
            request.url.query(),
            Some("sha=main&per_page=100&path=convex%2Fschema.ts")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_new_search_cancels_previous() -> anyhow::Result<()> {
        let fetch = StaticFetchClient::new();
        // The first request never finishes; the second answers immediately.
        fetch
            .route(
                Method::GET,
                "/search/repositories",
                StaticResponse::event_stream(Vec::<String>::new(), true),
            )
            .route(
                Method::GET,
                "/search/repositories",
                StaticResponse::ok_json(&json!({"items": [repo(1)]})),
            );
        let (client, _) = client(&fetch)?;
        let search = RepoSearch::new(Arc::new(client));

        let first = search.search("con");
        let second = search.search("convex");
        let (first, second) = tokio::join!(first, second);
        assert!(first.unwrap_err().is_canceled());
        assert_eq!(second?.len(), 1);
        assert_eq!(
            fetch.requests_to("/search/repositories")[1].url.query(),
            Some("q=convex&per_page=100")
        );
        Ok(())
    }
}
