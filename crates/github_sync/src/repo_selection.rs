//! Which repository and branch a project is linked to, remembered per
//! (team, project) on this machine.
use common::local_store::{
    LocalStore,
    StoreKey,
};
use errors::ErrorMetadata;
use serde::{
    Deserialize,
    Serialize,
};

const CURRENT_VERSION: u64 = 2;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSelection {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    /// Schema file to watch; `None` means the default `convex/schema.ts`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_path: Option<String>,
}

impl RepoSelection {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    pub fn schema_path(&self) -> &str {
        self.schema_path.as_deref().unwrap_or("convex/schema.ts")
    }
}

#[derive(Serialize, Deserialize)]
struct VersionedSelection {
    version: u64,
    #[serde(flatten)]
    selection: RepoSelection,
}

/// Shape written before selections were versioned.
#[derive(Deserialize)]
struct LegacySelection {
    repo: String,
    branch: String,
}

enum Stored {
    Current(RepoSelection),
    Legacy(RepoSelection),
    /// Written by a newer panel; left alone.
    Newer(u64),
}

fn parse_stored(raw: &str) -> anyhow::Result<Stored> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    match value.get("version").and_then(|v| v.as_u64()) {
        Some(CURRENT_VERSION) => {
            let versioned: VersionedSelection = serde_json::from_value(value)?;
            Ok(Stored::Current(versioned.selection))
        },
        Some(version) if version > CURRENT_VERSION => Ok(Stored::Newer(version)),
        Some(version) => anyhow::bail!("Unknown selection version {version}"),
        None => {
            let legacy: LegacySelection = serde_json::from_value(value)?;
            let (owner, repo) = legacy
                .repo
                .split_once('/')
                .filter(|(owner, repo)| !owner.is_empty() && !repo.is_empty())
                .ok_or_else(|| {
                    ErrorMetadata::bad_request(
                        "InvalidRepoName",
                        format!("{:?} is not of the form owner/name", legacy.repo),
                    )
                })?;
            Ok(Stored::Legacy(RepoSelection {
                owner: owner.to_string(),
                repo: repo.to_string(),
                branch: legacy.branch,
                schema_path: None,
            }))
        },
    }
}

#[derive(Clone)]
pub struct RepoSelectionStore {
    store: LocalStore,
}

impl RepoSelectionStore {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    fn key(team: &str, project: &str) -> StoreKey {
        StoreKey::GithubSelection {
            team: team.to_string(),
            project: project.to_string(),
        }
    }

    /// Loads the selection, rewriting a legacy entry in the current format.
    /// An unreadable entry is discarded.
    pub fn load(&self, team: &str, project: &str) -> anyhow::Result<Option<RepoSelection>> {
        let key = Self::key(team, project);
        let Some(raw) = self.store.get_string(&key)? else {
            return Ok(None);
        };
        match parse_stored(&raw) {
            Ok(Stored::Current(selection)) => Ok(Some(selection)),
            Ok(Stored::Legacy(selection)) => {
                tracing::info!("Migrating repo selection for {team}/{project} to v{CURRENT_VERSION}");
                self.save(team, project, &selection)?;
                Ok(Some(selection))
            },
            Ok(Stored::Newer(version)) => {
                tracing::warn!(
                    "Repo selection for {team}/{project} has version {version}, ignoring it"
                );
                Ok(None)
            },
            Err(e) => {
                tracing::warn!("Discarding unreadable repo selection for {team}/{project}: {e:#}");
                self.store.remove(&key)?;
                Ok(None)
            },
        }
    }

    pub fn save(&self, team: &str, project: &str, selection: &RepoSelection) -> anyhow::Result<()> {
        self.store.set_json(
            &Self::key(team, project),
            &VersionedSelection {
                version: CURRENT_VERSION,
                selection: selection.clone(),
            },
        )
    }

    pub fn clear(&self, team: &str, project: &str) -> anyhow::Result<()> {
        self.store.remove(&Self::key(team, project))
    }
}

#[cfg(test)]
mod tests {
    use common::local_store::{
        LocalStore,
        StoreKey,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::{
        RepoSelection,
        RepoSelectionStore,
    };

    fn key() -> StoreKey {
        StoreKey::GithubSelection {
            team: "acme".into(),
            project: "shop".into(),
        }
    }

    fn selection() -> RepoSelection {
        RepoSelection {
            owner: "octo".into(),
            repo: "app".into(),
            branch: "main".into(),
            schema_path: None,
        }
    }

    #[test]
    fn test_save_and_load() -> anyhow::Result<()> {
        let store = LocalStore::in_memory();
        let selections = RepoSelectionStore::new(store.clone());
        assert_eq!(selections.load("acme", "shop")?, None);

        let selection = RepoSelection {
            schema_path: Some("backend/convex/schema.ts".into()),
            ..selection()
        };
        selections.save("acme", "shop", &selection)?;
        assert_eq!(selections.load("acme", "shop")?, Some(selection));
        assert_eq!(selections.load("acme", "other")?, None);
        assert_eq!(
            store.get_json::<serde_json::Value>(&key())?,
            Some(json!({
                "version": 2,
                "owner": "octo",
                "repo": "app",
                "branch": "main",
                "schemaPath": "backend/convex/schema.ts",
            }))
        );

        selections.clear("acme", "shop")?;
        assert_eq!(selections.load("acme", "shop")?, None);
        Ok(())
    }

    #[test]
    fn test_legacy_selection_is_migrated_in_place() -> anyhow::Result<()> {
        let store = LocalStore::in_memory();
        store.set_json(&key(), &json!({"repo": "octo/app", "branch": "main"}))?;
        let selections = RepoSelectionStore::new(store.clone());

        let loaded = selections.load("acme", "shop")?;
        assert_eq!(loaded, Some(selection()));
        assert_eq!(loaded.map(|s| s.full_name()).as_deref(), Some("octo/app"));
        assert_eq!(
            store.get_json::<serde_json::Value>(&key())?,
            Some(json!({"version": 2, "owner": "octo", "repo": "app", "branch": "main"}))
        );
        Ok(())
    }

    #[test]
    fn test_unreadable_selection_is_discarded() -> anyhow::Result<()> {
        let store = LocalStore::in_memory();
        let selections = RepoSelectionStore::new(store.clone());
        for bad in [
            json!({"repo": "no-slash", "branch": "main"}),
            json!({"repo": "octo/app"}),
            json!({"version": 1, "repo": "octo/app", "branch": "main"}),
        ] {
            store.set_json(&key(), &bad)?;
            assert_eq!(selections.load("acme", "shop")?, None);
            assert_eq!(store.get_string(&key())?, None);
        }
        store.set_string(&key(), "{not json")?;
        assert_eq!(selections.load("acme", "shop")?, None);
        assert_eq!(store.get_string(&key())?, None);

        // A newer format is left for the newer panel.
        store.set_json(&key(), &json!({"version": 3, "anything": true}))?;
        assert_eq!(selections.load("acme", "shop")?, None);
        assert!(store.get_string(&key())?.is_some());
        Ok(())
    }
}
