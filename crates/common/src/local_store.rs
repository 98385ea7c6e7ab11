//! Persistent key-value store for panel state that survives restarts: auth
//! tokens, GitHub repo selections, saved table views and layout.
//!
//! Every feature owns a distinct [`StoreKey`] variant so keys from different
//! features can never collide.
use std::{
    collections::BTreeMap,
    fmt,
    fs,
    io::Write,
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};

use anyhow::Context;
use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
    de::DeserializeOwned,
};

use crate::knobs::{
    SIDEBAR_MAX_WIDTH,
    SIDEBAR_MIN_WIDTH,
};

const KEY_PREFIX: &str = "convex-panel";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreKey {
    /// Deployment admin key, one per deployment.
    AuthToken { deployment: String },
    GithubToken,
    GithubSelection { team: String, project: String },
    TableView { deployment: String, table: String },
    Sidebar,
    /// Stable identifier for this install, sent to the schema-update stream.
    DeviceId,
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKey::AuthToken { deployment } => write!(f, "{KEY_PREFIX}:auth-token:{deployment}"),
            StoreKey::GithubToken => write!(f, "{KEY_PREFIX}:github:token"),
            StoreKey::GithubSelection { team, project } => {
                write!(f, "{KEY_PREFIX}:github:selection:{team}:{project}")
            },
            StoreKey::TableView { deployment, table } => {
                write!(f, "{KEY_PREFIX}:table-view:{deployment}:{table}")
            },
            StoreKey::Sidebar => write!(f, "{KEY_PREFIX}:sidebar"),
            StoreKey::DeviceId => write!(f, "{KEY_PREFIX}:device-id"),
        }
    }
}

pub trait KeyValueBackend: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set(&self, key: &str, value: String) -> anyhow::Result<()>;
    fn remove(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, String>>,
}

impl KeyValueBackend for MemoryBackend {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> anyhow::Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// A single JSON object on disk. The whole map is rewritten on every change
/// through a temporary file and a rename, so a crash never leaves a torn file.
pub struct FileBackend {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileBackend {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read(&path) {
            Ok(contents) => match serde_json::from_slice(&contents) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(
                        "Ignoring corrupt local store at {}: {e}",
                        path.display()
                    );
                    BTreeMap::new()
                },
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            },
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> anyhow::Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(dir)?;
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(&serde_json::to_vec_pretty(entries)?)?;
        file.persist(&self.path)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }
}

impl KeyValueBackend for FileBackend {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> anyhow::Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value);
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct LocalStore {
    backend: Arc<dyn KeyValueBackend>,
}

impl LocalStore {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::default()))
    }

    pub fn open_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self::new(Arc::new(FileBackend::open(path)?)))
    }

    pub fn get_string(&self, key: &StoreKey) -> anyhow::Result<Option<String>> {
        self.backend.get(&key.to_string())
    }

    pub fn set_string(&self, key: &StoreKey, value: impl Into<String>) -> anyhow::Result<()> {
        self.backend.set(&key.to_string(), value.into())
    }

    /// Values that no longer deserialize (e.g. written by an older build) are
    /// treated as absent rather than failing the caller.
    pub fn get_json<T: DeserializeOwned>(&self, key: &StoreKey) -> anyhow::Result<Option<T>> {
        let Some(raw) = self.get_string(key)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!("Discarding unreadable value for {key}: {e}");
                Ok(None)
            },
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &StoreKey, value: &T) -> anyhow::Result<()> {
        self.set_string(key, serde_json::to_string(value)?)
    }

    pub fn remove(&self, key: &StoreKey) -> anyhow::Result<()> {
        self.backend.remove(&key.to_string())
    }

    /// Returns the install's device id, minting one on first use.
    pub fn device_id(&self) -> anyhow::Result<String> {
        if let Some(id) = self.get_string(&StoreKey::DeviceId)? {
            return Ok(id);
        }
        let id = format!("{:032x}", rand::random::<u128>());
        self.set_string(&StoreKey::DeviceId, id.clone())?;
        Ok(id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidebarState {
    pub width: u32,
    pub collapsed: bool,
}

impl Default for SidebarState {
    fn default() -> Self {
        Self {
            width: 240,
            collapsed: false,
        }
    }
}

impl SidebarState {
    pub fn load(store: &LocalStore) -> anyhow::Result<Self> {
        Ok(store
            .get_json::<Self>(&StoreKey::Sidebar)?
            .map(|s| s.with_width(s.width))
            .unwrap_or_default())
    }

    pub fn save(&self, store: &LocalStore) -> anyhow::Result<()> {
        store.set_json(&StoreKey::Sidebar, self)
    }

    pub fn with_width(self, width: u32) -> Self {
        Self {
            width: width.clamp(*SIDEBAR_MIN_WIDTH, *SIDEBAR_MAX_WIDTH),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde::{
        Deserialize,
        Serialize,
    };

    use super::{
        LocalStore,
        SidebarState,
        StoreKey,
    };

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Saved {
        columns: Vec<String>,
    }

    #[test]
    fn test_keys_are_namespaced() {
        let keys = [
            StoreKey::AuthToken {
                deployment: "happy-otter-123".into(),
            },
            StoreKey::GithubToken,
            StoreKey::GithubSelection {
                team: "t".into(),
                project: "p".into(),
            },
            StoreKey::TableView {
                deployment: "happy-otter-123".into(),
                table: "users".into(),
            },
            StoreKey::Sidebar,
            StoreKey::DeviceId,
        ];
        let rendered: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        for (i, a) in rendered.iter().enumerate() {
            assert!(a.starts_with("convex-panel:"));
            for b in &rendered[i + 1..] {
                assert!(!b.starts_with(a.as_str()) && !a.starts_with(b.as_str()));
            }
        }
    }

    #[test]
    fn test_file_backend_persists() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state.json");
        let key = StoreKey::TableView {
            deployment: "d".into(),
            table: "users".into(),
        };
        {
            let store = LocalStore::open_file(&path)?;
            store.set_json(
                &key,
                &Saved {
                    columns: vec!["name".into()],
                },
            )?;
        }
        let store = LocalStore::open_file(&path)?;
        assert_eq!(
            store.get_json::<Saved>(&key)?,
            Some(Saved {
                columns: vec!["name".into()]
            })
        );
        store.remove(&key)?;
        assert_eq!(LocalStore::open_file(&path)?.get_json::<Saved>(&key)?, None);
        Ok(())
    }

    #[test]
    fn test_corrupt_values_read_as_absent() -> anyhow::Result<()> {
        let store = LocalStore::in_memory();
        store.set_string(&StoreKey::Sidebar, "{not json")?;
        assert_eq!(SidebarState::load(&store)?, SidebarState::default());

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state.json");
        std::fs::write(&path, "garbage")?;
        assert_eq!(LocalStore::open_file(&path)?.get_string(&StoreKey::Sidebar)?, None);
        Ok(())
    }

    #[test]
    fn test_sidebar_width_is_clamped() -> anyhow::Result<()> {
        let store = LocalStore::in_memory();
        SidebarState::default().with_width(5).save(&store)?;
        assert_eq!(SidebarState::load(&store)?.width, 180);
        store.set_json(
            &StoreKey::Sidebar,
            &SidebarState {
                width: 10_000,
                collapsed: true,
            },
        )?;
        let loaded = SidebarState::load(&store)?;
        assert_eq!((loaded.width, loaded.collapsed), (480, true));
        Ok(())
    }

    #[test]
    fn test_device_id_is_stable() -> anyhow::Result<()> {
        let store = LocalStore::in_memory();
        let id = store.device_id()?;
        assert_eq!(id.len(), 32);
        assert_eq!(store.device_id()?, id);
        Ok(())
    }
}
