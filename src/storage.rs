use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

const PREFERENCES_FILE: &str = "preferences.json";

pub const ACCESS_TOKEN_KEY: &str = "access-token";
pub const SELECTED_ORG_KEY: &str = "selected-org";
pub const SELECTED_TEAM_KEY: &str = "selected-team";
pub const AVAILABLE_ORGS_KEY: &str = "available-orgs";
pub const SHORT_NAMES_KEY: &str = "use-short-names-for-team-members";

/// JSON key-value preferences that survive restarts.
///
/// Every value is stored as JSON under its key in a single file. Reads never
/// fail: a missing, unreadable or mistyped entry yields the caller's default.
pub struct PreferenceStore {
    path: Option<PathBuf>,
    entries: BTreeMap<String, Value>,
}

impl PreferenceStore {
    /// Opens (creating if needed) the preference file inside `dir`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        let path = dir.join(PREFERENCES_FILE);
        let entries = read_entries(&path);
        Ok(Self {
            path: Some(path),
            entries,
        })
    }

    /// A store that keeps values for the lifetime of the process only.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: BTreeMap::new(),
        }
    }

    /// The stored value for `key`, or `None` when absent or not a `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.entries.get(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                debug!(key, %err, "ignoring unreadable preference");
                None
            }
        }
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value)?;
        self.entries.insert(key.to_owned(), value);
        self.flush()
    }

    pub fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        if self.entries.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = serde_json::to_string_pretty(&self.entries)?;
        fs::write(path, data)?;
        Ok(())
    }
}

fn read_entries(path: &Path) -> BTreeMap<String, Value> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                debug!(path = %path.display(), %err, "preferences unreadable, starting empty");
            }
            return BTreeMap::new();
        }
    };
    serde_json::from_str(&contents).unwrap_or_else(|err| {
        debug!(path = %path.display(), %err, "preferences corrupt, starting empty");
        BTreeMap::new()
    })
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error while handling stored preferences: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to serialize stored preferences: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::domain::{Organisation, Team};

    #[test]
    fn values_survive_reopening() {
        let dir = tempdir().expect("tempdir");
        let orgs = vec![Organisation {
            login: "acme".into(),
            name: "Acme".into(),
            teams: vec![Team {
                slug: "web".into(),
                name: "Web".into(),
            }],
        }];

        {
            let mut store = PreferenceStore::open(dir.path()).expect("open");
            store.set(ACCESS_TOKEN_KEY, "ghp_secret").expect("set");
            store.set(AVAILABLE_ORGS_KEY, &orgs).expect("set");
            store.set(SHORT_NAMES_KEY, &false).expect("set");
        }

        let store = PreferenceStore::open(dir.path()).expect("reopen");
        assert_eq!(store.get::<String>(ACCESS_TOKEN_KEY).as_deref(), Some("ghp_secret"));
        assert_eq!(store.get_or(AVAILABLE_ORGS_KEY, Vec::<Organisation>::new()), orgs);
        assert!(!store.get_or(SHORT_NAMES_KEY, true));
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join(PREFERENCES_FILE), "{ not json").expect("write");

        let store = PreferenceStore::open(dir.path()).expect("open");
        assert_eq!(store.get_or(ACCESS_TOKEN_KEY, String::new()), "");
        assert!(store.get_or(SHORT_NAMES_KEY, true));
    }

    #[test]
    fn mistyped_entry_falls_back_to_default() {
        let mut store = PreferenceStore::in_memory();
        store.set(SHORT_NAMES_KEY, "yes please").expect("set");
        assert!(store.get_or(SHORT_NAMES_KEY, true));
        assert!(store.get::<bool>(SHORT_NAMES_KEY).is_none());
    }

    #[test]
    fn null_and_absent_are_distinct() {
        let mut store = PreferenceStore::in_memory();
        assert_eq!(store.get::<Option<String>>(SELECTED_TEAM_KEY), None);

        store.set(SELECTED_TEAM_KEY, &None::<String>).expect("set");
        assert_eq!(store.get::<Option<String>>(SELECTED_TEAM_KEY), Some(None));

        store.remove(SELECTED_TEAM_KEY).expect("remove");
        assert_eq!(store.get::<Option<String>>(SELECTED_TEAM_KEY), None);
    }

    #[test]
    fn nested_storage_dir_is_created() {
        let dir = tempdir().expect("tempdir");
        let nested = dir.path().join("a").join("b");
        let mut store = PreferenceStore::open(&nested).expect("open");
        store.set(SELECTED_ORG_KEY, "acme").expect("set");
        assert!(nested.join(PREFERENCES_FILE).exists());
    }
}
