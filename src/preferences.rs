use crate::error::{
    Result,
    SessionError,
};
use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
};
use tracing::{
    debug,
    info,
};

pub const DEFAULT_BATTLEGROUND: &str = "bg-astral";
const PREFERENCES_FILE: &str = "preferences.json";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceRecord {
    #[serde(default = "default_battleground")]
    pub battleground: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_battleground() -> String {
    DEFAULT_BATTLEGROUND.to_owned()
}

impl Default for PreferenceRecord {
    fn default() -> Self {
        Self {
            battleground: default_battleground(),
            updated_at: None,
        }
    }
}

/// The only state kept across sessions: which battleground to draw.
#[derive(Debug)]
pub struct PreferenceStore {
    path: PathBuf,
}

impl PreferenceStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(PREFERENCES_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the stored battleground. A missing file is created holding the
    /// default.
    pub fn load_battleground(&self) -> Result<String> {
        match read_record(&self.path)? {
            Some(record) => Ok(record.battleground),
            None => {
                debug!(path = %self.path.display(), "no preferences yet; writing defaults");
                write_record(&self.path, &PreferenceRecord::default())?;
                Ok(default_battleground())
            }
        }
    }

    pub fn save_battleground(&self, battleground: &str) -> Result<()> {
        let battleground = battleground.trim();
        if battleground.is_empty() {
            return Err(SessionError::InvalidInput(
                "Battleground cannot be empty".to_owned(),
            ));
        }
        let record = PreferenceRecord {
            battleground: battleground.to_owned(),
            updated_at: Some(Utc::now()),
        };
        write_record(&self.path, &record)?;
        info!(battleground, "battleground saved");
        Ok(())
    }
}

fn read_record(path: &Path) -> Result<Option<PreferenceRecord>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(path).map_err(|err| {
        SessionError::Preferences(format!("failed to read {}: {err}", path.display()))
    })?;
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(&data).map(Some).map_err(|err| {
        SessionError::Preferences(format!("failed to parse {}: {err}", path.display()))
    })
}

fn write_record(path: &Path, record: &PreferenceRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            SessionError::Preferences(format!(
                "failed to create {}: {err}",
                parent.display()
            ))
        })?;
    }
    let json = serde_json::to_vec_pretty(record).map_err(|err| {
        SessionError::Preferences(format!("failed to serialize preferences: {err}"))
    })?;
    fs::write(path, json).map_err(|err| {
        SessionError::Preferences(format!("failed to write {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn load_battleground__first_run_writes_default() {
        // given
        let dir = TempDir::new("prefs").unwrap();
        let store = PreferenceStore::new(dir.path());

        // when
        let battleground = store.load_battleground().unwrap();

        // then
        assert_eq!(battleground, DEFAULT_BATTLEGROUND);
        assert!(store.path().exists());
    }

    #[test]
    fn save_battleground__survives_reopen() {
        // given
        let dir = TempDir::new("prefs").unwrap();
        PreferenceStore::new(dir.path())
            .save_battleground("bg-jungle")
            .unwrap();

        // when
        let battleground = PreferenceStore::new(dir.path()).load_battleground().unwrap();

        // then
        assert_eq!(battleground, "bg-jungle");
    }

    #[test]
    fn load_battleground__missing_key_falls_back_to_default() {
        // given
        let dir = TempDir::new("prefs").unwrap();
        let store = PreferenceStore::new(dir.path());
        fs::write(store.path(), br#"{"updated_at": null}"#).unwrap();

        // when
        let battleground = store.load_battleground().unwrap();

        // then
        assert_eq!(battleground, DEFAULT_BATTLEGROUND);
    }

    #[test]
    fn load_battleground__corrupt_file_is_reported() {
        let dir = TempDir::new("prefs").unwrap();
        let store = PreferenceStore::new(dir.path());
        fs::write(store.path(), b"not json").unwrap();

        let result = store.load_battleground();

        assert!(matches!(result, Err(SessionError::Preferences(_))));
    }

    #[test]
    fn save_battleground__rejects_blank_id() {
        let dir = TempDir::new("prefs").unwrap();
        let store = PreferenceStore::new(dir.path());

        let result = store.save_battleground("  ");

        assert!(matches!(result, Err(SessionError::InvalidInput(_))));
        assert!(!store.path().exists());
    }
}
