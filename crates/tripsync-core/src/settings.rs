use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::media::MediaConstraints;

/// Per-user preferences persisted between sessions.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_true")]
    pub mic_enabled_on_join: bool,
    #[serde(default)]
    pub camera_enabled_on_join: bool,
    #[serde(default)]
    pub share_location_on_join: bool,
    #[serde(default)]
    pub location_interval_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            display_name: None,
            mic_enabled_on_join: true,
            camera_enabled_on_join: false,
            share_location_on_join: false,
            location_interval_ms: None,
        }
    }
}

impl Settings {
    /// Media to request when joining a call.
    pub fn call_constraints(&self) -> MediaConstraints {
        MediaConstraints {
            audio: self.mic_enabled_on_join,
            video: self.camera_enabled_on_join,
        }
    }
}

pub struct SettingsStore {
    settings: Mutex<Settings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let file_path = data_dir.as_ref().join("settings.json");
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    pub fn get(&self) -> Settings {
        self.lock().clone()
    }

    pub fn set_display_name(&self, name: Option<String>) {
        self.lock().display_name = name;
        self.save();
    }

    pub fn set_mic_enabled_on_join(&self, enabled: bool) {
        self.lock().mic_enabled_on_join = enabled;
        self.save();
    }

    pub fn set_camera_enabled_on_join(&self, enabled: bool) {
        self.lock().camera_enabled_on_join = enabled;
        self.save();
    }

    pub fn set_share_location_on_join(&self, enabled: bool) {
        self.lock().share_location_on_join = enabled;
        self.save();
    }

    pub fn set_location_interval_ms(&self, interval: Option<u64>) {
        self.lock().location_interval_ms = interval.filter(|ms| *ms > 0);
        self.save();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self) {
        let settings = self.get();
        if let Some(parent) = self.file_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!("cannot create settings dir {}: {e}", parent.display());
                return;
            }
        }
        match serde_json::to_string_pretty(&settings) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("cannot write {}: {e}", self.file_path.display());
                }
            }
            Err(e) => tracing::warn!("cannot serialize settings: {e}"),
        }
    }

    fn load(path: &Path) -> Settings {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("ignoring corrupt settings file {}: {e}", path.display());
                Settings::default()
            }),
            Err(_) => Settings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_new_creates_defaults_when_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());
        assert_eq!(store.get(), Settings::default());
    }

    #[test]
    fn test_display_name_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SettingsStore::new(dir.path());
            store.set_display_name(Some("Alice".to_string()));
        }
        let store = SettingsStore::new(dir.path());
        assert_eq!(store.get().display_name, Some("Alice".to_string()));
    }

    #[test]
    fn test_join_preferences_persist() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SettingsStore::new(dir.path());
            store.set_mic_enabled_on_join(false);
            store.set_camera_enabled_on_join(true);
            store.set_share_location_on_join(true);
            store.set_location_interval_ms(Some(5_000));
        }
        let s = SettingsStore::new(dir.path()).get();
        assert!(!s.mic_enabled_on_join);
        assert!(s.camera_enabled_on_join);
        assert!(s.share_location_on_join);
        assert_eq!(s.location_interval_ms, Some(5_000));
        assert_eq!(s.call_constraints(), MediaConstraints { audio: false, video: true });
    }

    #[test]
    fn test_zero_interval_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());
        store.set_location_interval_ms(Some(0));
        assert_eq!(store.get().location_interval_ms, None);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("settings.json"), "not json!!!").unwrap();
        let store = SettingsStore::new(dir.path());
        assert_eq!(store.get(), Settings::default());
    }

    #[test]
    fn test_partial_json_uses_serde_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("settings.json"), r#"{"display_name":"Eve"}"#).unwrap();
        let s = SettingsStore::new(dir.path()).get();
        assert_eq!(s.display_name, Some("Eve".to_string()));
        assert!(s.mic_enabled_on_join);
        assert!(!s.camera_enabled_on_join);
        assert!(!s.share_location_on_join);
    }
}
