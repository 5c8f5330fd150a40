use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::paths;
use crate::error::TernError;
use crate::settings::types::Settings;

/// Loads and saves `settings.json` under the agent base directory.
pub struct SettingsManager {
    base_dir: PathBuf,
    settings: Settings,
}

impl SettingsManager {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            settings: Settings::default(),
        }
    }

    /// Load settings from disk; a missing file yields defaults.
    pub fn load(&mut self) -> Result<&Settings, TernError> {
        let path = paths::settings_file(&self.base_dir);
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            self.settings = serde_json::from_str(&content)?;
        }
        Ok(&self.settings)
    }

    /// Save atomically: unique temp file then rename, 0600 on unix.
    pub fn save(&self) -> Result<(), TernError> {
        let path = paths::settings_file(&self.base_dir);
        paths::ensure_dir(&self.base_dir)?;
        let content = serde_json::to_string_pretty(&self.settings)?;

        let unique = uuid::Uuid::new_v4();
        let tmp_path = path.with_file_name(format!(".settings.{unique}.tmp"));

        {
            let mut opts = std::fs::OpenOptions::new();
            opts.write(true).create_new(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                opts.mode(0o600);
            }
            let mut file = opts.open(&tmp_path)?;
            file.write_all(content.as_bytes()).map_err(|e| {
                let _ = std::fs::remove_file(&tmp_path);
                TernError::Io(e)
            })?;
        }

        std::fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            TernError::Io(e)
        })?;
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manager = SettingsManager::new(tmp.path());
        let settings = manager.load().unwrap();
        assert!(settings.compaction.enabled);
        assert_eq!(settings.compaction.reserve_tokens, 16384);
        assert_eq!(settings.compaction.keep_recent_tokens, 20000);
    }

    #[test]
    fn save_and_reload_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manager = SettingsManager::new(tmp.path());
        manager.settings_mut().compaction.reserve_tokens = 8192;
        manager.settings_mut().default_model = Some("stub-1".into());
        manager.save().unwrap();

        let mut reloaded = SettingsManager::new(tmp.path());
        let settings = reloaded.load().unwrap();
        assert_eq!(settings.compaction.reserve_tokens, 8192);
        assert_eq!(settings.default_model.as_deref(), Some("stub-1"));
    }

    #[cfg(unix)]
    #[test]
    fn settings_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let manager = SettingsManager::new(tmp.path());
        manager.save().unwrap();

        let metadata = std::fs::metadata(paths::settings_file(tmp.path())).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }
}
