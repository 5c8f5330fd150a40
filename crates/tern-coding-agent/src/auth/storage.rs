use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::config::paths;
use crate::error::TernError;

/// A stored credential. Only API keys for now; the tag leaves room for
/// token-based schemes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AuthCredential {
    ApiKey { key: String },
}

impl AuthCredential {
    pub fn api_key(key: impl Into<String>) -> Self {
        AuthCredential::ApiKey { key: key.into() }
    }

    pub fn token(&self) -> &str {
        match self {
            AuthCredential::ApiKey { key } => key,
        }
    }
}

/// Persisted auth.json structure: provider -> credential.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthFile {
    #[serde(default)]
    pub credentials: HashMap<String, AuthCredential>,
}

/// Credential storage with layered resolution:
/// runtime override -> auth.json -> provider env var -> generic TERN_API_KEY.
/// Writes are serialized by an in-process lock and land in a 0600 file.
pub struct AuthStorage {
    base_dir: PathBuf,
    runtime: RwLock<HashMap<String, AuthCredential>>,
    write_lock: Mutex<()>,
    env_mappings: HashMap<String, String>,
}

impl AuthStorage {
    pub fn new(base_dir: &Path) -> Self {
        let mut env_mappings = HashMap::new();
        env_mappings.insert("anthropic".to_string(), "ANTHROPIC_API_KEY".to_string());
        env_mappings.insert("openai".to_string(), "OPENAI_API_KEY".to_string());
        env_mappings.insert("google".to_string(), "GOOGLE_API_KEY".to_string());
        env_mappings.insert("xai".to_string(), "XAI_API_KEY".to_string());
        env_mappings.insert("groq".to_string(), "GROQ_API_KEY".to_string());
        env_mappings.insert("mistral".to_string(), "MISTRAL_API_KEY".to_string());
        env_mappings.insert("openrouter".to_string(), "OPENROUTER_API_KEY".to_string());

        Self {
            base_dir: base_dir.to_path_buf(),
            runtime: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
            env_mappings,
        }
    }

    /// Set a runtime credential override (highest priority, not persisted).
    pub fn set_runtime_credential(&self, provider: &str, credential: AuthCredential) {
        self.runtime
            .write()
            .unwrap()
            .insert(provider.to_string(), credential);
    }

    pub fn remove_runtime_credential(&self, provider: &str) {
        self.runtime.write().unwrap().remove(provider);
    }

    pub fn get_api_key(&self, provider: &str) -> Option<String> {
        self.get_credential(provider).map(|c| c.token().to_string())
    }

    /// Resolve an API key or fail with the provider name.
    pub fn require_api_key(&self, provider: &str) -> Result<String, TernError> {
        self.get_api_key(provider)
            .ok_or_else(|| TernError::NoApiKey(provider.to_string()))
    }

    pub fn get_credential(&self, provider: &str) -> Option<AuthCredential> {
        if let Some(cred) = self.runtime.read().unwrap().get(provider) {
            return Some(cred.clone());
        }

        if let Some(cred) = self.load_auth_file().credentials.get(provider) {
            return Some(cred.clone());
        }

        if let Some(env_var) = self.env_mappings.get(provider) {
            if let Ok(val) = std::env::var(env_var) {
                if !val.is_empty() {
                    return Some(AuthCredential::api_key(val));
                }
            }
        }

        if let Ok(val) = std::env::var("TERN_API_KEY") {
            if !val.is_empty() {
                return Some(AuthCredential::api_key(val));
            }
        }

        None
    }

    /// Persist a credential into auth.json.
    pub fn save_credential(
        &self,
        provider: &str,
        credential: AuthCredential,
    ) -> Result<(), TernError> {
        let _guard = self.write_lock.lock().unwrap();
        let mut file = self.load_auth_file();
        file.credentials.insert(provider.to_string(), credential);
        self.write_auth_file(&file)
    }

    /// Remove a credential from auth.json.
    pub fn delete_credential(&self, provider: &str) -> Result<(), TernError> {
        let _guard = self.write_lock.lock().unwrap();
        let mut file = self.load_auth_file();
        file.credentials.remove(provider);
        self.write_auth_file(&file)
    }

    fn load_auth_file(&self) -> AuthFile {
        let path = paths::auth_file(&self.base_dir);
        let Ok(content) = std::fs::read_to_string(&path) else {
            return AuthFile::default();
        };
        serde_json::from_str(&content).unwrap_or_default()
    }

    fn write_auth_file(&self, file: &AuthFile) -> Result<(), TernError> {
        paths::ensure_dir(&self.base_dir)?;
        let path = paths::auth_file(&self.base_dir);
        let content = serde_json::to_string_pretty(file)?;

        let unique = uuid::Uuid::new_v4();
        let tmp_path = path.with_file_name(format!(".auth.{unique}.tmp"));
        {
            let mut opts = std::fs::OpenOptions::new();
            opts.write(true).create_new(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                opts.mode(0o600);
            }
            let mut out = opts.open(&tmp_path)?;
            out.write_all(content.as_bytes()).map_err(|e| {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_override_beats_file() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = AuthStorage::new(tmp.path());
        storage
            .save_credential("stub", AuthCredential::api_key("file-key"))
            .unwrap();
        storage.set_runtime_credential("stub", AuthCredential::api_key("runtime-key"));

        assert_eq!(storage.get_api_key("stub").as_deref(), Some("runtime-key"));
        storage.remove_runtime_credential("stub");
        assert_eq!(storage.get_api_key("stub").as_deref(), Some("file-key"));
    }

    #[test]
    fn missing_provider_yields_no_api_key_error() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = AuthStorage::new(tmp.path());
        match storage.require_api_key("nonexistent-provider") {
            Err(TernError::NoApiKey(provider)) => {
                assert_eq!(provider, "nonexistent-provider")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn save_and_delete_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = AuthStorage::new(tmp.path());
        storage
            .save_credential("stub", AuthCredential::api_key("k1"))
            .unwrap();
        assert_eq!(storage.get_api_key("stub").as_deref(), Some("k1"));

        storage.delete_credential("stub").unwrap();
        assert_eq!(storage.get_api_key("stub"), None);
    }

    #[cfg(unix)]
    #[test]
    fn auth_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let storage = AuthStorage::new(tmp.path());
        storage
            .save_credential("stub", AuthCredential::api_key("k1"))
            .unwrap();

        let metadata = std::fs::metadata(paths::auth_file(tmp.path())).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }
}
