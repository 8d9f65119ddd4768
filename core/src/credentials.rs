use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::{CoreError, CoreResult};
use crate::platform::{Platform, PLATFORMS};

/// Obfuscation only. The file keeps keys out of casual view, not away from
/// someone with access to the home directory.
const OBFUSCATION_KEY: &[u8] = b"modelhub-credential-store";

/// Legacy user settings that used to hold API keys in plain text.
pub trait SettingsSource {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: Option<String>);
}

#[derive(Debug, Default, Clone)]
pub struct MemorySettings {
    values: HashMap<String, String>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsSource for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Option<String>) {
        match value {
            Some(value) => {
                self.values.insert(key.to_string(), value);
            }
            None => {
                self.values.remove(key);
            }
        }
    }
}

pub fn settings_key(platform: Platform) -> String {
    format!("api_key.{}", platform.as_str())
}

/// Per-platform API keys, persisted to `private.key`.
pub struct CredentialStore {
    path: PathBuf,
    keys: Mutex<BTreeMap<String, String>>,
}

impl CredentialStore {
    /// Loads the store if the file exists. An unreadable file is logged and
    /// treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let keys = if path.exists() {
            match load_file(&path) {
                Ok(keys) => keys,
                Err(err) => {
                    tracing::warn!(path = %path.display(), "ignoring unreadable credential file: {}", err);
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };
        Self {
            path,
            keys: Mutex::new(keys),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One-time import from legacy settings. Only runs while no credential
    /// file exists; the imported settings are cleared afterwards.
    pub fn migrate(&self, settings: &mut dyn SettingsSource) -> CoreResult<BTreeMap<String, String>> {
        if !self.path.exists() {
            let mut keys = self.lock()?;
            for platform in PLATFORMS {
                let key = settings_key(*platform);
                if let Some(value) = settings.get(&key).filter(|value| !value.trim().is_empty()) {
                    keys.insert(platform.as_str().to_string(), value);
                }
            }
            save_file(&self.path, &keys)?;
            for platform in PLATFORMS {
                settings.set(&settings_key(*platform), None);
            }
            tracing::info!(count = keys.len(), "migrated api keys from settings");
        }
        self.masked()
    }

    pub fn get(&self, platform: Platform) -> Option<String> {
        self.keys
            .lock()
            .ok()
            .and_then(|keys| keys.get(platform.as_str()).cloned())
    }

    /// `None` or an empty value clears the key.
    pub fn set(&self, platform: &str, value: Option<&str>) -> CoreResult<()> {
        let platform = Platform::from_str(platform)
            .ok_or_else(|| CoreError::Validation(format!("unknown platform: {}", platform)))?;
        let mut keys = self.lock()?;
        match value.map(str::trim).filter(|value| !value.is_empty()) {
            Some(value) => {
                keys.insert(platform.as_str().to_string(), value.to_string());
            }
            None => {
                keys.remove(platform.as_str());
            }
        }
        save_file(&self.path, &keys)
    }

    pub fn masked(&self) -> CoreResult<BTreeMap<String, String>> {
        let keys = self.lock()?;
        Ok(keys
            .iter()
            .map(|(platform, value)| (platform.clone(), mask(value)))
            .collect())
    }

    fn lock(&self) -> CoreResult<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.keys
            .lock()
            .map_err(|_| CoreError::Storage("credential lock poisoned".to_string()))
    }
}

/// First four and last four characters around `****`. Keys too short to
/// keep anything hidden are masked entirely.
pub fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}****{}", head, tail)
}

fn xor(data: &[u8]) -> Vec<u8> {
    data.iter()
        .zip(OBFUSCATION_KEY.iter().cycle())
        .map(|(byte, key)| byte ^ key)
        .collect()
}

fn load_file(path: &Path) -> CoreResult<BTreeMap<String, String>> {
    let encoded = fs::read_to_string(path)?;
    let raw = STANDARD
        .decode(encoded.trim())
        .map_err(|err| CoreError::Storage(format!("credential file is not base64: {}", err)))?;
    Ok(serde_json::from_slice(&xor(&raw))?)
}

fn save_file(path: &Path, keys: &BTreeMap<String, String>) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_vec(keys)?;
    let tmp = path.with_extension("key.tmp");
    fs::write(&tmp, STANDARD.encode(xor(&json)))?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_long_and_short_keys() {
        assert_eq!(mask("abcdefghijwxyz"), "abcd****wxyz");
        assert_eq!(mask("short"), "****");
    }

    #[test]
    fn migrate_runs_once_and_clears_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("private.key");
        let mut settings = MemorySettings::new();
        settings.set("api_key.civitai", Some("civitai-secret-1234".to_string()));

        let store = CredentialStore::open(&path);
        let masked = store.migrate(&mut settings).unwrap();
        assert_eq!(masked.get("civitai").map(String::as_str), Some("civi****1234"));
        assert!(!masked.contains_key("huggingface"));
        assert_eq!(settings.get("api_key.civitai"), None);

        settings.set("api_key.civitai", Some("replacement-value".to_string()));
        let again = CredentialStore::open(&path);
        again.migrate(&mut settings).unwrap();
        assert_eq!(again.get(Platform::Civitai).as_deref(), Some("civitai-secret-1234"));
        assert!(settings.get("api_key.civitai").is_some());
    }

    #[test]
    fn file_is_not_plain_text_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("private.key");
        let store = CredentialStore::open(&path);
        store.set("huggingface", Some("hf_abcdefghijkl")).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("hf_abcdefghijkl"));
        let reopened = CredentialStore::open(&path);
        assert_eq!(reopened.get(Platform::HuggingFace).as_deref(), Some("hf_abcdefghijkl"));

        reopened.set("huggingface", None).unwrap();
        assert_eq!(reopened.get(Platform::HuggingFace), None);
    }

    #[test]
    fn unknown_platform_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path().join("private.key"));
        let err = store.set("github", Some("x")).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
