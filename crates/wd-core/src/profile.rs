//! User profile: auth tokens and defaults, an explicit value instead of
//! process-wide mutable state. The orchestrator receives a snapshot at
//! construction; writes go through [`ProfileStore`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::EngineError;

/// One control-plane login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    pub login_url: String,
    pub username: String,
    pub token: String,
    #[serde(default)]
    pub current: bool,
}

/// Profile snapshot threaded through the orchestrator constructor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub auths: Vec<Auth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry_enabled: Option<bool>,
}

impl Profile {
    pub fn current_auth(&self) -> Option<&Auth> {
        self.auths.iter().find(|a| a.current)
    }

    /// Insert or refresh a login; the touched entry becomes current.
    pub fn upsert_auth(&mut self, login_url: &str, username: &str, token: &str) {
        for auth in &mut self.auths {
            auth.current = false;
        }
        match self
            .auths
            .iter_mut()
            .find(|a| a.login_url == login_url && a.username == username)
        {
            Some(auth) => {
                auth.token = token.to_string();
                auth.current = true;
            }
            None => self.auths.push(Auth {
                login_url: login_url.to_string(),
                username: username.to_string(),
                token: token.to_string(),
                current: true,
            }),
        }
    }
}

/// Durable profile storage, YAML next to the registry.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn default_path(home: &Path) -> PathBuf {
        home.join(".workdock").join("config.yaml")
    }

    /// Load the profile; a missing file is an empty profile.
    pub fn load(&self) -> crate::Result<Profile> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_yaml::from_str(&text)
                .map_err(|e| EngineError::Validation(format!("bad profile file: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Profile::default()),
            Err(e) => Err(EngineError::Validation(format!(
                "cannot read profile: {}",
                e
            ))),
        }
    }

    pub fn save(&self, profile: &Profile) -> crate::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Validation(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let text = serde_yaml::to_string(profile)
            .map_err(|e| EngineError::Validation(format!("profile serialize: {}", e)))?;
        std::fs::write(&self.path, text)
            .map_err(|e| EngineError::Validation(format!("cannot write profile: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_empty_profile() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path().join("config.yaml"));
        let profile = store.load().unwrap();
        assert!(profile.auths.is_empty());
    }

    #[test]
    fn upsert_switches_current_login() {
        let mut profile = Profile::default();
        profile.upsert_auth("https://a.example.com", "dev", "t1");
        profile.upsert_auth("https://b.example.com", "dev", "t2");
        assert_eq!(profile.auths.len(), 2);
        assert_eq!(profile.current_auth().unwrap().token, "t2");

        profile.upsert_auth("https://a.example.com", "dev", "t3");
        assert_eq!(profile.auths.len(), 2);
        assert_eq!(profile.current_auth().unwrap().token, "t3");
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path().join("nested").join("config.yaml"));
        let mut profile = Profile::default();
        profile.upsert_auth("https://api.example.com", "dev", "token");
        store.save(&profile).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.current_auth().unwrap().username, "dev");
    }
}
