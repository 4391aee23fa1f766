//! Registry credentials from the ambient docker configuration.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
struct AuthEntry {
    /// base64 of `user:password`.
    #[serde(default)]
    auth: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

/// Credential lookup over `$DOCKER_CONFIG/config.json` (or
/// `~/.docker/config.json`). Loading is best effort; a missing or broken
/// file simply yields anonymous access.
#[derive(Debug, Default)]
pub struct Keychain {
    auths: HashMap<String, AuthEntry>,
}

impl Keychain {
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(_) => return Self::default(),
        };
        match serde_json::from_slice::<DockerConfig>(&data) {
            Ok(config) => Self {
                auths: config.auths,
            },
            Err(err) => {
                log::warn!("ignoring unreadable docker config {:?}: {}", path, err);
                Self::default()
            }
        }
    }

    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        let config: DockerConfig = serde_json::from_slice(data)?;
        Ok(Self {
            auths: config.auths,
        })
    }

    fn config_path() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
            if !dir.is_empty() {
                return Some(PathBuf::from(dir).join("config.json"));
            }
        }
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".docker/config.json"))
    }

    /// Resolve `(user, password)` for a registry host.
    pub fn resolve(&self, host: &str) -> Option<(String, String)> {
        let mut candidates = vec![
            host.to_string(),
            format!("https://{}", host),
            format!("https://{}/v2/", host),
        ];
        if host == crate::reference::DOCKER_REGISTRY_HOST {
            // docker hub credentials are traditionally stored under the v1 URL
            candidates.push("https://index.docker.io/v1/".to_string());
        }
        for key in candidates {
            if let Some(entry) = self.auths.get(&key) {
                return Self::credentials(entry);
            }
        }
        None
    }

    fn credentials(entry: &AuthEntry) -> Option<(String, String)> {
        if !entry.username.is_empty() {
            return Some((entry.username.clone(), entry.password.clone()));
        }
        if entry.auth.is_empty() {
            return None;
        }
        let decoded = base64::decode(&entry.auth).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        Some((user.to_string(), pass.to_string()))
    }
}
