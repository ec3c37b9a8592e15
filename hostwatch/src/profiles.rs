//! Connection profiles: a JSON map of profile name -> endpoints.
//! Stored under $XDG_CONFIG_HOME/hostwatch/profiles.json (fallback: the
//! platform config dir from dirs-next).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{fs, io};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{ws_url_for, ConnectionType, MonitorConfig};
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProfileEntry {
    pub api_base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<ConnectionType>,
}

impl ProfileEntry {
    /// Point `cfg` at this profile's endpoints. Without an explicit WebSocket
    /// URL one is derived from the API URL.
    pub fn apply_to(&self, cfg: &mut MonitorConfig) -> Result<(), ConfigError> {
        cfg.api_base_url = self.api_base_url.clone();
        cfg.ws_base_url = match &self.ws_base_url {
            Some(ws) => ws.clone(),
            None => ws_url_for(&self.api_base_url)?,
        };
        if let Some(t) = self.transport {
            cfg.initial_transport = t;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileEntry>,
    #[serde(default)]
    pub version: u32,
}

pub fn config_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join("hostwatch")
    } else {
        dirs_next::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hostwatch")
    }
}

pub fn profiles_path() -> PathBuf {
    config_dir().join("profiles.json")
}

pub fn load_profiles() -> ProfilesFile {
    load_profiles_from(&profiles_path())
}

/// A missing file is an empty profile set; an unreadable one is logged and
/// treated the same way.
pub fn load_profiles_from(path: &Path) -> ProfilesFile {
    match fs::read_to_string(path) {
        Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "ignoring unreadable profiles file");
            ProfilesFile::default()
        }),
        Err(_) => ProfilesFile::default(),
    }
}

pub fn save_profiles(p: &ProfilesFile) -> io::Result<()> {
    save_profiles_to(&profiles_path(), p)
}

pub fn save_profiles_to(path: &Path, p: &ProfilesFile) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(p).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(path, data)
}

#[derive(Debug, PartialEq)]
pub enum ResolveProfile {
    /// Use the endpoints given on the command line (saved by the caller when
    /// a profile name came with them).
    Direct(ProfileEntry),
    /// Loaded from an existing profile entry.
    Loaded(ProfileEntry),
    /// Ask the user to pick one of these profile names.
    PromptSelect(Vec<String>),
    /// A profile was named but does not exist and no URL was given.
    Missing(String),
    /// Nothing given and nothing saved; fall back to the configured defaults.
    None,
}

#[derive(Debug, Default)]
pub struct ProfileRequest {
    pub profile_name: Option<String>,
    pub api_base_url: Option<String>,
    pub ws_base_url: Option<String>,
    pub transport: Option<ConnectionType>,
}

impl ProfileRequest {
    pub fn resolve(self, pf: &ProfilesFile) -> ResolveProfile {
        match (self.api_base_url, self.profile_name) {
            (Some(api_base_url), _) => ResolveProfile::Direct(ProfileEntry {
                api_base_url,
                ws_base_url: self.ws_base_url,
                transport: self.transport,
            }),
            (None, Some(name)) => match pf.profiles.get(&name) {
                Some(entry) => ResolveProfile::Loaded(entry.clone()),
                None => ResolveProfile::Missing(name),
            },
            (None, None) if pf.profiles.is_empty() => ResolveProfile::None,
            (None, None) => ResolveProfile::PromptSelect(pf.profiles.keys().cloned().collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_with(name: &str, url: &str) -> ProfilesFile {
        let mut pf = ProfilesFile::default();
        pf.profiles.insert(
            name.into(),
            ProfileEntry {
                api_base_url: url.into(),
                ..ProfileEntry::default()
            },
        );
        pf
    }

    #[test]
    fn resolves_each_case() {
        let pf = file_with("lab", "http://lab:8002/api/monitor");

        let direct = ProfileRequest {
            api_base_url: Some("http://x/api/monitor".into()),
            ..ProfileRequest::default()
        };
        assert!(matches!(direct.resolve(&pf), ResolveProfile::Direct(e) if e.api_base_url == "http://x/api/monitor"));

        let named = ProfileRequest {
            profile_name: Some("lab".into()),
            ..ProfileRequest::default()
        };
        assert!(matches!(named.resolve(&pf), ResolveProfile::Loaded(_)));

        let missing = ProfileRequest {
            profile_name: Some("nope".into()),
            ..ProfileRequest::default()
        };
        assert_eq!(missing.resolve(&pf), ResolveProfile::Missing("nope".into()));

        assert_eq!(
            ProfileRequest::default().resolve(&pf),
            ResolveProfile::PromptSelect(vec!["lab".into()])
        );
        assert_eq!(
            ProfileRequest::default().resolve(&ProfilesFile::default()),
            ResolveProfile::None
        );
    }

    #[test]
    fn entry_derives_ws_url_and_transport() {
        let entry = ProfileEntry {
            api_base_url: "https://mon.example.com/api/monitor".into(),
            ws_base_url: None,
            transport: Some(ConnectionType::Http),
        };
        let mut cfg = MonitorConfig::default();
        entry.apply_to(&mut cfg).unwrap();
        assert_eq!(cfg.ws_base_url, "wss://mon.example.com/api/monitor/ws");
        assert_eq!(cfg.initial_transport, ConnectionType::Http);
    }

    #[test]
    fn save_then_load_from_path() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("profiles.json");
        let pf = file_with("a", "http://a/api/monitor");
        save_profiles_to(&path, &pf).unwrap();
        let back = load_profiles_from(&path);
        assert_eq!(back.profiles, pf.profiles);

        fs::write(&path, "{ not json").unwrap();
        assert!(load_profiles_from(&path).profiles.is_empty());
    }
}
