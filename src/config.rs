//! Configuration loader and validator for the forge archiver.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::state::Watermark;

pub const DEFAULT_API_URL: &str = "https://api.github.com/";
pub const DEFAULT_WEB_URL: &str = "https://github.com/";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub archive: Archive,
    pub api: Api,
    pub features: Features,
}

/// Where and how archives are written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Archive {
    pub root: String,
    pub gzip: bool,
}

impl Default for Archive {
    fn default() -> Self {
        Self {
            root: "./github".into(),
            gzip: false,
        }
    }
}

/// Origin endpoints and credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Api {
    pub base_url: String,
    pub web_url: String,
    pub token: Option<String>,
    pub quota_reserve: u64,
}

impl Default for Api {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.into(),
            web_url: DEFAULT_WEB_URL.into(),
            token: None,
            quota_reserve: 0,
        }
    }
}

/// Optional pipeline phases and their modifiers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Features {
    pub prune: bool,
    pub detailed_prs: bool,
    pub lfs: bool,
    pub releases: bool,
    pub wiki: bool,
    pub projects: bool,
}

impl Features {
    /// Enable every toggle that is set in `other`; never disables one.
    pub fn union(self, other: Features) -> Features {
        Features {
            prune: self.prune || other.prune,
            detailed_prs: self.detailed_prs || other.detailed_prs,
            lfs: self.lfs || other.lfs,
            releases: self.releases || other.releases,
            wiki: self.wiki || other.wiki,
            projects: self.projects || other.projects,
        }
    }
}

/// Everything a pipeline run needs, resolved once from config and CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOptions {
    pub root: PathBuf,
    pub gzip: bool,
    pub features: Features,
    /// Explicit `since` watermark; wins over the persisted one.
    pub since: Option<Watermark>,
}

impl Config {
    /// Ensure required directories exist (creates `archive.root` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(&self.archive.root)
    }

    pub fn api_url(&self) -> Result<Url, ConfigError> {
        parse_base(&self.api.base_url).ok_or(ConfigError::Invalid("api.base_url must be an absolute URL"))
    }

    pub fn web_url(&self) -> Result<Url, ConfigError> {
        parse_base(&self.api.web_url).ok_or(ConfigError::Invalid("api.web_url must be an absolute URL"))
    }

    pub fn backup_options(&self, since: Option<Watermark>) -> BackupOptions {
        BackupOptions {
            root: PathBuf::from(&self.archive.root),
            gzip: self.archive.gzip,
            features: self.features,
            since,
        }
    }
}

/// Parse a base URL, adding the trailing slash `Url::join` relies on.
fn parse_base(raw: &str) -> Option<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    };
    let url = Url::parse(&with_slash).ok()?;
    if url.cannot_be_a_base() {
        return None;
    }
    Some(url)
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, returns the built-in defaults.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let cfg = match path {
        Some(path) => {
            let content = fs::read_to_string(path)?;
            serde_yaml::from_str(&content)?
        }
        None => Config::default(),
    };
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.archive.root.trim().is_empty() {
        return Err(ConfigError::Invalid("archive.root must be non-empty"));
    }
    cfg.api_url()?;
    cfg.web_url()?;
    if let Some(token) = &cfg.api.token {
        if token.trim().is_empty() {
            return Err(ConfigError::Invalid("api.token must be non-empty when set"));
        }
    }
    Ok(())
}

/// Returns an example YAML config with every key spelled out.
pub fn example() -> &'static str {
    r#"archive:
  root: "./github"
  gzip: true

api:
  base_url: "https://api.github.com/"
  web_url: "https://github.com/"
  token: "YOUR_GITHUB_TOKEN"
  quota_reserve: 50

features:
  prune: true
  detailed_prs: true
  lfs: false
  releases: true
  wiki: true
  projects: false
"#
}
