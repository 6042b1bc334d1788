//! Per-repository watermark persistence.
//!
//! `backup_state.json` at the repository root holds the start time of the
//! last run that completed every phase. It is replaced atomically, so a
//! reader sees either the previous watermark or the new one.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

pub const STATE_FILE: &str = "backup_state.json";

/// Timestamp layout the origin expects for `since` filters.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Lower bound for incremental queries, at whole-second UTC precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(DateTime<Utc>);

impl Watermark {
    pub fn now() -> Self {
        Self::from(Utc::now())
    }

    /// Accepts the origin format or any RFC 3339 timestamp (normalised to UTC).
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT) {
            return Some(Self(naive.and_utc()));
        }
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| Self::from(dt.with_timezone(&Utc)))
    }
}

impl From<DateTime<Utc>> for Watermark {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.trunc_subsecs(0))
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

impl FromStr for Watermark {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).with_context(|| format!("invalid timestamp '{}', expected YYYY-MM-DDTHH:MM:SSZ", s))
    }
}

/// On-disk shape of the state file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup: Option<String>,
}

pub fn state_path(target_dir: &Path) -> PathBuf {
    target_dir.join(STATE_FILE)
}

/// Read the persisted watermark. Missing, unreadable or malformed state is
/// treated as "never backed up".
pub async fn load(target_dir: &Path) -> Option<Watermark> {
    let path = state_path(target_dir);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no backup state yet");
            return None;
        }
        Err(err) => {
            warn!(?err, path = %path.display(), "unreadable backup state; running a full backup");
            return None;
        }
    };
    let state: BackupState = match serde_json::from_str(&content) {
        Ok(state) => state,
        Err(err) => {
            warn!(?err, path = %path.display(), "malformed backup state; running a full backup");
            return None;
        }
    };
    let raw = state.last_backup?;
    let parsed = Watermark::parse(&raw);
    if parsed.is_none() {
        warn!(value = %raw, path = %path.display(), "unrecognised last_backup; running a full backup");
    }
    parsed
}

/// The `since` cutoff for a run: an explicit override wins over the file.
pub async fn resolve_since(override_since: Option<Watermark>, target_dir: &Path) -> Option<Watermark> {
    match override_since {
        Some(since) => Some(since),
        None => load(target_dir).await,
    }
}

/// Atomically replace the state file with `watermark`.
pub async fn commit(target_dir: &Path, watermark: Watermark) -> Result<()> {
    let dir = target_dir.to_path_buf();
    tokio::task::spawn_blocking(move || commit_blocking(&dir, watermark))
        .await
        .context("backup state writer panicked")?
}

fn commit_blocking(target_dir: &Path, watermark: Watermark) -> Result<()> {
    let state = BackupState {
        last_backup: Some(watermark.to_string()),
    };
    let body = serde_json::to_vec(&state).context("failed to encode backup state")?;

    let mut tmp = tempfile::NamedTempFile::new_in(target_dir)
        .with_context(|| format!("failed to create temp state file in {}", target_dir.display()))?;
    tmp.write_all(&body).context("failed to write backup state")?;
    tmp.as_file().sync_all().context("failed to sync backup state")?;

    let path = state_path(target_dir);
    tmp.persist(&path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    debug!(path = %path.display(), %watermark, "backup state committed");
    Ok(())
}
