//! Bare mirror maintenance through the `git` executable.
//!
//! Failures here are soft: a failed clone, fetch or LFS fetch is logged and
//! reported in the outcome, and the caller's run carries on.

use async_trait::async_trait;
use reqwest::Url;
use std::ffi::{OsStr, OsString};
use std::path::Path;
use tokio::process::Command;
use tracing::{info, instrument, warn};

use crate::model::RepoTarget;

/// Disables git's interactive credential prompt so bad credentials fail fast.
pub const NO_PROMPT_ENV: (&str, &str) = ("GIT_TERMINAL_PROMPT", "0");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorVariant {
    Main,
    Wiki,
}

impl MirrorVariant {
    /// Directory under the repository archive root.
    pub fn dir_name(self) -> &'static str {
        match self {
            MirrorVariant::Main => "git",
            MirrorVariant::Wiki => "wiki",
        }
    }

    fn repo_suffix(self) -> &'static str {
        match self {
            MirrorVariant::Main => ".git",
            MirrorVariant::Wiki => ".wiki.git",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorAction {
    Clone,
    Fetch,
}

/// What a sync attempted and whether every git invocation succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    pub action: MirrorAction,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncFlags {
    pub prune: bool,
    pub lfs: bool,
}

#[async_trait]
pub trait MirrorSync: Send + Sync {
    /// Clone or refresh the `variant` mirror under `target_dir`. Never fails
    /// the caller; inspect the outcome instead.
    async fn sync(
        &self,
        target: &RepoTarget,
        target_dir: &Path,
        variant: MirrorVariant,
        flags: SyncFlags,
    ) -> SyncOutcome;
}

/// Runs the real `git` binary (or a configured stand-in).
#[derive(Debug, Clone)]
pub struct GitMirror {
    program: OsString,
    leading_args: Vec<OsString>,
    web_base: Url,
}

impl GitMirror {
    pub fn new(web_base: Url) -> Self {
        Self {
            program: OsString::from("git"),
            leading_args: Vec::new(),
            web_base,
        }
    }

    /// Run `program leading_args.. <git args>` instead of `git`, e.g. a wrapper script.
    pub fn with_command(mut self, program: impl Into<OsString>, leading_args: Vec<OsString>) -> Self {
        self.program = program.into();
        self.leading_args = leading_args;
        self
    }

    /// Clone URL for the repository or its wiki.
    pub fn remote_url(&self, target: &RepoTarget, variant: MirrorVariant) -> Option<Url> {
        let path = format!("{}/{}{}", target.owner, target.name, variant.repo_suffix());
        self.web_base.join(&path).ok()
    }

    async fn run<I, S>(&self, cwd: &Path, args: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        let shown = args
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        let status = Command::new(&self.program)
            .args(&self.leading_args)
            .args(&args)
            .current_dir(cwd)
            .env(NO_PROMPT_ENV.0, NO_PROMPT_ENV.1)
            .kill_on_drop(true)
            .status()
            .await;
        match status {
            Ok(s) if s.success() => true,
            Ok(s) => {
                warn!(cwd = %cwd.display(), status = %s, "git {} failed", shown);
                false
            }
            Err(err) => {
                warn!(?err, cwd = %cwd.display(), "could not run git {}", shown);
                false
            }
        }
    }
}

#[async_trait]
impl MirrorSync for GitMirror {
    #[instrument(skip_all, fields(repo = %target, variant = variant.dir_name()))]
    async fn sync(
        &self,
        target: &RepoTarget,
        target_dir: &Path,
        variant: MirrorVariant,
        flags: SyncFlags,
    ) -> SyncOutcome {
        let dir_name = variant.dir_name();
        let mirror_dir = target_dir.join(dir_name);

        let (action, mut succeeded) = if tokio::fs::try_exists(&mirror_dir).await.unwrap_or(false) {
            info!("incremental mirror update using fetch");
            let mut args = vec!["fetch", "--all"];
            if flags.prune {
                args.push("--prune");
            }
            (MirrorAction::Fetch, self.run(&mirror_dir, args).await)
        } else {
            info!("initial mirror using clone");
            let ok = match self.remote_url(target, variant) {
                Some(url) => {
                    if let Err(err) = tokio::fs::create_dir_all(target_dir).await {
                        warn!(?err, "could not create {}", target_dir.display());
                        false
                    } else {
                        self.run(target_dir, ["clone", "--mirror", url.as_str(), dir_name]).await
                    }
                }
                None => {
                    warn!(base = %self.web_base, "cannot build clone URL");
                    false
                }
            };
            (MirrorAction::Clone, ok)
        };

        if flags.lfs {
            if tokio::fs::try_exists(&mirror_dir).await.unwrap_or(false) {
                info!("fetching LFS objects");
                succeeded &= self.run(&mirror_dir, ["lfs", "fetch", "--all"]).await;
            } else {
                warn!("no mirror on disk; skipping LFS fetch");
                succeeded = false;
            }
        }

        SyncOutcome { action, succeeded }
    }
}
