use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use forge_backup::config::{self, Features};
use forge_backup::fleet;
use forge_backup::forge::{ForgeClient, HttpTransport};
use forge_backup::git::GitMirror;
use forge_backup::model::RepoTarget;
use forge_backup::pipeline::Pipeline;
use forge_backup::quota::QuotaGate;
use forge_backup::state::Watermark;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Incrementally archive repositories, issues, releases, wikis and projects"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Archive root directory (overrides archive.root)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// API token (overrides GITHUB_TOKEN and api.token)
    #[arg(long)]
    token: Option<String>,

    /// Requests to keep in hand before waiting for the quota reset
    #[arg(long)]
    quota_reserve: Option<u64>,

    /// Only archive issues updated at or after this time, e.g. 2024-01-31T00:00:00Z
    #[arg(long)]
    since: Option<Watermark>,

    /// Prune deleted refs when fetching mirrors
    #[arg(long)]
    prune: bool,

    /// Fetch full pull request details for each pull request
    #[arg(long)]
    detailed_prs: bool,

    /// Fetch LFS objects into the mirrors
    #[arg(long)]
    include_lfs: bool,

    #[arg(long)]
    include_releases: bool,

    #[arg(long)]
    include_wiki: bool,

    #[arg(long)]
    include_projects: bool,

    /// Gzip archived records and compressible assets
    #[arg(long)]
    gzip: bool,

    /// User or organisation owning the repositories
    owner: String,

    /// Single repository to archive; all owned repositories when omitted
    name: Option<String>,
}

impl Args {
    fn features(&self) -> Features {
        Features {
            prune: self.prune,
            detailed_prs: self.detailed_prs,
            lfs: self.include_lfs,
            releases: self.include_releases,
            wiki: self.include_wiki,
            projects: self.include_projects,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let mut cfg = config::load(args.config.as_deref())?;

    if let Some(output) = &args.output {
        cfg.archive.root = output.to_string_lossy().into_owned();
    }
    cfg.archive.gzip |= args.gzip;
    cfg.features = cfg.features.union(args.features());
    if let Some(reserve) = args.quota_reserve {
        cfg.api.quota_reserve = reserve;
    }
    let env_token = std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.trim().is_empty());
    if let Some(token) = args.token.clone().or(env_token) {
        cfg.api.token = Some(token);
    }
    config::validate(&cfg)?;
    cfg.ensure_dirs()
        .with_context(|| format!("failed to create archive root {}", cfg.archive.root))?;

    let transport = HttpTransport::new(cfg.api.token.clone()).context("failed to build HTTP client")?;
    let client = ForgeClient::new(
        Arc::new(transport),
        QuotaGate::new(cfg.api.quota_reserve),
        cfg.api_url()?,
    );
    let mirror = GitMirror::new(cfg.web_url()?);
    let options = cfg.backup_options(args.since);
    let pipeline = Pipeline::new(&client, &mirror, &options);

    info!(
        owner = %args.owner,
        root = %options.root.display(),
        authenticated = cfg.api.token.is_some(),
        "starting forge backup"
    );

    match &args.name {
        Some(name) => {
            let target = RepoTarget::new(args.owner.clone(), name.clone());
            if let Err(err) = pipeline.run(&target).await {
                error!(?err, "backup of {} failed", target);
                return Err(err);
            }
        }
        None => {
            let report = fleet::run(&pipeline, &client, &args.owner).await?;
            if !report.failed.is_empty() {
                let failed: Vec<String> = report.failed.iter().map(ToString::to_string).collect();
                bail!(
                    "{} of {} repositories failed: {}",
                    failed.len(),
                    failed.len() + report.succeeded.len(),
                    failed.join(", ")
                );
            }
        }
    }
    Ok(())
}
