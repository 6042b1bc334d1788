//! One full backup run of a single repository.
//!
//! Phases run strictly in order: issues, git, releases, wiki, projects, then
//! the watermark commit. Optional phases are skipped by feature flag. Any
//! unrecovered error returns before the commit, so the next run starts from
//! the previous watermark again.

use anyhow::{Context, Result};
use reqwest::{StatusCode, Url};
use std::path::Path;
use tokio_util::io::StreamReader;
use tracing::{debug, info, instrument, warn};

use crate::archive;
use crate::config::BackupOptions;
use crate::forge::model::{
    ApiCard, ApiColumn, ApiComment, ApiIssue, ApiProject, ApiPullRequest, ApiRelease,
};
use crate::forge::{ForgeClient, ForgeError};
use crate::git::{MirrorSync, MirrorVariant, SyncFlags, SyncOutcome};
use crate::model::{
    CardRecord, ColumnRecord, CommentRecord, IssueRecord, ProjectRecord, PullRequestDetail,
    ReleaseRecord, RepoTarget,
};
use crate::pagination::{with_page_size, PAGE_SIZE};
use crate::state::{self, Watermark};

/// Counts of what a run did, mostly for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub started: Watermark,
    pub since: Option<Watermark>,
    pub issues: usize,
    pub pull_requests: usize,
    pub releases_written: usize,
    pub releases_skipped: usize,
    pub assets: usize,
    pub projects: usize,
    pub projects_unavailable: bool,
    pub git: Option<SyncOutcome>,
    pub wiki: Option<SyncOutcome>,
}

impl RunReport {
    fn new(started: Watermark, since: Option<Watermark>) -> Self {
        Self {
            started,
            since,
            issues: 0,
            pull_requests: 0,
            releases_written: 0,
            releases_skipped: 0,
            assets: 0,
            projects: 0,
            projects_unavailable: false,
            git: None,
            wiki: None,
        }
    }
}

pub struct Pipeline<'a> {
    client: &'a ForgeClient,
    mirror: &'a dyn MirrorSync,
    options: &'a BackupOptions,
}

impl<'a> Pipeline<'a> {
    pub fn new(client: &'a ForgeClient, mirror: &'a dyn MirrorSync, options: &'a BackupOptions) -> Self {
        Self {
            client,
            mirror,
            options,
        }
    }

    /// Back up `target`, using the current time as the new watermark.
    pub async fn run(&self, target: &RepoTarget) -> Result<RunReport> {
        self.run_at(target, Watermark::now()).await
    }

    /// Back up `target`; `started` must be taken before any request and is
    /// committed as the watermark only when every phase succeeded.
    #[instrument(skip_all, fields(repo = %target))]
    pub async fn run_at(&self, target: &RepoTarget, started: Watermark) -> Result<RunReport> {
        let dir = target.dir(&self.options.root);
        archive::ensure_dir(&dir).await?;

        let since = state::resolve_since(self.options.since, &dir).await;
        let features = self.options.features;
        info!(
            since = %since.map_or_else(|| "none".to_string(), |s| s.to_string()),
            started = %started,
            "starting backup of {}",
            target
        );
        let mut report = RunReport::new(started, since);

        self.backup_issues(target, &dir, since, &mut report)
            .await
            .context("issue backup failed")?;

        let flags = SyncFlags {
            prune: features.prune,
            lfs: features.lfs,
        };
        report.git = Some(self.mirror.sync(target, &dir, MirrorVariant::Main, flags).await);

        if features.releases {
            self.backup_releases(target, &dir, &mut report)
                .await
                .context("release backup failed")?;
        }

        if features.wiki {
            report.wiki = Some(self.mirror.sync(target, &dir, MirrorVariant::Wiki, flags).await);
        }

        if features.projects {
            match self.backup_projects(target, &dir).await {
                Ok(count) => report.projects = count,
                Err(err) if projects_unavailable(&err) => {
                    warn!(?err, "projects unavailable for {}; skipping", target);
                    report.projects_unavailable = true;
                }
                Err(err) => return Err(err.context("project backup failed")),
            }
        }

        state::commit(&dir, started).await?;
        info!(
            issues = report.issues,
            releases = report.releases_written,
            projects = report.projects,
            watermark = %started,
            "backup of {} complete",
            target
        );
        Ok(report)
    }

    fn repo_endpoint(&self, target: &RepoTarget, tail: &str) -> Result<Url> {
        let path = format!("repos/{}/{}/{}", target.owner, target.name, tail);
        Ok(self.client.endpoint(&path)?)
    }

    /// Issue listing URL, filtered to issues updated at or after `since`.
    pub fn issues_url(&self, target: &RepoTarget, since: Option<Watermark>) -> Result<Url> {
        let mut url = self.repo_endpoint(target, "issues")?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("per_page", &PAGE_SIZE.to_string());
            if let Some(since) = since {
                q.append_pair("since", &since.to_string());
            }
            q.append_pair("state", "all");
        }
        Ok(url)
    }

    #[instrument(skip_all)]
    async fn backup_issues(
        &self,
        target: &RepoTarget,
        dir: &Path,
        since: Option<Watermark>,
        report: &mut RunReport,
    ) -> Result<()> {
        let issues_dir = dir.join("issues");
        archive::ensure_dir(&issues_dir).await?;

        let url = self.issues_url(target, since)?;
        let mut pages = self.client.pages::<ApiIssue>(url.as_str());
        while let Some(page) = pages.next_page().await? {
            for issue in page {
                debug!(number = issue.number, "found issue");
                let record = self.issue_record(&issue).await?;
                if record.is_pull_request() {
                    report.pull_requests += 1;
                }
                let path = issues_dir.join(format!("{}.json", issue.number));
                archive::write_record(&path, &record, self.options.gzip).await?;
                report.issues += 1;
            }
        }
        info!(count = report.issues, "issues archived");
        Ok(())
    }

    async fn issue_record(&self, issue: &ApiIssue) -> Result<IssueRecord> {
        let comments = match (&issue.comments_url, issue.comments) {
            (Some(url), count) if count > 0 => self
                .client
                .pages::<ApiComment>(with_page_size(url)?)
                .collect_all()
                .await
                .with_context(|| format!("failed to fetch comments of #{}", issue.number))?
                .iter()
                .map(CommentRecord::from)
                .collect(),
            _ => Vec::new(),
        };

        let detail = match (&issue.pull_request, self.options.features.detailed_prs) {
            (Some(pr), true) => match &pr.url {
                Some(url) => {
                    let pr: ApiPullRequest = self
                        .client
                        .get_json(url)
                        .await
                        .with_context(|| format!("failed to fetch pull request #{}", issue.number))?;
                    Some(PullRequestDetail::from(&pr))
                }
                None => None,
            },
            _ => None,
        };

        Ok(IssueRecord::from_api(issue, comments, detail))
    }

    #[instrument(skip_all)]
    async fn backup_releases(&self, target: &RepoTarget, dir: &Path, report: &mut RunReport) -> Result<()> {
        let releases_dir = dir.join("releases");
        archive::ensure_dir(&releases_dir).await?;

        let mut url = self.repo_endpoint(target, "releases")?;
        url.query_pairs_mut()
            .append_pair("per_page", &PAGE_SIZE.to_string());

        let mut pages = self.client.pages::<ApiRelease>(url.as_str());
        while let Some(page) = pages.next_page().await? {
            for release in page {
                let release_dir = releases_dir.join(release.id.to_string());
                // Releases are immutable once archived; an existing directory
                // means this one is done, assets included.
                if tokio::fs::try_exists(&release_dir).await.unwrap_or(false) {
                    debug!(id = release.id, "release already archived");
                    report.releases_skipped += 1;
                    continue;
                }
                self.save_release(&release, &release_dir, report)
                    .await
                    .with_context(|| format!("failed to archive release {}", release.id))?;
                report.releases_written += 1;
            }
        }
        info!(
            written = report.releases_written,
            skipped = report.releases_skipped,
            "releases archived"
        );
        Ok(())
    }

    async fn save_release(&self, release: &ApiRelease, dir: &Path, report: &mut RunReport) -> Result<()> {
        info!(id = release.id, tag = release.tag_name.as_deref(), "archiving release");
        archive::ensure_dir(dir).await?;
        let record = ReleaseRecord::from(release);
        archive::write_record(&dir.join("release.json"), &record, self.options.gzip).await?;

        for asset in &release.assets {
            let Some(file_name) = Path::new(&asset.name).file_name() else {
                warn!(name = %asset.name, "skipping asset with unusable name");
                continue;
            };
            let compress =
                archive::should_compress_asset(self.options.gzip, asset.content_type.as_deref(), &asset.name);
            let stream = self.client.download(&asset.browser_download_url).await?;
            let (path, bytes) =
                archive::write_stream(StreamReader::new(stream), &dir.join(file_name), compress).await?;
            debug!(path = %path.display(), bytes, "asset stored");
            report.assets += 1;
        }
        Ok(())
    }

    #[instrument(skip_all)]
    async fn backup_projects(&self, target: &RepoTarget, dir: &Path) -> Result<usize> {
        let mut url = self.repo_endpoint(target, "projects")?;
        url.query_pairs_mut()
            .append_pair("per_page", &PAGE_SIZE.to_string())
            .append_pair("state", "all");

        let mut pages = self.client.pages::<ApiProject>(url.as_str());
        let projects_dir = dir.join("projects");
        let mut count = 0;
        while let Some(page) = pages.next_page().await? {
            if count == 0 {
                archive::ensure_dir(&projects_dir).await?;
            }
            for project in page {
                let columns = self.project_columns(&project).await?;
                let record = ProjectRecord::from_api(&project, columns);
                let path = projects_dir.join(format!("{}.json", project.id));
                archive::write_record(&path, &record, self.options.gzip).await?;
                count += 1;
            }
        }
        info!(count, "projects archived");
        Ok(count)
    }

    async fn project_columns(&self, project: &ApiProject) -> Result<Vec<ColumnRecord>> {
        let columns = self
            .client
            .pages::<ApiColumn>(with_page_size(&project.columns_url)?)
            .collect_all()
            .await?;
        let mut out = Vec::with_capacity(columns.len());
        for column in &columns {
            let cards = self
                .client
                .pages::<ApiCard>(with_page_size(&column.cards_url)?)
                .collect_all()
                .await?;
            out.push(ColumnRecord::from_api(
                column,
                cards.iter().map(CardRecord::from).collect(),
            ));
        }
        Ok(out)
    }
}

/// Projects can be disabled or off-limits on a repository we can otherwise read.
fn projects_unavailable(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<ForgeError>())
        .filter_map(ForgeError::status)
        .any(|s| matches!(s, StatusCode::FORBIDDEN | StatusCode::NOT_FOUND | StatusCode::GONE))
}
