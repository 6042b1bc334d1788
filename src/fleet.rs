//! Backing up every repository an account owns.
use anyhow::Result;
use futures::TryStreamExt;
use reqwest::Url;
use tracing::{error, info, instrument};

use crate::forge::model::ApiRepository;
use crate::forge::ForgeClient;
use crate::model::RepoTarget;
use crate::pagination::PAGE_SIZE;
use crate::pipeline::Pipeline;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FleetReport {
    pub succeeded: Vec<RepoTarget>,
    pub failed: Vec<RepoTarget>,
}

pub fn repositories_url(client: &ForgeClient, owner: &str) -> Result<Url> {
    let mut url = client.endpoint(&format!("users/{}/repos", owner))?;
    url.query_pairs_mut()
        .append_pair("per_page", &PAGE_SIZE.to_string())
        .append_pair("type", "owner");
    Ok(url)
}

/// Non-fork repositories owned by `owner`, in listing order.
pub async fn owned_repositories(client: &ForgeClient, owner: &str) -> Result<Vec<RepoTarget>> {
    let url = repositories_url(client, owner)?;
    let targets = client
        .pages::<ApiRepository>(url.as_str())
        .into_stream()
        .try_filter(|repo| futures::future::ready(!repo.fork))
        .map_ok(|repo| RepoTarget::new(repo.owner.login, repo.name))
        .try_collect()
        .await?;
    Ok(targets)
}

/// Run one pipeline per owned repository, one after another. A failing
/// repository is logged and the rest still run.
#[instrument(skip_all, fields(owner = %owner))]
pub async fn run(pipeline: &Pipeline<'_>, client: &ForgeClient, owner: &str) -> Result<FleetReport> {
    let targets = owned_repositories(client, owner).await?;
    info!(count = targets.len(), "backing up repositories of {}", owner);

    let mut report = FleetReport::default();
    for target in targets {
        match pipeline.run(&target).await {
            Ok(_) => report.succeeded.push(target),
            Err(err) => {
                error!(err = format!("{:#}", err), "backup of {} failed", target);
                report.failed.push(target);
            }
        }
    }
    info!(
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        "fleet backup finished"
    );
    Ok(report)
}
