use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::forge::model::{
    ApiAsset, ApiCard, ApiColumn, ApiComment, ApiIssue, ApiProject, ApiPullRequest, ApiRelease,
    ApiUser,
};

/// A repository on the origin, addressed as `owner/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoTarget {
    pub owner: String,
    pub name: String,
}

impl RepoTarget {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Archive directory for this repository under `root`.
    pub fn dir(&self, root: &Path) -> PathBuf {
        root.join(&self.owner).join(&self.name)
    }
}

impl fmt::Display for RepoTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Reaction name -> count, with zero counts and bookkeeping keys removed.
pub type Reactions = BTreeMap<String, u64>;

/// Reduce the origin's reaction rollup to the reactions actually present.
pub fn reduce_reactions(raw: Option<&Value>) -> Reactions {
    let Some(Value::Object(map)) = raw else {
        return Reactions::new();
    };
    map.iter()
        .filter(|(name, _)| name.as_str() != "total_count")
        .filter_map(|(name, count)| Some((name.clone(), count.as_u64()?)))
        .filter(|(_, count)| *count > 0)
        .collect()
}

fn login(user: Option<&ApiUser>) -> Option<String> {
    user.map(|u| u.login.clone())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommentRecord {
    pub author_association: Option<String>,
    pub body: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub reactions: Reactions,
    pub user: Option<String>,
}

impl From<&ApiComment> for CommentRecord {
    fn from(c: &ApiComment) -> Self {
        Self {
            author_association: c.author_association.clone(),
            body: c.body.clone(),
            created_at: c.created_at,
            updated_at: c.updated_at,
            reactions: reduce_reactions(c.reactions.as_ref()),
            user: login(c.user.as_ref()),
        }
    }
}

/// Head side of a pull request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeadRef {
    pub repo: Option<String>,
    #[serde(rename = "ref")]
    pub ref_name: Option<String>,
}

/// Extended pull-request fields, only fetched in detailed mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PullRequestDetail {
    pub merge_commit_sha: Option<String>,
    pub requested_reviewers: Vec<String>,
    pub head: HeadRef,
    pub base: Option<String>,
    pub merged: Option<bool>,
    pub merged_by: Option<String>,
}

impl From<&ApiPullRequest> for PullRequestDetail {
    fn from(pr: &ApiPullRequest) -> Self {
        Self {
            merge_commit_sha: pr.merge_commit_sha.clone(),
            requested_reviewers: pr.requested_reviewers.iter().map(|u| u.login.clone()).collect(),
            head: HeadRef {
                repo: pr
                    .head
                    .as_ref()
                    .and_then(|h| h.repo.as_ref())
                    .and_then(|r| r.full_name.clone()),
                ref_name: pr.head.as_ref().and_then(|h| h.ref_name.clone()),
            },
            base: pr.base.as_ref().and_then(|b| b.ref_name.clone()),
            merged: pr.merged,
            merged_by: login(pr.merged_by.as_ref()),
        }
    }
}

/// Pull-request specific part of an issue record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PullRequestRecord {
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<PullRequestDetail>,
}

/// Archived issue. Pull requests are issues with `pull_request` set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssueRecord {
    pub number: u64,
    pub active_lock_reason: Option<String>,
    pub assignees: Vec<String>,
    pub author_association: Option<String>,
    pub body: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub draft: Option<bool>,
    pub reactions: Reactions,
    pub labels: Vec<String>,
    pub locked: bool,
    pub state: Option<String>,
    pub title: Option<String>,
    pub user: Option<String>,
    pub comments: Vec<CommentRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestRecord>,
}

impl IssueRecord {
    pub fn from_api(
        issue: &ApiIssue,
        comments: Vec<CommentRecord>,
        detail: Option<PullRequestDetail>,
    ) -> Self {
        Self {
            number: issue.number,
            active_lock_reason: issue.active_lock_reason.clone(),
            assignees: issue.assignees.iter().map(|u| u.login.clone()).collect(),
            author_association: issue.author_association.clone(),
            body: issue.body.clone(),
            closed_at: issue.closed_at,
            created_at: issue.created_at,
            updated_at: issue.updated_at,
            draft: issue.draft,
            reactions: reduce_reactions(issue.reactions.as_ref()),
            labels: issue.labels.iter().filter_map(|l| l.name.clone()).collect(),
            locked: issue.locked,
            state: issue.state.clone(),
            title: issue.title.clone(),
            user: login(issue.user.as_ref()),
            comments,
            pull_request: issue.pull_request.as_ref().map(|pr| PullRequestRecord {
                merged_at: pr.merged_at,
                detail,
            }),
        }
    }

    pub fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetRecord {
    pub content_type: Option<String>,
    pub download_count: Option<u64>,
    pub name: String,
}

impl From<&ApiAsset> for AssetRecord {
    fn from(a: &ApiAsset) -> Self {
        Self {
            content_type: a.content_type.clone(),
            download_count: a.download_count,
            name: a.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseRecord {
    pub id: u64,
    pub tag_name: Option<String>,
    pub name: Option<String>,
    pub is_draft: Option<bool>,
    pub is_prerelease: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub body: Option<String>,
    pub reactions: Reactions,
    pub assets: Vec<AssetRecord>,
}

impl From<&ApiRelease> for ReleaseRecord {
    fn from(r: &ApiRelease) -> Self {
        Self {
            id: r.id,
            tag_name: r.tag_name.clone(),
            name: r.name.clone(),
            is_draft: r.draft,
            is_prerelease: r.prerelease,
            created_at: r.created_at,
            published_at: r.published_at,
            body: r.body.clone(),
            reactions: reduce_reactions(r.reactions.as_ref()),
            assets: r.assets.iter().map(AssetRecord::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardRecord {
    pub id: u64,
    pub note: Option<String>,
    pub archived: bool,
    pub content_url: Option<String>,
    pub creator: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&ApiCard> for CardRecord {
    fn from(c: &ApiCard) -> Self {
        Self {
            id: c.id,
            note: c.note.clone(),
            archived: c.archived,
            content_url: c.content_url.clone(),
            creator: login(c.creator.as_ref()),
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnRecord {
    pub id: u64,
    pub name: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub cards: Vec<CardRecord>,
}

impl ColumnRecord {
    pub fn from_api(column: &ApiColumn, cards: Vec<CardRecord>) -> Self {
        Self {
            id: column.id,
            name: column.name.clone(),
            created_at: column.created_at,
            updated_at: column.updated_at,
            cards,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectRecord {
    pub id: u64,
    pub number: Option<u64>,
    pub name: Option<String>,
    pub body: Option<String>,
    pub state: Option<String>,
    pub creator: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub columns: Vec<ColumnRecord>,
}

impl ProjectRecord {
    pub fn from_api(project: &ApiProject, columns: Vec<ColumnRecord>) -> Self {
        Self {
            id: project.id,
            number: project.number,
            name: project.name.clone(),
            body: project.body.clone(),
            state: project.state.clone(),
            creator: login(project.creator.as_ref()),
            created_at: project.created_at,
            updated_at: project.updated_at,
            columns,
        }
    }
}
