//! Payload shapes returned by the origin's REST API. Only the fields the
//! archive keeps are modelled; everything else is ignored on decode.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// `null` and a missing key both become an empty list.
fn nullable_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Deserialize, Debug, Clone)]
pub struct ApiUser {
    pub login: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ApiLabel {
    pub name: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ApiIssue {
    pub number: u64,
    pub title: Option<String>,
    pub body: Option<String>,
    pub state: Option<String>,
    #[serde(default)]
    pub locked: bool,
    pub active_lock_reason: Option<String>,
    pub author_association: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub draft: Option<bool>,
    #[serde(default, deserialize_with = "nullable_vec")]
    pub assignees: Vec<ApiUser>,
    #[serde(default, deserialize_with = "nullable_vec")]
    pub labels: Vec<ApiLabel>,
    pub user: Option<ApiUser>,
    pub reactions: Option<Value>,
    /// Comment count, not the comments themselves.
    #[serde(default)]
    pub comments: u64,
    pub comments_url: Option<String>,
    pub pull_request: Option<ApiIssuePullRequest>,
}

/// Marker object present on issues that are pull requests.
#[derive(Deserialize, Debug, Clone)]
pub struct ApiIssuePullRequest {
    pub url: Option<String>,
    pub merged_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ApiComment {
    pub author_association: Option<String>,
    pub body: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub reactions: Option<Value>,
    pub user: Option<ApiUser>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ApiPullRequest {
    pub merge_commit_sha: Option<String>,
    #[serde(default, deserialize_with = "nullable_vec")]
    pub requested_reviewers: Vec<ApiUser>,
    pub head: Option<ApiBranch>,
    pub base: Option<ApiBranch>,
    pub merged: Option<bool>,
    pub merged_by: Option<ApiUser>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ApiBranch {
    #[serde(rename = "ref")]
    pub ref_name: Option<String>,
    pub repo: Option<ApiRepoRef>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ApiRepoRef {
    pub full_name: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ApiRelease {
    pub id: u64,
    pub tag_name: Option<String>,
    pub name: Option<String>,
    pub draft: Option<bool>,
    pub prerelease: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub body: Option<String>,
    pub reactions: Option<Value>,
    #[serde(default, deserialize_with = "nullable_vec")]
    pub assets: Vec<ApiAsset>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ApiAsset {
    pub name: String,
    pub content_type: Option<String>,
    pub download_count: Option<u64>,
    pub browser_download_url: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ApiProject {
    pub id: u64,
    pub number: Option<u64>,
    pub name: Option<String>,
    pub body: Option<String>,
    pub state: Option<String>,
    pub creator: Option<ApiUser>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub columns_url: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ApiColumn {
    pub id: u64,
    pub name: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub cards_url: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ApiCard {
    pub id: u64,
    pub note: Option<String>,
    #[serde(default)]
    pub archived: bool,
    pub content_url: Option<String>,
    pub creator: Option<ApiUser>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ApiRepository {
    pub name: String,
    pub owner: ApiUser,
    #[serde(default)]
    pub fork: bool,
}
