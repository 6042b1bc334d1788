use async_compression::tokio::bufread::GzipDecoder;
use bytes::Bytes;
use forge_backup::config::{BackupOptions, Features};
use forge_backup::fleet;
use forge_backup::forge::{ApiResponse, ByteStream, ForgeClient, ForgeError, Transport};
use forge_backup::git::{MirrorAction, MirrorSync, MirrorVariant, SyncFlags, SyncOutcome};
use forge_backup::model::RepoTarget;
use forge_backup::pipeline::Pipeline;
use forge_backup::quota::QuotaGate;
use forge_backup::state::{self, Watermark};
use reqwest::header::{HeaderMap, HeaderValue, LINK};
use reqwest::{StatusCode, Url};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncReadExt, BufReader};
use tokio::sync::Mutex;

const API: &str = "https://api.test/";

/// Serves canned responses by exact URL, falling back to the URL without its
/// query string, and 404 for anything unknown. Records every call.
#[derive(Clone)]
struct Route {
    status: StatusCode,
    body: String,
    next: Option<String>,
}

#[derive(Default)]
struct RecordingTransport {
    routes: Mutex<HashMap<String, Route>>,
    assets: Mutex<HashMap<String, Vec<u8>>>,
    calls: Mutex<Vec<String>>,
    downloads: Mutex<Vec<String>>,
}

impl RecordingTransport {
    async fn route(&self, path: &str, body: Value) {
        self.route_status(path, StatusCode::OK, body).await;
    }

    async fn route_status(&self, path: &str, status: StatusCode, body: Value) {
        self.insert(path, Route { status, body: body.to_string(), next: None }).await;
    }

    /// One page of a listing whose `Link` header points at `next`.
    async fn route_page(&self, path: &str, body: Value, next: &str) {
        let next = Some(format!("{}{}", API, next));
        self.insert(path, Route { status: StatusCode::OK, body: body.to_string(), next }).await;
    }

    async fn insert(&self, path: &str, route: Route) {
        self.routes.lock().await.insert(format!("{}{}", API, path), route);
    }

    async fn asset(&self, url: &str, content: &[u8]) {
        self.assets.lock().await.insert(url.to_string(), content.to_vec());
    }

    async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    async fn downloads(&self) -> Vec<String> {
        self.downloads.lock().await.clone()
    }

    async fn reset_log(&self) {
        self.calls.lock().await.clear();
        self.downloads.lock().await.clear();
    }
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    async fn get(&self, url: &str) -> Result<ApiResponse, ForgeError> {
        self.calls.lock().await.push(url.to_string());
        let routes = self.routes.lock().await;
        let bare = url.split('?').next().unwrap_or(url);
        let route = routes.get(url).or_else(|| routes.get(bare)).cloned().unwrap_or(Route {
            status: StatusCode::NOT_FOUND,
            body: r#"{"message":"Not Found"}"#.to_string(),
            next: None,
        });
        let mut headers = HeaderMap::new();
        if let Some(next) = route.next {
            let link = format!("<{}>; rel=\"next\"", next);
            headers.insert(LINK, HeaderValue::from_str(&link).unwrap());
        }
        Ok(ApiResponse {
            status: route.status,
            headers,
            body: Bytes::from(route.body),
        })
    }

    async fn download(&self, url: &str) -> Result<ByteStream, ForgeError> {
        self.downloads.lock().await.push(url.to_string());
        match self.assets.lock().await.get(url) {
            Some(content) => {
                let chunks: Vec<std::io::Result<Bytes>> = content
                    .chunks(3)
                    .map(|c| Ok(Bytes::copy_from_slice(c)))
                    .collect();
                Ok(Box::pin(futures::stream::iter(chunks)))
            }
            None => Err(ForgeError::Status {
                url: url.to_string(),
                status: StatusCode::NOT_FOUND,
            }),
        }
    }
}

#[derive(Default)]
struct RecordingMirror {
    syncs: Mutex<Vec<(String, MirrorVariant, SyncFlags)>>,
}

#[async_trait::async_trait]
impl MirrorSync for RecordingMirror {
    async fn sync(
        &self,
        target: &RepoTarget,
        _target_dir: &Path,
        variant: MirrorVariant,
        flags: SyncFlags,
    ) -> SyncOutcome {
        self.syncs.lock().await.push((target.to_string(), variant, flags));
        SyncOutcome {
            action: MirrorAction::Clone,
            succeeded: true,
        }
    }
}

struct Harness {
    root: TempDir,
    transport: Arc<RecordingTransport>,
    client: ForgeClient,
    mirror: RecordingMirror,
}

impl Harness {
    fn new() -> Self {
        let transport = Arc::new(RecordingTransport::default());
        let client = ForgeClient::new(transport.clone(), QuotaGate::new(0), Url::parse(API).unwrap());
        Self {
            root: tempdir().unwrap(),
            transport,
            client,
            mirror: RecordingMirror::default(),
        }
    }

    fn options(&self, gzip: bool, features: Features) -> BackupOptions {
        BackupOptions {
            root: self.root.path().to_path_buf(),
            gzip,
            features,
            since: None,
        }
    }

    fn repo_dir(&self) -> PathBuf {
        target().dir(self.root.path())
    }
}

fn target() -> RepoTarget {
    RepoTarget::new("octo", "hello")
}

fn mark(raw: &str) -> Watermark {
    Watermark::parse(raw).unwrap()
}

fn issue(number: u64, comments: u64, pull_request: bool) -> Value {
    let mut v = json!({
        "number": number,
        "title": format!("issue {}", number),
        "state": "open",
        "locked": false,
        "user": { "login": "alice" },
        "labels": [{ "name": "bug" }],
        "assignees": null,
        "reactions": { "total_count": 1, "+1": 1, "heart": 0 },
        "comments": comments,
        "comments_url": format!("{}repos/octo/hello/issues/{}/comments", API, number),
    });
    if pull_request {
        v["pull_request"] = json!({
            "url": format!("{}repos/octo/hello/pulls/{}", API, number),
            "merged_at": "2024-02-01T10:00:00Z",
        });
    }
    v
}

fn read_json(path: &Path) -> Value {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

async fn gunzip(path: &Path) -> Vec<u8> {
    let file = tokio::fs::File::open(path).await.unwrap();
    let mut decoder = GzipDecoder::new(BufReader::new(file));
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).await.unwrap();
    out
}

async fn seed_issues(t: &RecordingTransport) {
    t.route(
        "repos/octo/hello/issues",
        json!([issue(1, 0, false), issue(2, 2, true), issue(3, 0, false)]),
    )
    .await;
    t.route(
        "repos/octo/hello/issues/2/comments",
        json!([
            { "body": "first", "user": { "login": "bob" }, "author_association": "MEMBER" },
            { "body": "second", "user": { "login": "carol" }, "reactions": { "laugh": 2 } }
        ]),
    )
    .await;
}

async fn seed_releases(t: &RecordingTransport) {
    t.route(
        "repos/octo/hello/releases",
        json!([
            { "id": 111, "tag_name": "v1.0.0", "assets": [] },
            {
                "id": 222,
                "tag_name": "v2.0.0",
                "assets": [
                    {
                        "name": "dist.zip",
                        "content_type": "application/zip",
                        "download_count": 4,
                        "browser_download_url": "https://dl.test/222/dist.zip"
                    },
                    {
                        "name": "readme.txt",
                        "content_type": "text/plain",
                        "download_count": 9,
                        "browser_download_url": "https://dl.test/222/readme.txt"
                    }
                ]
            }
        ]),
    )
    .await;
    t.asset("https://dl.test/222/dist.zip", b"PK\x03\x04 zipped bytes").await;
    t.asset("https://dl.test/222/readme.txt", b"read me, please").await;
}

#[tokio::test]
async fn full_run_archives_issues_and_commits_watermark() {
    let h = Harness::new();
    seed_issues(&h.transport).await;
    let options = h.options(false, Features::default());
    let pipeline = Pipeline::new(&h.client, &h.mirror, &options);

    let started = mark("2024-03-01T12:00:00Z");
    let report = pipeline.run_at(&target(), started).await.unwrap();
    assert_eq!(report.issues, 3);
    assert_eq!(report.pull_requests, 1);
    assert_eq!(report.since, None);

    let calls = h.transport.calls().await;
    assert_eq!(
        calls,
        vec![
            format!("{}repos/octo/hello/issues?per_page=100&state=all", API),
            format!("{}repos/octo/hello/issues/2/comments?per_page=100", API),
        ]
    );

    let issues_dir = h.repo_dir().join("issues");
    for n in 1..=3 {
        assert!(issues_dir.join(format!("{}.json", n)).is_file());
    }
    let plain = read_json(&issues_dir.join("1.json"));
    assert_eq!(plain["comments"], json!([]));
    assert_eq!(plain["labels"], json!(["bug"]));
    assert_eq!(plain["reactions"], json!({ "+1": 1 }));
    assert!(plain.get("pull_request").is_none());

    let pr = read_json(&issues_dir.join("2.json"));
    assert_eq!(pr["comments"].as_array().unwrap().len(), 2);
    assert_eq!(pr["comments"][1]["user"], "carol");
    assert_eq!(pr["comments"][1]["reactions"], json!({ "laugh": 2 }));
    assert_eq!(pr["pull_request"]["merged_at"], "2024-02-01T10:00:00Z");

    assert_eq!(state::load(&h.repo_dir()).await, Some(started));
    let syncs = h.mirror.syncs.lock().await.clone();
    assert_eq!(syncs.len(), 1);
    assert_eq!(syncs[0].1, MirrorVariant::Main);
}

#[tokio::test]
async fn comments_are_walked_across_every_page() {
    let h = Harness::new();
    h.transport
        .route("repos/octo/hello/issues", json!([issue(5, 3, false)]))
        .await;
    h.transport
        .route_page(
            "repos/octo/hello/issues/5/comments?per_page=100",
            json!([{ "body": "one" }, { "body": "two" }]),
            "repos/octo/hello/issues/5/comments?per_page=100&page=2",
        )
        .await;
    h.transport
        .route(
            "repos/octo/hello/issues/5/comments?per_page=100&page=2",
            json!([{ "body": "three" }]),
        )
        .await;

    let options = h.options(false, Features::default());
    let pipeline = Pipeline::new(&h.client, &h.mirror, &options);
    pipeline.run(&target()).await.unwrap();

    let calls = h.transport.calls().await;
    assert_eq!(
        calls[1..],
        [
            format!("{}repos/octo/hello/issues/5/comments?per_page=100", API),
            format!("{}repos/octo/hello/issues/5/comments?per_page=100&page=2", API),
        ]
    );
    let record = read_json(&h.repo_dir().join("issues/5.json"));
    let bodies: Vec<&str> = record["comments"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["body"].as_str().unwrap())
        .collect();
    assert_eq!(bodies, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn incremental_run_filters_by_previous_watermark() {
    let h = Harness::new();
    seed_issues(&h.transport).await;
    std::fs::create_dir_all(h.repo_dir()).unwrap();
    state::commit(&h.repo_dir(), mark("2024-01-01T00:00:00Z")).await.unwrap();

    let options = h.options(false, Features::default());
    let pipeline = Pipeline::new(&h.client, &h.mirror, &options);
    let report = pipeline
        .run_at(&target(), mark("2024-03-01T12:00:00Z"))
        .await
        .unwrap();
    assert_eq!(report.since, Some(mark("2024-01-01T00:00:00Z")));

    let calls = h.transport.calls().await;
    assert!(calls[0].contains("since=2024-01-01T00%3A00%3A00Z"), "{}", calls[0]);
    assert_eq!(state::load(&h.repo_dir()).await, Some(mark("2024-03-01T12:00:00Z")));
}

#[tokio::test]
async fn explicit_since_wins_and_is_not_persisted_until_success() {
    let h = Harness::new();
    seed_issues(&h.transport).await;
    let mut options = h.options(false, Features::default());
    options.since = Some(mark("2020-05-05T05:05:05Z"));
    let pipeline = Pipeline::new(&h.client, &h.mirror, &options);
    pipeline.run_at(&target(), mark("2024-03-01T12:00:00Z")).await.unwrap();

    let calls = h.transport.calls().await;
    assert!(calls[0].contains("since=2020-05-05T05%3A05%3A05Z"));
    assert_eq!(state::load(&h.repo_dir()).await, Some(mark("2024-03-01T12:00:00Z")));
}

#[tokio::test]
async fn failed_run_keeps_previous_watermark() {
    let h = Harness::new();
    seed_issues(&h.transport).await;
    let options = h.options(false, Features::default());
    let pipeline = Pipeline::new(&h.client, &h.mirror, &options);

    let t0 = mark("2024-03-01T12:00:00Z");
    pipeline.run_at(&target(), t0).await.unwrap();

    h.transport
        .route_status(
            "repos/octo/hello/issues/2/comments",
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "message": "boom" }),
        )
        .await;
    let err = pipeline
        .run_at(&target(), mark("2024-03-02T12:00:00Z"))
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("500"));
    assert_eq!(state::load(&h.repo_dir()).await, Some(t0));

    seed_issues(&h.transport).await;
    let t1 = mark("2024-03-03T12:00:00Z");
    pipeline.run_at(&target(), t1).await.unwrap();
    assert_eq!(state::load(&h.repo_dir()).await, Some(t1));
}

#[tokio::test]
async fn detailed_prs_fetches_pull_request_detail() {
    let h = Harness::new();
    seed_issues(&h.transport).await;
    h.transport
        .route(
            "repos/octo/hello/pulls/2",
            json!({
                "merge_commit_sha": "abc123",
                "requested_reviewers": [{ "login": "dave" }],
                "head": { "ref": "feature", "repo": { "full_name": "fork/hello" } },
                "base": { "ref": "main" },
                "merged": true,
                "merged_by": { "login": "erin" }
            }),
        )
        .await;
    let options = h.options(false, Features { detailed_prs: true, ..Default::default() });
    let pipeline = Pipeline::new(&h.client, &h.mirror, &options);
    pipeline.run(&target()).await.unwrap();

    let calls = h.transport.calls().await;
    assert_eq!(
        calls.iter().filter(|c| c.contains("/pulls/")).count(),
        1,
        "only the pull request gets a detail request"
    );
    let pr = read_json(&h.repo_dir().join("issues/2.json"));
    let detail = &pr["pull_request"]["detail"];
    assert_eq!(detail["merge_commit_sha"], "abc123");
    assert_eq!(detail["head"]["ref"], "feature");
    assert_eq!(detail["head"]["repo"], "fork/hello");
    assert_eq!(detail["merged_by"], "erin");
}

#[tokio::test]
async fn gzip_appends_suffix_to_records() {
    let h = Harness::new();
    seed_issues(&h.transport).await;
    let options = h.options(true, Features::default());
    let pipeline = Pipeline::new(&h.client, &h.mirror, &options);
    pipeline.run(&target()).await.unwrap();

    let issues_dir = h.repo_dir().join("issues");
    assert!(issues_dir.join("3.json.gz").is_file());
    assert!(!issues_dir.join("3.json").exists());
    let decoded: Value = serde_json::from_slice(&gunzip(&issues_dir.join("2.json.gz")).await).unwrap();
    assert_eq!(decoded["number"], 2);
    // the state file is never compressed
    assert!(h.repo_dir().join(state::STATE_FILE).is_file());
}

#[tokio::test]
async fn archived_releases_are_skipped_without_requests() {
    let h = Harness::new();
    h.transport.route("repos/octo/hello/issues", json!([])).await;
    seed_releases(&h.transport).await;
    std::fs::create_dir_all(h.repo_dir().join("releases/111")).unwrap();

    let options = h.options(true, Features { releases: true, ..Default::default() });
    let pipeline = Pipeline::new(&h.client, &h.mirror, &options);
    let report = pipeline.run(&target()).await.unwrap();
    assert_eq!(report.releases_written, 1);
    assert_eq!(report.releases_skipped, 1);
    assert_eq!(report.assets, 2);

    assert_eq!(
        h.transport.downloads().await,
        vec!["https://dl.test/222/dist.zip".to_string(), "https://dl.test/222/readme.txt".to_string()]
    );
    assert!(!h.transport.calls().await.iter().any(|c| c.contains("111")));
    assert_eq!(std::fs::read_dir(h.repo_dir().join("releases/111")).unwrap().count(), 0);

    let rel = h.repo_dir().join("releases/222");
    let record: Value = serde_json::from_slice(&gunzip(&rel.join("release.json.gz")).await).unwrap();
    assert_eq!(record["tag_name"], "v2.0.0");
    assert_eq!(record["assets"][1]["download_count"], 9);

    // already-compressed content is stored verbatim even with gzip on
    assert_eq!(std::fs::read(rel.join("dist.zip")).unwrap(), b"PK\x03\x04 zipped bytes");
    assert!(!rel.join("dist.zip.gz").exists());
    assert_eq!(gunzip(&rel.join("readme.txt.gz")).await, b"read me, please");
    assert!(!rel.join("readme.txt").exists());

    h.transport.reset_log().await;
    let again = pipeline.run(&target()).await.unwrap();
    assert_eq!(again.releases_written, 0);
    assert_eq!(again.releases_skipped, 2);
    assert!(h.transport.downloads().await.is_empty());
}

#[tokio::test]
async fn unavailable_projects_are_skipped_and_watermark_still_advances() {
    let h = Harness::new();
    h.transport.route("repos/octo/hello/issues", json!([])).await;
    // projects are not routed, so the listing answers 404
    let options = h.options(false, Features { projects: true, wiki: true, ..Default::default() });
    let pipeline = Pipeline::new(&h.client, &h.mirror, &options);

    let started = mark("2024-04-01T00:00:00Z");
    let report = pipeline.run_at(&target(), started).await.unwrap();
    assert!(report.projects_unavailable);
    assert_eq!(report.projects, 0);
    assert!(!h.repo_dir().join("projects").exists());
    assert_eq!(state::load(&h.repo_dir()).await, Some(started));

    let variants: Vec<MirrorVariant> = h.mirror.syncs.lock().await.iter().map(|s| s.1).collect();
    assert_eq!(variants, vec![MirrorVariant::Main, MirrorVariant::Wiki]);
}

#[tokio::test]
async fn projects_archive_columns_and_cards() {
    let h = Harness::new();
    h.transport.route("repos/octo/hello/issues", json!([])).await;
    h.transport
        .route(
            "repos/octo/hello/projects",
            json!([{
                "id": 7,
                "name": "Roadmap",
                "state": "open",
                "columns_url": format!("{}projects/7/columns", API)
            }]),
        )
        .await;
    h.transport
        .route(
            "projects/7/columns",
            json!([{ "id": 70, "name": "Todo", "cards_url": format!("{}projects/columns/70/cards", API) }]),
        )
        .await;
    h.transport
        .route(
            "projects/columns/70/cards",
            json!([{ "id": 700, "note": "ship it", "archived": false, "creator": { "login": "alice" } }]),
        )
        .await;

    let options = h.options(false, Features { projects: true, ..Default::default() });
    let pipeline = Pipeline::new(&h.client, &h.mirror, &options);
    let report = pipeline.run(&target()).await.unwrap();
    assert_eq!(report.projects, 1);
    assert!(!report.projects_unavailable);

    let project = read_json(&h.repo_dir().join("projects/7.json"));
    assert_eq!(project["name"], "Roadmap");
    assert_eq!(project["columns"][0]["name"], "Todo");
    assert_eq!(project["columns"][0]["cards"][0]["note"], "ship it");
}

#[tokio::test]
async fn fleet_continues_past_a_failing_repository() {
    let h = Harness::new();
    h.transport
        .route(
            "users/octo/repos",
            json!([
                { "name": "broken", "owner": { "login": "octo" }, "fork": false },
                { "name": "hello", "owner": { "login": "octo" }, "fork": false },
                { "name": "copy", "owner": { "login": "octo" }, "fork": true }
            ]),
        )
        .await;
    seed_issues(&h.transport).await;
    // no issues route for octo/broken, so its first phase fails with 404

    let options = h.options(false, Features::default());
    let pipeline = Pipeline::new(&h.client, &h.mirror, &options);
    let report = fleet::run(&pipeline, &h.client, "octo").await.unwrap();

    assert_eq!(report.failed, vec![RepoTarget::new("octo", "broken")]);
    assert_eq!(report.succeeded, vec![target()]);
    assert!(state::load(&h.repo_dir()).await.is_some());
    assert!(state::load(&RepoTarget::new("octo", "broken").dir(h.root.path())).await.is_none());
}
