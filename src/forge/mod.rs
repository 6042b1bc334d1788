use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::pagination::PageWalker;
use crate::quota::{QuotaGate, QuotaState};

pub mod model;

const USER_AGENT: &str = concat!(
    "forge-backup/",
    env!("CARGO_PKG_VERSION"),
    " (+https://github.com/forge-backup/forge-backup)"
);
const API_ACCEPT: &str = "application/vnd.github+json";
const API_VERSION_HEADER: &str = "X-GitHub-Api-Version";
const API_VERSION: &str = "2022-11-28";

/// Chunked body of a binary download.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status}")]
    Status { url: String, status: StatusCode },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid URL {url}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

impl ForgeError {
    /// HTTP status of a rejected request, if that is what this error is.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ForgeError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A response whose body has been read in full.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Raw HTTP access to the origin. Implementations must not interpret status
/// codes on `get`; the client layers quota handling on top.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<ApiResponse, ForgeError>;

    /// Stream a binary resource. Non-2xx is an error.
    async fn download(&self, url: &str) -> Result<ByteStream, ForgeError>;
}

/// reqwest-backed transport for the origin's REST API.
#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    token: Option<String>,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("authenticated", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn new(token: Option<String>) -> Result<Self, reqwest::Error> {
        let http = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { http, token })
    }

    pub fn build_request(&self, url: &str) -> Result<reqwest::Request, ForgeError> {
        let parsed = Url::parse(url).map_err(|source| ForgeError::Url {
            url: url.to_string(),
            source,
        })?;
        let mut req = self
            .http
            .get(parsed)
            .header(ACCEPT, HeaderValue::from_static(API_ACCEPT))
            .header(API_VERSION_HEADER, API_VERSION);
        if let Some(token) = &self.token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        req.build().map_err(|source| ForgeError::Transport {
            url: url.to_string(),
            source,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<ApiResponse, ForgeError> {
        let request = self.build_request(url)?;
        let transport_err = |source| ForgeError::Transport {
            url: url.to_string(),
            source,
        };
        let res = self.http.execute(request).await.map_err(transport_err)?;
        let status = res.status();
        let headers = res.headers().clone();
        let body = res.bytes().await.map_err(transport_err)?;
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    async fn download(&self, url: &str) -> Result<ByteStream, ForgeError> {
        // Asset URLs redirect to a CDN; they are not API calls and carry no credential.
        let res = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| ForgeError::Transport {
                url: url.to_string(),
                source,
            })?;
        if !res.status().is_success() {
            return Err(ForgeError::Status {
                url: url.to_string(),
                status: res.status(),
            });
        }
        let stream = res
            .bytes_stream()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err));
        Ok(Box::pin(stream))
    }
}

/// Quota-aware API client: one request at a time, each gated on the quota
/// the previous response reported.
#[derive(Clone)]
pub struct ForgeClient {
    transport: Arc<dyn Transport>,
    gate: QuotaGate,
    api_base: Url,
}

impl fmt::Debug for ForgeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForgeClient")
            .field("api_base", &self.api_base)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl ForgeClient {
    pub fn new(transport: Arc<dyn Transport>, gate: QuotaGate, api_base: Url) -> Self {
        Self {
            transport,
            gate,
            api_base,
        }
    }

    /// Resolve an API path (e.g. `repos/o/n/issues`) against the base URL.
    pub fn endpoint(&self, path: &str) -> Result<Url, ForgeError> {
        self.api_base.join(path).map_err(|source| ForgeError::Url {
            url: path.to_string(),
            source,
        })
    }

    /// GET `url`, transparently waiting out an exhausted quota. Non-2xx
    /// responses other than quota rejections become `ForgeError::Status`.
    pub async fn get(&self, url: &str) -> Result<ApiResponse, ForgeError> {
        loop {
            debug!(url, "HTTP GET");
            let res = self.transport.get(url).await?;
            let quota = QuotaState::from_headers(&res.headers);

            if QuotaGate::is_exceeded(res.status, quota.as_ref()) {
                warn!(url, status = %res.status, "quota exceeded; retrying after reset");
                self.gate.wait_for_reset(quota.as_ref()).await;
                continue;
            }

            self.gate.wait(quota.as_ref()).await;

            if !res.status.is_success() {
                return Err(ForgeError::Status {
                    url: url.to_string(),
                    status: res.status,
                });
            }
            return Ok(res);
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ForgeError> {
        let res = self.get(url).await?;
        serde_json::from_slice(&res.body).map_err(|source| ForgeError::Decode {
            url: url.to_string(),
            source,
        })
    }

    /// Start a fresh page walk at `url`.
    pub fn pages<T: DeserializeOwned>(&self, url: impl Into<String>) -> PageWalker<'_, T> {
        PageWalker::new(self, url)
    }

    /// Stream a binary asset. Downloads bypass the API quota.
    pub async fn download(&self, url: &str) -> Result<ByteStream, ForgeError> {
        debug!(url, "downloading");
        self.transport.download(url).await
    }
}
