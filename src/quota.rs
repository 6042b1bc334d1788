//! Request quota tracking driven by the origin's rate-limit headers.
//!
//! The gate never runs a background timer: callers hand it the quota they
//! just observed and it sleeps in-line when the next request has to wait.

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::info;

pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// Slack added after the reported reset instant to absorb clock skew.
pub const RESET_MARGIN: Duration = Duration::from_secs(10);

/// Quota counters reported by a single response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaState {
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

impl QuotaState {
    /// Read the counters from response headers. Missing or malformed headers
    /// yield `None`, which callers treat as an unconstrained quota.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let remaining = header_number(headers, REMAINING_HEADER)?;
        let reset = header_number(headers, RESET_HEADER)?;
        let reset_at = DateTime::from_timestamp(i64::try_from(reset).ok()?, 0)?;
        Some(Self { remaining, reset_at })
    }
}

fn header_number(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Decides whether the next request may go out now or has to wait for reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaGate {
    reserve: u64,
    margin: Duration,
}

impl Default for QuotaGate {
    fn default() -> Self {
        Self::new(0)
    }
}

impl QuotaGate {
    pub fn new(reserve: u64) -> Self {
        Self {
            reserve,
            margin: RESET_MARGIN,
        }
    }

    pub fn with_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    /// How long to hold the next request, or `None` to proceed immediately.
    pub fn delay(&self, observed: Option<&QuotaState>, now: DateTime<Utc>) -> Option<Duration> {
        let state = observed?;
        if state.remaining > self.reserve {
            return None;
        }
        let margin = chrono::Duration::from_std(self.margin).unwrap_or_else(|_| chrono::Duration::zero());
        // a reset beyond chrono's range is malformed metadata
        let resume_at = state.reset_at.checked_add_signed(margin)?;
        Some((resume_at - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// A response rejected because the quota was already spent. Its body is
    /// not the requested resource and the request has to be repeated.
    pub fn is_exceeded(status: StatusCode, observed: Option<&QuotaState>) -> bool {
        matches!(
            status,
            StatusCode::FORBIDDEN | StatusCode::PRECONDITION_REQUIRED | StatusCode::TOO_MANY_REQUESTS
        )
            && observed.is_some_and(|q| q.remaining == 0)
    }

    /// Sleep until the quota allows another request.
    pub async fn wait(&self, observed: Option<&QuotaState>) {
        if let Some(delay) = self.delay(observed, Utc::now()) {
            self.sleep(delay, observed).await;
        }
    }

    /// Sleep after a rejected request. Waits at least the margin even when
    /// the local clock already believes the reset has passed.
    pub async fn wait_for_reset(&self, observed: Option<&QuotaState>) {
        let delay = self
            .delay(observed, Utc::now())
            .unwrap_or(Duration::ZERO)
            .max(self.margin);
        self.sleep(delay, observed).await;
    }

    async fn sleep(&self, delay: Duration, observed: Option<&QuotaState>) {
        info!(
            wait_secs = delay.as_secs(),
            remaining = observed.map(|q| q.remaining),
            reserve = self.reserve,
            "quota exhausted; waiting for reset (~{} min)",
            delay.as_secs() / 60
        );
        tokio::time::sleep(delay).await;
    }
}
