//! Link-header driven page walking.
//!
//! The origin paginates list endpoints and advertises the following page in
//! a `Link` header: `<https://..&page=2>; rel="next", <https://..&page=9>; rel="last"`.
//! A walk ends when no `next` relation can be found, including when the
//! header is absent or unparsable.

use futures::{stream, Stream, TryStreamExt};
use reqwest::header::{HeaderMap, LINK};
use reqwest::Url;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;

use crate::forge::{ForgeClient, ForgeError};

/// Largest page the origin serves. Quota is spent per request, not per byte.
pub const PAGE_SIZE: u32 = 100;

/// Find the `rel="next"` target in a `Link` header value.
pub fn parse_next(link_header: &str) -> Option<String> {
    for part in link_header.split(',') {
        let mut url = None;
        let mut is_next = false;

        for segment in part.split(';') {
            let segment = segment.trim();
            if segment.starts_with('<') && segment.ends_with('>') && segment.len() >= 2 {
                url = Some(&segment[1..segment.len() - 1]);
            } else if let Some(rel) = segment.strip_prefix("rel=") {
                is_next = rel.trim_matches('"') == "next";
            }
        }

        if let (Some(url), true) = (url, is_next) {
            if !url.is_empty() {
                return Some(url.to_string());
            }
        }
    }
    None
}

/// `next` continuation from response headers, if any.
pub fn next_link(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(LINK)?.to_str().ok()?;
    parse_next(raw)
}

/// Set `per_page` to [`PAGE_SIZE`] on an endpoint URL, replacing any existing value.
pub fn with_page_size(url: &str) -> Result<String, ForgeError> {
    let mut parsed = Url::parse(url).map_err(|source| ForgeError::Url {
        url: url.to_string(),
        source,
    })?;
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| k != "per_page")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut pairs = parsed.query_pairs_mut();
        pairs.clear();
        pairs.append_pair("per_page", &PAGE_SIZE.to_string());
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
    }
    Ok(parsed.into())
}

/// One walk over a paginated listing. Each `next_page` call issues at most
/// one request; a new walk needs a new `PageWalker`.
pub struct PageWalker<'c, T> {
    client: &'c ForgeClient,
    next: Option<String>,
    pages: usize,
    _item: PhantomData<fn() -> T>,
}

impl<'c, T: DeserializeOwned> PageWalker<'c, T> {
    pub fn new(client: &'c ForgeClient, url: impl Into<String>) -> Self {
        Self {
            client,
            next: Some(url.into()),
            pages: 0,
            _item: PhantomData,
        }
    }

    /// Fetch the next page, or `None` once the walk is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<T>>, ForgeError> {
        let Some(url) = self.next.take() else {
            return Ok(None);
        };
        let res = self.client.get(&url).await?;
        let items: Vec<T> = serde_json::from_slice(&res.body)
            .map_err(|source| ForgeError::Decode { url: url.clone(), source })?;
        self.next = next_link(&res.headers);
        self.pages += 1;
        Ok(Some(items))
    }

    pub fn is_exhausted(&self) -> bool {
        self.next.is_none()
    }

    /// Requests issued so far.
    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    /// Drain every remaining page into one list.
    pub async fn collect_all(mut self) -> Result<Vec<T>, ForgeError> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }

    /// Items in page order, fetching lazily as the stream is polled.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, ForgeError>> + 'c
    where
        T: 'c,
    {
        stream::try_unfold(self, |mut walker| async move {
            let page = walker.next_page().await?;
            Ok::<_, ForgeError>(
                page.map(|items| (stream::iter(items.into_iter().map(Ok::<T, ForgeError>)), walker)),
            )
        })
        .try_flatten()
    }
}
