// src/canvas.rs

//! Canvas LMS REST client, the production [`ContentSource`].

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use rand::Rng;
use regex::Regex;
use reqwest::header::{HeaderMap, LINK, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::api::{ByteStream, ContentSource, RemoteError, RemoteItem};
use crate::models::SourceKind;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);
const PER_PAGE: &str = "per_page=100";
const SNIPPET_CHARS: usize = 200;

static NEXT_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<([^>]+)>;\s*rel="next""#).expect("next link regex is valid")
});
static FILE_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/files/(\d+)").expect("file link regex is valid"));

/// Strips whitespace, trailing slashes and an `/api/v1` suffix.
pub fn normalize_base_url(raw: &str) -> String {
    let mut url = raw.trim().trim_end_matches('/').to_string();
    if let Some(stripped) = url.strip_suffix("/api/v1") {
        url = stripped.trim_end_matches('/').to_string();
    }
    url
}

pub struct CanvasClient {
    http: Client,
    base_url: String,
    token: String,
    max_retries: u32,
    backoff: Duration,
    course_ids: Mutex<HashMap<String, u64>>,
}

impl CanvasClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: normalize_base_url(base_url),
            token: token.into(),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_BACKOFF,
            course_ids: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// First retry delay; doubles on every further attempt.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    /// GET with retries on 429, 5xx and transport errors.
    ///
    /// The bearer token is only sent to the Canvas host itself, not to
    /// off-site download URLs.
    async fn send(&self, url: &str) -> Result<Response, RemoteError> {
        let authorize = url.starts_with(&self.base_url);
        let mut attempt = 0;
        loop {
            let mut request = self.http.get(url);
            if authorize {
                request = request.bearer_auth(&self.token);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    if is_retryable(status) && attempt < self.max_retries {
                        let delay = self.retry_delay(attempt, Some(response.headers()));
                        debug!(%url, status = status.as_u16(), attempt, delay_ms = delay.as_millis() as u64, "Retrying request");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    let body = response.text().await.unwrap_or_default();
                    return Err(status_error(status, url, &body));
                }
                Err(e) if attempt < self.max_retries => {
                    let delay = self.retry_delay(attempt, None);
                    debug!(%url, error = %e, attempt, delay_ms = delay.as_millis() as u64, "Retrying after network failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(RemoteError::Unavailable(format!(
                        "network failure for {url}: {e}"
                    )))
                }
            }
        }
    }

    fn retry_delay(&self, attempt: u32, headers: Option<&HeaderMap>) -> Duration {
        let base = headers
            .and_then(|h| h.get(RETRY_AFTER))
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or_else(|| self.backoff.saturating_mul(2u32.saturating_pow(attempt)));
        add_jitter(base)
    }

    async fn get_json(&self, url: &str) -> Result<Value, RemoteError> {
        let response = self.send(url).await?;
        parse_json(response, url).await
    }

    /// Follows `Link: rel="next"` until the last page.
    async fn get_paginated(&self, url: String) -> Result<Vec<Value>, RemoteError> {
        let mut results = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(url);

        while let Some(url) = next.take() {
            if !seen.insert(url.clone()) {
                return Err(RemoteError::Unavailable(format!(
                    "pagination loop detected at {url}"
                )));
            }
            let response = self.send(&url).await?;
            next = next_link(response.headers());
            match parse_json(response, &url).await? {
                Value::Array(items) => results.extend(items),
                other => results.push(other),
            }
        }
        Ok(results)
    }

    /// Numeric references are ids; anything else is matched against the
    /// user's course codes, case-insensitively.
    async fn course_id(&self, course_ref: &str) -> Result<u64, RemoteError> {
        let course_ref = course_ref.trim();
        if let Ok(id) = course_ref.parse::<u64>() {
            return Ok(id);
        }

        let key = course_ref.to_lowercase();
        let cached = self.course_ids.lock().await.get(&key).copied();
        if let Some(id) = cached {
            return Ok(id);
        }

        let courses = self
            .get_paginated(self.api_url(&format!("/courses?{PER_PAGE}")))
            .await?;
        let mut cache = self.course_ids.lock().await;
        for course in &courses {
            if let (Some(id), Some(code)) = (as_id(&course["id"]), non_empty(&course["course_code"])) {
                cache.entry(code.to_lowercase()).or_insert(id);
            }
        }
        cache
            .get(&key)
            .copied()
            .ok_or_else(|| RemoteError::NotFound(format!("no course with code {course_ref}")))
    }

    async fn list_files(&self, course_id: u64) -> Result<Vec<RemoteItem>, RemoteError> {
        let payloads = self
            .get_paginated(self.api_url(&format!("/courses/{course_id}/files?{PER_PAGE}")))
            .await?;
        Ok(payloads.iter().filter_map(file_item).collect())
    }

    /// Files referenced from assignments, discussions or modules, each
    /// resolved through `/files/{id}`.
    async fn list_linked_files(
        &self,
        course_id: u64,
        kind: SourceKind,
    ) -> Result<Vec<RemoteItem>, RemoteError> {
        let listing = match kind {
            SourceKind::Assignments => format!("/courses/{course_id}/assignments?{PER_PAGE}"),
            SourceKind::Discussions => format!("/courses/{course_id}/discussion_topics?{PER_PAGE}"),
            _ => format!("/courses/{course_id}/modules?{PER_PAGE}&include[]=items"),
        };
        let payloads = self.get_paginated(self.api_url(&listing)).await?;

        let mut items = Vec::new();
        for file_id in linked_file_ids(&payloads) {
            match self.get_json(&self.api_url(&format!("/files/{file_id}"))).await {
                Ok(payload) => items.extend(file_item(&payload)),
                Err(e) => debug!(course_id, %kind, file_id, error = %e, "Could not resolve linked file"),
            }
        }
        Ok(items)
    }

    async fn list_pages(&self, course_id: u64) -> Result<Vec<RemoteItem>, RemoteError> {
        let pages = self
            .get_paginated(self.api_url(&format!("/courses/{course_id}/pages?{PER_PAGE}")))
            .await?;

        let mut items = Vec::new();
        for page in &pages {
            let Some(slug) = non_empty(&page["url"]) else {
                continue;
            };
            let detail = match self.page_detail(course_id, slug).await {
                Ok(detail) => detail,
                Err(e) => {
                    debug!(course_id, page = %slug, error = %e, "Could not load page");
                    continue;
                }
            };
            let item = RemoteItem::new(slug, format!("{slug}.html"));
            items.push(match non_empty(&detail["body"]) {
                Some(body) => item.with_size(body.len() as u64),
                None => item.without_content(),
            });
        }
        Ok(items)
    }

    async fn page_detail(&self, course_id: u64, slug: &str) -> Result<Value, RemoteError> {
        self.get_json(&self.api_url(&format!("/courses/{course_id}/pages/{slug}")))
            .await
    }
}

#[async_trait]
impl ContentSource for CanvasClient {
    async fn list_items(
        &self,
        course_ref: &str,
        kind: SourceKind,
    ) -> Result<Vec<RemoteItem>, RemoteError> {
        let course_id = self.course_id(course_ref).await?;
        match kind {
            SourceKind::Files => self.list_files(course_id).await,
            SourceKind::Pages => self.list_pages(course_id).await,
            SourceKind::Assignments | SourceKind::Discussions | SourceKind::Modules => {
                self.list_linked_files(course_id, kind).await
            }
        }
    }

    async fn fetch_item(
        &self,
        course_ref: &str,
        kind: SourceKind,
        remote_id: &str,
    ) -> Result<ByteStream, RemoteError> {
        if kind == SourceKind::Pages {
            let course_id = self.course_id(course_ref).await?;
            let detail = self.page_detail(course_id, remote_id).await?;
            let body = non_empty(&detail["body"])
                .ok_or_else(|| RemoteError::NotFound(format!("page {remote_id} has no body")))?
                .to_string();
            return Ok(stream::iter([Ok(Bytes::from(body))]).boxed());
        }

        let file = self.get_json(&self.api_url(&format!("/files/{remote_id}"))).await?;
        let url = download_url(&file)
            .ok_or_else(|| RemoteError::NotFound(format!("file {remote_id} has no download URL")))?
            .to_string();
        let response = self.send(&url).await?;
        let id = remote_id.to_string();
        Ok(response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(|e| {
                    warn!(item_id = %id, error = %e, "Body stream interrupted");
                    RemoteError::Unavailable(format!("body stream interrupted: {e}"))
                })
            })
            .boxed())
    }

    fn origin(&self) -> Option<String> {
        Some(self.base_url.clone())
    }
}

fn is_retryable(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

fn status_error(status: StatusCode, url: &str, body: &str) -> RemoteError {
    let snippet: String = body.trim().chars().take(SNIPPET_CHARS).collect();
    let detail = if snippet.is_empty() {
        format!("{status} for {url}")
    } else {
        format!("{status} for {url}: {snippet}")
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Forbidden(detail),
        StatusCode::NOT_FOUND => RemoteError::NotFound(detail),
        _ => RemoteError::Unavailable(detail),
    }
}

fn add_jitter(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.0..=0.25);
    delay + delay.mul_f64(factor)
}

async fn parse_json(response: Response, url: &str) -> Result<Value, RemoteError> {
    response
        .json()
        .await
        .map_err(|e| RemoteError::Unavailable(format!("invalid JSON from {url}: {e}")))
}

fn next_link(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| NEXT_LINK.captures(value).map(|c| c[1].to_string()))
}

fn non_empty(value: &Value) -> Option<&str> {
    value.as_str().map(str::trim).filter(|s| !s.is_empty())
}

/// Canvas ids arrive as numbers or as numeric strings.
fn as_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn download_url(file: &Value) -> Option<&str> {
    non_empty(&file["url"]).or_else(|| non_empty(&file["download_url"]))
}

fn file_item(payload: &Value) -> Option<RemoteItem> {
    let id = as_id(&payload["id"])?;
    let name = non_empty(&payload["display_name"])
        .or_else(|| non_empty(&payload["filename"]))
        .map(str::to_string)
        .unwrap_or_else(|| format!("file-{id}"));

    let mut item = RemoteItem::new(id.to_string(), name);
    if let Some(size) = payload["size"].as_u64() {
        item = item.with_size(size);
    }
    if download_url(payload).is_none() {
        item = item.without_content();
    }
    Some(item)
}

/// Every file id the payloads point at, in first-seen order.
fn linked_file_ids(payloads: &[Value]) -> Vec<u64> {
    let mut ids = Vec::new();
    let mut seen = HashSet::new();
    for payload in payloads {
        collect_file_ids(payload, &mut |id| {
            if seen.insert(id) {
                ids.push(id);
            }
        });
    }
    ids
}

fn collect_file_ids(node: &Value, found: &mut impl FnMut(u64)) {
    match node {
        Value::Object(map) => {
            if let Some(Value::Array(attachments)) = map.get("attachments") {
                for id in attachments.iter().filter_map(|a| as_id(&a["id"])) {
                    found(id);
                }
            }
            for key in ["file_id", "attachment_id"] {
                if let Some(id) = map.get(key).and_then(as_id) {
                    found(id);
                }
            }
            // Module items point at their file through content_id.
            if map.get("type").and_then(Value::as_str) == Some("File") {
                if let Some(id) = map.get("content_id").and_then(as_id) {
                    found(id);
                }
            }
            for value in map.values() {
                collect_file_ids(value, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_file_ids(item, found);
            }
        }
        Value::String(text) => {
            for captures in FILE_LINK.captures_iter(text) {
                if let Ok(id) = captures[1].parse() {
                    found(id);
                }
            }
        }
        _ => {}
    }
}
