use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::{HeaderMap, CONTENT_TYPE, COOKIE, SET_COOKIE, USER_AGENT};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://www.newsblur.com/";
pub const SESSION_COOKIE: &str = "newsblur_sessionid";

pub type FeedId = i64;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("newsblur: unauthorized")]
    Unauthorized,
    #[error("newsblur: forbidden")]
    Forbidden,
    #[error("newsblur: not found: {0}")]
    NotFound(String),
    #[error("newsblur: rate limited: {0}")]
    RateLimited(String),
    #[error("newsblur: api error {status}: {body}")]
    Status { status: u16, body: String },
    #[error("newsblur: login rejected: {0}")]
    LoginRejected(String),
    #[error("newsblur: login response carried no session cookie")]
    MissingSession,
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub base_url: Option<String>,
    pub timeout: Option<Duration>,
    pub session_cookie: Option<String>,
    pub http_client: Option<HttpClient>,
}

/// Parameters of the similar-stories search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverQuery {
    pub similar_to_story_hash: String,
    /// Empty means an unscoped (global) search.
    pub feed_ids: Vec<FeedId>,
    pub page: u32,
}

impl DiscoverQuery {
    fn into_params(self) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = self
            .feed_ids
            .into_iter()
            .map(|id| ("feed_ids".to_string(), id.to_string()))
            .collect();
        params.push(("page".into(), self.page.to_string()));
        params
    }
}

pub struct Client {
    http: HttpClient,
    user_agent: String,
    base_url: Url,
    session: RwLock<Option<String>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.user_agent.trim().is_empty() {
            bail!("newsblur client user agent required");
        }
        let base = config
            .base_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = Url::parse(&base).with_context(|| format!("newsblur: parse base url {base}"))?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(20)))
                .build()?,
        };

        Ok(Client {
            http,
            user_agent: config.user_agent,
            base_url,
            session: RwLock::new(config.session_cookie),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn session_cookie(&self) -> Option<String> {
        self.session.read().clone()
    }

    pub fn set_session_cookie(&self, cookie: Option<String>) {
        *self.session.write() = cookie;
    }

    /// Logs in and keeps the returned session cookie for later calls.
    pub fn login(&self, username: &str, password: &str) -> Result<String> {
        if username.trim().is_empty() {
            bail!("newsblur: username is required");
        }
        let form = vec![
            ("username".to_string(), username.trim().to_string()),
            ("password".to_string(), password.to_string()),
        ];
        let resp = self.request(Method::POST, "/api/login", &[], Some(form))?;
        let cookie = session_cookie_from(resp.headers());
        let payload: CodeResponse = resp.json().context("newsblur: decode login response")?;
        if payload.code != 1 {
            bail!(ApiError::LoginRejected(payload.message()));
        }
        let cookie = cookie.ok_or(ApiError::MissingSession)?;
        self.set_session_cookie(Some(cookie.clone()));
        tracing::info!(username, "logged in");
        Ok(cookie)
    }

    pub fn logout(&self) -> Result<()> {
        self.request(Method::POST, "/api/logout", &[], Some(Vec::new()))?;
        self.set_session_cookie(None);
        Ok(())
    }

    pub fn feeds(&self) -> Result<Subscriptions> {
        let params = vec![("flat".to_string(), "false".to_string())];
        let resp = self.request(Method::GET, "/reader/feeds", &params, None)?;
        let envelope: FeedsEnvelope = resp.json().context("newsblur: decode feeds")?;
        let feeds = records::<Feed>(envelope.feeds).context("newsblur: decode feed records")?;
        Ok(Subscriptions {
            feeds,
            folders: folder_items(&envelope.folders),
            starred_count: envelope.starred_count,
        })
    }

    pub fn feed_settings(&self, feed_id: FeedId) -> Result<FeedSettings> {
        let path = format!("/rss_feeds/feed_settings/{}", feed_id);
        let resp = self.request(Method::GET, &path, &[], None)?;
        let raw: FeedSettingsEnvelope = resp.json().context("newsblur: decode feed settings")?;
        Ok(FeedSettings {
            duplicate_addresses: raw
                .duplicate_addresses
                .iter()
                .filter_map(duplicate_address)
                .collect(),
            feed_fetch_history: raw.feed_fetch_history,
            page_fetch_history: raw.page_fetch_history,
        })
    }

    pub fn exception_retry(&self, feed_id: FeedId, reset_fetch: bool) -> Result<FixResult> {
        let form = vec![
            ("feed_id".to_string(), feed_id.to_string()),
            ("reset_fetch".to_string(), reset_fetch.to_string()),
        ];
        self.fix("/rss_feeds/exception_retry", form)
    }

    pub fn exception_change_feed_address(
        &self,
        feed_id: FeedId,
        feed_address: &str,
    ) -> Result<FixResult> {
        let form = vec![
            ("feed_id".to_string(), feed_id.to_string()),
            ("feed_address".to_string(), feed_address.to_string()),
        ];
        self.fix("/rss_feeds/exception_change_feed_address", form)
    }

    pub fn exception_change_feed_link(&self, feed_id: FeedId, feed_link: &str) -> Result<FixResult> {
        let form = vec![
            ("feed_id".to_string(), feed_id.to_string()),
            ("feed_link".to_string(), feed_link.to_string()),
        ];
        self.fix("/rss_feeds/exception_change_feed_link", form)
    }

    pub fn delete_feed(&self, feed_id: FeedId, in_folder: &str) -> Result<()> {
        let in_folder = if in_folder.trim().is_empty() { "" } else { in_folder };
        let form = vec![
            ("feed_id".to_string(), feed_id.to_string()),
            ("in_folder".to_string(), in_folder.to_string()),
        ];
        let resp = self.request(Method::POST, "/reader/delete_feed", &[], Some(form))?;
        let payload: CodeResponse = resp.json().context("newsblur: decode delete response")?;
        if payload.code != 1 {
            bail!(ApiError::Status {
                status: 200,
                body: format!("delete_feed returned code {}", payload.code),
            });
        }
        Ok(())
    }

    pub fn discover_stories(&self, query: DiscoverQuery) -> Result<Vec<Story>> {
        if query.similar_to_story_hash.trim().is_empty() {
            bail!("newsblur: story hash is required for discovery");
        }
        let path = format!("/rss_feeds/discover/stories/{}", query.similar_to_story_hash);
        let params = query.into_params();
        let resp = self.request(Method::GET, &path, &params, None)?;
        let envelope: DiscoverEnvelope = resp.json().context("newsblur: decode discover stories")?;
        records::<Story>(envelope.discover_stories).context("newsblur: decode discover records")
    }

    fn fix(&self, path: &str, form: Vec<(String, String)>) -> Result<FixResult> {
        let resp = self.request(Method::POST, path, &[], Some(form))?;
        let raw: FixEnvelope = resp.json().context("newsblur: decode fix response")?;
        Ok(FixResult {
            code: raw.code,
            feeds: records::<Feed>(raw.feeds)?,
            new_feed_id: raw.new_feed_id,
        })
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        form: Option<Vec<(String, String)>>,
    ) -> Result<Response> {
        let mut url = self.base_url.join(path)?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }

        tracing::debug!(%method, %url, "newsblur request");
        let mut req = self.http.request(method, url);
        req = req.header(USER_AGENT, self.user_agent.clone());
        if let Some(cookie) = self.session.read().as_ref() {
            req = req.header(COOKIE, format!("{}={}", SESSION_COOKIE, cookie));
        }
        if let Some(form_data) = form {
            req = req.header(CONTENT_TYPE, "application/x-www-form-urlencoded");
            req = req.form(&form_data);
        }

        let resp = req.send()?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            tracing::warn!(status = status.as_u16(), path, "newsblur request failed");
            match status.as_u16() {
                401 => Err(ApiError::Unauthorized.into()),
                403 => Err(ApiError::Forbidden.into()),
                404 => Err(ApiError::NotFound(path.to_string()).into()),
                429 => Err(ApiError::RateLimited(body).into()),
                code => Err(ApiError::Status { status: code, body }.into()),
            }
        }
    }
}

fn session_cookie_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| name.trim() == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Decodes a collection the server may send as an object keyed by id, as an
/// array, or not at all. Object order is preserved.
fn records<T: DeserializeOwned>(value: Value) -> Result<Vec<T>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) => map
            .into_iter()
            .map(|(key, item)| {
                serde_json::from_value(item).with_context(|| format!("decode record {key}"))
            })
            .collect(),
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).context("decode record"))
            .collect(),
        other => bail!("newsblur: unexpected collection shape: {}", other),
    }
}

fn folder_items(values: &[Value]) -> Vec<FolderItem> {
    let mut items = Vec::new();
    for value in values {
        match value {
            Value::Number(n) => {
                if let Some(id) = n.as_i64() {
                    items.push(FolderItem::Feed(id));
                }
            }
            Value::String(s) => {
                if let Ok(id) = s.parse::<FeedId>() {
                    items.push(FolderItem::Feed(id));
                }
            }
            Value::Object(map) => {
                for (name, children) in map {
                    let children = children.as_array().map(Vec::as_slice).unwrap_or(&[]);
                    items.push(FolderItem::Folder {
                        name: name.clone(),
                        items: folder_items(children),
                    });
                }
            }
            _ => {}
        }
    }
    items
}

fn duplicate_address(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("duplicate_address")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feed {
    pub id: FeedId,
    #[serde(default)]
    pub feed_title: String,
    #[serde(default)]
    pub feed_address: String,
    #[serde(default)]
    pub feed_link: String,
    #[serde(default)]
    pub num_subscribers: i64,
    #[serde(default)]
    pub favicon_color: Option<String>,
    #[serde(default)]
    pub has_exception: bool,
    #[serde(default)]
    pub exception_code: Option<i64>,
    #[serde(default)]
    pub exception_type: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub ps: i64,
    #[serde(default)]
    pub nt: i64,
    #[serde(default)]
    pub ng: i64,
}

impl Feed {
    pub fn is_exception(&self) -> bool {
        self.has_exception
            || self
                .exception_type
                .as_deref()
                .is_some_and(|kind| !kind.is_empty())
    }

    /// "1 subscriber", "12,345 subscribers".
    pub fn subscribers_label(&self) -> String {
        let noun = if self.num_subscribers == 1 {
            "subscriber"
        } else {
            "subscribers"
        };
        format!("{} {}", with_commas(self.num_subscribers), noun)
    }
}

fn with_commas(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    if n < 0 {
        out.insert(0, '-');
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderItem {
    Feed(FeedId),
    Folder { name: String, items: Vec<FolderItem> },
}

#[derive(Debug, Clone, Default)]
pub struct Subscriptions {
    pub feeds: Vec<Feed>,
    pub folders: Vec<FolderItem>,
    pub starred_count: i64,
}

impl Subscriptions {
    pub fn feed(&self, id: FeedId) -> Option<&Feed> {
        self.feeds.iter().find(|feed| feed.id == id)
    }

    pub fn feed_ids(&self) -> Vec<FeedId> {
        self.feeds.iter().map(|feed| feed.id).collect()
    }

    pub fn exception_feeds(&self) -> impl Iterator<Item = &Feed> {
        self.feeds.iter().filter(|feed| feed.is_exception())
    }

    /// Name of the folder that directly holds `feed_id`, `""` for the top
    /// level. The first placement wins when the feed sits in several folders.
    pub fn parent_folder(&self, feed_id: FeedId) -> Option<String> {
        find_parent(&self.folders, feed_id, "")
    }

    /// Names of every folder on the path to `feed_id`, outermost first.
    pub fn folders_containing(&self, feed_id: FeedId) -> Vec<String> {
        let mut found = Vec::new();
        collect_folders(&self.folders, feed_id, &mut Vec::new(), &mut found);
        found
    }
}

fn find_parent(items: &[FolderItem], feed_id: FeedId, name: &str) -> Option<String> {
    for item in items {
        match item {
            FolderItem::Feed(id) if *id == feed_id => return Some(name.to_string()),
            FolderItem::Feed(_) => {}
            FolderItem::Folder { name: child, items } => {
                if let Some(found) = find_parent(items, feed_id, child) {
                    return Some(found);
                }
            }
        }
    }
    None
}

fn collect_folders(
    items: &[FolderItem],
    feed_id: FeedId,
    path: &mut Vec<String>,
    found: &mut Vec<String>,
) {
    for item in items {
        match item {
            FolderItem::Feed(id) if *id == feed_id => {
                for name in path.iter() {
                    if !name.is_empty() && !found.contains(name) {
                        found.push(name.clone());
                    }
                }
            }
            FolderItem::Feed(_) => {}
            FolderItem::Folder { name, items } => {
                path.push(name.clone());
                collect_folders(items, feed_id, path, found);
                path.pop();
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FetchHistoryEntry {
    #[serde(default)]
    pub status_code: Option<i64>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub fetch_date: String,
    #[serde(default)]
    pub exception: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedSettings {
    pub duplicate_addresses: Vec<String>,
    pub feed_fetch_history: Vec<FetchHistoryEntry>,
    pub page_fetch_history: Vec<FetchHistoryEntry>,
}

/// Server answer to one of the exception remediation calls.
#[derive(Debug, Clone, PartialEq)]
pub struct FixResult {
    pub code: i64,
    pub feeds: Vec<Feed>,
    pub new_feed_id: Option<FeedId>,
}

impl FixResult {
    /// `false` when the server left the feed as it was (code -1).
    pub fn changed(&self) -> bool {
        self.code == 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Story {
    pub story_hash: String,
    #[serde(default)]
    pub story_feed_id: FeedId,
    #[serde(default)]
    pub story_title: String,
    #[serde(default)]
    pub story_authors: String,
    #[serde(default)]
    pub story_permalink: String,
    #[serde(default)]
    pub story_date: String,
    #[serde(default)]
    pub short_parsed_date: String,
    #[serde(default)]
    pub story_tags: Vec<String>,
    #[serde(default)]
    pub story_content: String,
}

#[derive(Debug, Deserialize)]
struct CodeResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Value,
}

impl CodeResponse {
    fn message(&self) -> String {
        if !self.message.is_empty() {
            return self.message.clone();
        }
        let mut parts = Vec::new();
        flatten_errors(&self.errors, &mut parts);
        if parts.is_empty() {
            format!("code {}", self.code)
        } else {
            parts.join("; ")
        }
    }
}

fn flatten_errors(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) if !s.is_empty() => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|item| flatten_errors(item, out)),
        Value::Object(map) => map.values().for_each(|item| flatten_errors(item, out)),
        _ => {}
    }
}

#[derive(Debug, Deserialize)]
struct FeedsEnvelope {
    #[serde(default)]
    feeds: Value,
    #[serde(default)]
    folders: Vec<Value>,
    #[serde(default)]
    starred_count: i64,
}

#[derive(Debug, Deserialize)]
struct FeedSettingsEnvelope {
    #[serde(default)]
    duplicate_addresses: Vec<Value>,
    #[serde(default)]
    feed_fetch_history: Vec<FetchHistoryEntry>,
    #[serde(default)]
    page_fetch_history: Vec<FetchHistoryEntry>,
}

#[derive(Debug, Deserialize)]
struct FixEnvelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    feeds: Value,
    #[serde(default)]
    new_feed_id: Option<FeedId>,
}

#[derive(Debug, Deserialize)]
struct DiscoverEnvelope {
    #[serde(default)]
    discover_stories: Value,
}
