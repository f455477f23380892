use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;

use crate::newsblur::{self, DiscoverQuery, Feed, FeedId, FeedSettings, FixResult, Story};

pub trait SubscriptionService: Send + Sync {
    fn load_subscriptions(&self) -> Result<newsblur::Subscriptions>;
}

pub trait FeedSettingsService: Send + Sync {
    fn feed_settings(&self, feed_id: FeedId) -> Result<FeedSettings>;
    fn retry(&self, feed_id: FeedId, reset_fetch: bool) -> Result<FixResult>;
    fn change_feed_address(&self, feed_id: FeedId, feed_address: &str) -> Result<FixResult>;
    fn change_feed_link(&self, feed_id: FeedId, feed_link: &str) -> Result<FixResult>;
    fn delete_feed(&self, feed_id: FeedId, in_folder: &str) -> Result<()>;
}

pub trait DiscoverService: Send + Sync {
    fn discover_stories(&self, query: DiscoverQuery) -> Result<Vec<Story>>;
}

pub struct NewsBlurSubscriptionService {
    client: Arc<newsblur::Client>,
}

impl NewsBlurSubscriptionService {
    pub fn new(client: Arc<newsblur::Client>) -> Self {
        Self { client }
    }
}

impl SubscriptionService for NewsBlurSubscriptionService {
    fn load_subscriptions(&self) -> Result<newsblur::Subscriptions> {
        self.client.feeds().context("fetch subscriptions")
    }
}

pub struct NewsBlurFeedSettingsService {
    client: Arc<newsblur::Client>,
}

impl NewsBlurFeedSettingsService {
    pub fn new(client: Arc<newsblur::Client>) -> Self {
        Self { client }
    }
}

impl FeedSettingsService for NewsBlurFeedSettingsService {
    fn feed_settings(&self, feed_id: FeedId) -> Result<FeedSettings> {
        self.client
            .feed_settings(feed_id)
            .context("fetch feed settings")
    }

    fn retry(&self, feed_id: FeedId, reset_fetch: bool) -> Result<FixResult> {
        self.client
            .exception_retry(feed_id, reset_fetch)
            .context("retry feed")
    }

    fn change_feed_address(&self, feed_id: FeedId, feed_address: &str) -> Result<FixResult> {
        self.client
            .exception_change_feed_address(feed_id, feed_address)
            .context("change feed address")
    }

    fn change_feed_link(&self, feed_id: FeedId, feed_link: &str) -> Result<FixResult> {
        self.client
            .exception_change_feed_link(feed_id, feed_link)
            .context("change feed link")
    }

    fn delete_feed(&self, feed_id: FeedId, in_folder: &str) -> Result<()> {
        self.client
            .delete_feed(feed_id, in_folder)
            .context("delete feed")
    }
}

pub struct NewsBlurDiscoverService {
    client: Arc<newsblur::Client>,
}

impl NewsBlurDiscoverService {
    pub fn new(client: Arc<newsblur::Client>) -> Self {
        Self { client }
    }
}

impl DiscoverService for NewsBlurDiscoverService {
    fn discover_stories(&self, query: DiscoverQuery) -> Result<Vec<Story>> {
        self.client
            .discover_stories(query)
            .context("fetch discover stories")
    }
}

/// Records every remediation call and answers with a canned result.
#[derive(Default)]
pub struct MockFeedSettingsService {
    pub settings: FeedSettings,
    pub calls: Mutex<Vec<String>>,
    pub unchanged: bool,
}

impl MockFeedSettingsService {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn answer(&self, feed_id: FeedId, call: String) -> Result<FixResult> {
        self.calls.lock().push(call);
        Ok(FixResult {
            code: if self.unchanged { -1 } else { 1 },
            feeds: vec![mock_feed(feed_id)],
            new_feed_id: Some(feed_id),
        })
    }
}

impl FeedSettingsService for MockFeedSettingsService {
    fn feed_settings(&self, feed_id: FeedId) -> Result<FeedSettings> {
        self.calls.lock().push(format!("settings {feed_id}"));
        Ok(self.settings.clone())
    }

    fn retry(&self, feed_id: FeedId, reset_fetch: bool) -> Result<FixResult> {
        self.answer(feed_id, format!("retry {feed_id} reset={reset_fetch}"))
    }

    fn change_feed_address(&self, feed_id: FeedId, feed_address: &str) -> Result<FixResult> {
        self.answer(feed_id, format!("address {feed_id} {feed_address}"))
    }

    fn change_feed_link(&self, feed_id: FeedId, feed_link: &str) -> Result<FixResult> {
        self.answer(feed_id, format!("link {feed_id} {feed_link}"))
    }

    fn delete_feed(&self, feed_id: FeedId, in_folder: &str) -> Result<()> {
        self.calls
            .lock()
            .push(format!("delete {feed_id} in={in_folder}"));
        Ok(())
    }
}

/// Serves pre-loaded pages keyed by page number; pages past the end are empty.
#[derive(Default)]
pub struct MockDiscoverService {
    pages: HashMap<u32, Vec<Story>>,
    failing: Mutex<Vec<u32>>,
    queries: Mutex<Vec<DiscoverQuery>>,
}

impl MockDiscoverService {
    pub fn with_pages(pages: Vec<Vec<Story>>) -> Self {
        Self {
            pages: pages
                .into_iter()
                .enumerate()
                .map(|(idx, stories)| (idx as u32 + 1, stories))
                .collect(),
            ..Default::default()
        }
    }

    /// The next request for `page` fails once.
    pub fn fail_once(&self, page: u32) {
        self.failing.lock().push(page);
    }

    pub fn queries(&self) -> Vec<DiscoverQuery> {
        self.queries.lock().clone()
    }
}

impl DiscoverService for MockDiscoverService {
    fn discover_stories(&self, query: DiscoverQuery) -> Result<Vec<Story>> {
        let page = query.page;
        self.queries.lock().push(query);
        {
            let mut failing = self.failing.lock();
            if let Some(pos) = failing.iter().position(|p| *p == page) {
                failing.remove(pos);
                bail!("mock discover failure on page {page}");
            }
        }
        Ok(self.pages.get(&page).cloned().unwrap_or_default())
    }
}

pub fn mock_story(feed_id: FeedId, key: &str) -> Story {
    Story {
        story_hash: format!("{feed_id}:{key}"),
        story_feed_id: feed_id,
        story_title: format!("Story {key}"),
        story_authors: "newsblur".into(),
        story_permalink: format!("https://example.com/{key}"),
        story_date: String::new(),
        short_parsed_date: String::new(),
        story_tags: Vec::new(),
        story_content: String::new(),
    }
}

pub fn mock_feed(feed_id: FeedId) -> Feed {
    Feed {
        id: feed_id,
        feed_title: format!("Feed {feed_id}"),
        feed_address: format!("https://example.com/{feed_id}/rss"),
        feed_link: format!("https://example.com/{feed_id}"),
        num_subscribers: 1,
        favicon_color: None,
        has_exception: false,
        exception_code: None,
        exception_type: None,
        active: true,
        ps: 0,
        nt: 0,
        ng: 0,
    }
}
