use std::sync::Arc;

use anyhow::{Context, Result};

use crate::data::FeedSettingsService;
use crate::newsblur::{Feed, FeedId, FeedSettings, FixResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionOption {
    Retry,
    ChangeFeedAddress,
    ChangeWebsiteAddress,
    Delete,
}

impl ExceptionOption {
    pub fn title(&self) -> &'static str {
        match self {
            ExceptionOption::Retry => "Retry",
            ExceptionOption::ChangeFeedAddress => "Change RSS Feed Address",
            ExceptionOption::ChangeWebsiteAddress => "Change Website Address",
            ExceptionOption::Delete => "Just Delete This Feed",
        }
    }

    pub fn action_label(&self) -> &'static str {
        match self {
            ExceptionOption::Retry => "Retry fetching and parsing",
            ExceptionOption::ChangeFeedAddress => "Parse this RSS/XML Feed",
            ExceptionOption::ChangeWebsiteAddress => "Fetch Feed From Website",
            ExceptionOption::Delete => "Delete It. It Just Won't Work!",
        }
    }
}

/// Which fetch of the feed is failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExceptionKind {
    Feed,
    Page,
    Other(String),
}

impl ExceptionKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "" => None,
            "feed" => Some(ExceptionKind::Feed),
            "page" => Some(ExceptionKind::Page),
            other => Some(ExceptionKind::Other(other.to_string())),
        }
    }
}

pub fn is_client_error(exception_code: Option<i64>) -> bool {
    exception_code.is_some_and(|code| (400..500).contains(&code))
}

/// The remediation flagged as recommended for a failing feed.
///
/// Retry for any code outside 4xx (a missing code included). Within 4xx, a
/// failing feed fetch maps to changing the website address and a failing
/// page fetch to changing the feed address.
pub fn recommended_option(
    exception_code: Option<i64>,
    exception_type: Option<&str>,
) -> Option<ExceptionOption> {
    if !is_client_error(exception_code) {
        return Some(ExceptionOption::Retry);
    }
    match exception_type.and_then(ExceptionKind::parse) {
        Some(ExceptionKind::Feed) => Some(ExceptionOption::ChangeWebsiteAddress),
        Some(ExceptionKind::Page) => Some(ExceptionOption::ChangeFeedAddress),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    /// The feed is failing; every remediation is offered.
    Exception,
    /// A healthy feed; only its addresses and subscription can be changed.
    Settings,
}

impl FeedMode {
    pub fn of(feed: &Feed) -> Self {
        if feed.is_exception() {
            FeedMode::Exception
        } else {
            FeedMode::Settings
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            FeedMode::Exception => "Fix a misbehaving site",
            FeedMode::Settings => "Site settings",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionEntry {
    /// "Option N" numbering, only shown for failing feeds.
    pub number: Option<u8>,
    pub option: ExceptionOption,
    pub recommended: bool,
}

pub fn options_for(feed: &Feed) -> Vec<OptionEntry> {
    let mode = FeedMode::of(feed);
    let recommended = match mode {
        FeedMode::Exception => {
            recommended_option(feed.exception_code, feed.exception_type.as_deref())
        }
        FeedMode::Settings => None,
    };
    let all = [
        ExceptionOption::Retry,
        ExceptionOption::ChangeFeedAddress,
        ExceptionOption::ChangeWebsiteAddress,
        ExceptionOption::Delete,
    ];
    all.into_iter()
        .enumerate()
        .filter(|(_, option)| mode == FeedMode::Exception || *option != ExceptionOption::Retry)
        .map(|(idx, option)| OptionEntry {
            number: (mode == FeedMode::Exception).then_some(idx as u8 + 1),
            option,
            recommended: recommended == Some(option),
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum FixError {
    #[error("feed address is empty")]
    EmptyFeedAddress,
    #[error("website address is empty")]
    EmptyFeedLink,
}

/// What the remediation dialog closes with.
#[derive(Debug, Clone, PartialEq)]
pub struct FixOutcome {
    pub action: ExceptionOption,
    pub feed_id: FeedId,
    /// `false` when the server kept the feed unchanged.
    pub changed: bool,
    pub new_feed_id: Option<FeedId>,
    pub feeds: Vec<Feed>,
}

impl FixOutcome {
    fn from_result(action: ExceptionOption, feed_id: FeedId, result: FixResult) -> Self {
        Self {
            action,
            feed_id,
            changed: result.changed(),
            new_feed_id: result.new_feed_id,
            feeds: result.feeds,
        }
    }
}

/// Remediation workflow for one subscribed feed at a time.
pub struct ExceptionFixer {
    service: Arc<dyn FeedSettingsService>,
    feed: Feed,
    settings: Option<FeedSettings>,
    feed_address: String,
    feed_link: String,
}

impl ExceptionFixer {
    pub fn open(service: Arc<dyn FeedSettingsService>, feed: Feed) -> Self {
        let feed_address = feed.feed_address.clone();
        let feed_link = feed.feed_link.clone();
        Self {
            service,
            feed,
            settings: None,
            feed_address,
            feed_link,
        }
    }

    pub fn feed(&self) -> &Feed {
        &self.feed
    }

    pub fn mode(&self) -> FeedMode {
        FeedMode::of(&self.feed)
    }

    pub fn options(&self) -> Vec<OptionEntry> {
        options_for(&self.feed)
    }

    pub fn recommendation(&self) -> Option<ExceptionOption> {
        self.options()
            .into_iter()
            .find(|entry| entry.recommended)
            .map(|entry| entry.option)
    }

    pub fn settings(&self) -> Option<&FeedSettings> {
        self.settings.as_ref()
    }

    pub fn load_settings(&mut self) -> Result<&FeedSettings> {
        let settings = self
            .service
            .feed_settings(self.feed.id)
            .with_context(|| format!("load settings for feed {}", self.feed.id))?;
        Ok(self.settings.insert(settings))
    }

    /// Switches the dialog to another feed, as the feed chooser does.
    pub fn select_feed(&mut self, feed: Feed) -> Result<&FeedSettings> {
        self.feed_address = feed.feed_address.clone();
        self.feed_link = feed.feed_link.clone();
        self.feed = feed;
        self.settings = None;
        self.load_settings()
    }

    pub fn feed_address(&self) -> &str {
        &self.feed_address
    }

    pub fn set_feed_address(&mut self, address: impl Into<String>) {
        self.feed_address = address.into();
    }

    pub fn feed_link(&self) -> &str {
        &self.feed_link
    }

    pub fn set_feed_link(&mut self, link: impl Into<String>) {
        self.feed_link = link.into();
    }

    pub fn retry(&self, reset_fetch: bool) -> Result<FixOutcome> {
        tracing::info!(feed_id = self.feed.id, reset_fetch, "retrying feed");
        let result = self.service.retry(self.feed.id, reset_fetch)?;
        Ok(FixOutcome::from_result(
            ExceptionOption::Retry,
            self.feed.id,
            result,
        ))
    }

    pub fn change_feed_address(&self) -> Result<FixOutcome> {
        let address = self.feed_address.trim();
        if address.is_empty() {
            return Err(FixError::EmptyFeedAddress.into());
        }
        tracing::info!(feed_id = self.feed.id, address, "changing feed address");
        let result = self.service.change_feed_address(self.feed.id, address)?;
        Ok(FixOutcome::from_result(
            ExceptionOption::ChangeFeedAddress,
            self.feed.id,
            result,
        ))
    }

    pub fn change_feed_link(&self) -> Result<FixOutcome> {
        let link = self.feed_link.trim();
        if link.is_empty() {
            return Err(FixError::EmptyFeedLink.into());
        }
        tracing::info!(feed_id = self.feed.id, link, "changing website address");
        let result = self.service.change_feed_link(self.feed.id, link)?;
        Ok(FixOutcome::from_result(
            ExceptionOption::ChangeWebsiteAddress,
            self.feed.id,
            result,
        ))
    }

    pub fn delete(&self, in_folder: &str) -> Result<FixOutcome> {
        tracing::info!(feed_id = self.feed.id, in_folder, "deleting feed");
        self.service.delete_feed(self.feed.id, in_folder)?;
        Ok(FixOutcome {
            action: ExceptionOption::Delete,
            feed_id: self.feed.id,
            changed: true,
            new_feed_id: None,
            feeds: Vec::new(),
        })
    }
}
