use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use crate::config;
use crate::data::{
    DiscoverService, FeedSettingsService, NewsBlurDiscoverService, NewsBlurFeedSettingsService,
    NewsBlurSubscriptionService, SubscriptionService,
};
use crate::discover::{self, DiscoverController, DiscoverView, Section};
use crate::exception::{ExceptionFixer, FixOutcome};
use crate::newsblur::{self, FeedId, Story};
use crate::session;
use crate::storage;

#[derive(Parser, Debug)]
#[command(
    name = "newsblur-fix",
    version,
    about = "newsblur-fix - Repair misbehaving NewsBlur feeds and discover similar stories."
)]
pub struct Cli {
    /// Config file (defaults to ~/.config/newsblur-fix/config.yaml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Override the NewsBlur server.
    #[arg(long, global = true)]
    pub base_url: Option<String>,
    /// Where accounts and session cookies are kept.
    #[arg(long, global = true)]
    pub state: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Log in and remember the session.
    Login {
        username: String,
        #[arg(long, env = "NEWSBLUR_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// End the active session.
    Logout,
    /// Make another stored account the active one.
    Switch { username: String },
    /// List subscribed feeds.
    Feeds {
        /// Only feeds that are currently failing.
        #[arg(long)]
        exceptions: bool,
    },
    /// Show a feed's remediation options and fetch history.
    Settings { feed_id: FeedId },
    /// Apply a remediation to a feed.
    Fix {
        feed_id: FeedId,
        #[command(subcommand)]
        action: FixAction,
    },
    /// List stories similar to a story.
    Discover {
        story_hash: String,
        /// Feed of the story; taken from the story hash when omitted.
        #[arg(long)]
        feed_id: Option<FeedId>,
        /// "site", "all" or "global".
        #[arg(long)]
        section: Option<String>,
        #[arg(long)]
        pages: Option<u32>,
    },
}

#[derive(Subcommand, Debug)]
pub enum FixAction {
    /// Retry fetching and parsing.
    Retry {
        /// Treat the feed as never fetched.
        #[arg(long)]
        reset: bool,
    },
    /// Parse the feed from a new RSS/XML address.
    Address { url: String },
    /// Find the feed from a new website address.
    Link { url: String },
    /// Unsubscribe from the feed.
    Delete {
        /// Folder to remove the feed from; defaults to where it is filed.
        #[arg(long)]
        folder: Option<String>,
    },
}

pub fn run(cli: Cli) -> Result<()> {
    let mut cfg = config::load(config::LoadOptions {
        config_file: cli.config.clone(),
        env_prefix: None,
    })
    .context("load config")?;
    if let Some(base_url) = cli.base_url.clone() {
        cfg.api.base_url = base_url;
    }

    let client = Arc::new(
        newsblur::Client::new(newsblur::ClientConfig {
            user_agent: cfg.api.user_agent.clone(),
            base_url: Some(cfg.api.base_url.clone()),
            timeout: Some(cfg.api.timeout),
            ..Default::default()
        })
        .context("create newsblur client")?,
    );
    let store = Arc::new(
        storage::Store::open(storage::Options {
            path: cli.state.clone(),
        })
        .context("open storage")?,
    );
    let sessions = session::Manager::new(store, client.clone());
    sessions.load_existing().context("resume session")?;

    let subscriptions: Arc<dyn SubscriptionService> =
        Arc::new(NewsBlurSubscriptionService::new(client.clone()));
    let settings: Arc<dyn FeedSettingsService> =
        Arc::new(NewsBlurFeedSettingsService::new(client.clone()));
    let discover_api: Arc<dyn DiscoverService> =
        Arc::new(NewsBlurDiscoverService::new(client.clone()));

    match cli.command {
        Command::Login { username, password } => {
            let account = sessions.login(&username, &password)?;
            println!("Logged in as {} on {}", account.username, account.server);
        }
        Command::Logout => {
            let account = sessions.logout()?;
            println!("Logged out {}", account.username);
        }
        Command::Switch { username } => {
            let account = sessions.switch(&username)?;
            println!("Switched to {}", account.username);
        }
        Command::Feeds { exceptions } => {
            sessions.require_active()?;
            let subs = subscriptions.load_subscriptions()?;
            print_feeds(&subs, exceptions);
        }
        Command::Settings { feed_id } => {
            sessions.require_active()?;
            let feed = find_feed(&subscriptions.load_subscriptions()?, feed_id)?;
            let mut fixer = ExceptionFixer::open(settings, feed);
            fixer.load_settings()?;
            print_settings(&fixer);
        }
        Command::Fix { feed_id, action } => {
            sessions.require_active()?;
            let subs = subscriptions.load_subscriptions()?;
            let feed = find_feed(&subs, feed_id)?;
            let mut fixer = ExceptionFixer::open(settings, feed);
            let outcome = match action {
                FixAction::Retry { reset } => fixer.retry(reset)?,
                FixAction::Address { url } => {
                    fixer.set_feed_address(url);
                    fixer.change_feed_address()?
                }
                FixAction::Link { url } => {
                    fixer.set_feed_link(url);
                    fixer.change_feed_link()?
                }
                FixAction::Delete { folder } => {
                    let folder = folder
                        .or_else(|| subs.parent_folder(feed_id))
                        .unwrap_or_default();
                    fixer.delete(&folder)?
                }
            };
            print_outcome(&outcome);
        }
        Command::Discover {
            story_hash,
            feed_id,
            section,
            pages,
        } => {
            sessions.require_active()?;
            let story_feed_id = match feed_id {
                Some(id) => id,
                None => feed_id_from_hash(&story_hash)?,
            };
            let section = section
                .as_deref()
                .map(Section::from_label)
                .unwrap_or(cfg.discover.default_section);
            let subs = subscriptions.load_subscriptions()?;
            let labels = discover::section_labels(&subs.folders_containing(story_feed_id));
            println!("Sections: {}", labels.join(" | "));
            let subscribed = if section == Section::All {
                subs.feed_ids()
            } else {
                Vec::new()
            };
            let max_pages = pages.unwrap_or(cfg.discover.max_pages).max(1);
            run_discover(
                discover_api,
                &story_hash,
                story_feed_id,
                subscribed,
                section,
                max_pages,
                cfg.discover.page_timeout,
            );
        }
    }

    Ok(())
}

fn find_feed(subs: &newsblur::Subscriptions, feed_id: FeedId) -> Result<newsblur::Feed> {
    subs.feed(feed_id)
        .cloned()
        .ok_or_else(|| anyhow!("feed {feed_id} is not among your subscriptions"))
}

/// Story hashes are `<feed_id>:<hash>`.
fn feed_id_from_hash(story_hash: &str) -> Result<FeedId> {
    let Some((feed, _)) = story_hash.split_once(':') else {
        bail!("story hash {story_hash:?} has no feed id; pass --feed-id");
    };
    feed.parse::<FeedId>()
        .with_context(|| format!("story hash {story_hash:?} has no feed id; pass --feed-id"))
}

fn run_discover(
    service: Arc<dyn DiscoverService>,
    story_hash: &str,
    story_feed_id: FeedId,
    subscribed: Vec<FeedId>,
    section: Section,
    max_pages: u32,
    page_timeout: Duration,
) {
    tracing::debug!(story_hash, story_feed_id, section = section.as_str(), "discover");
    println!("Similar stories · {}", section.display_name());
    let mut controller = DiscoverController::new(service, TerminalView::new(), section);
    controller.open(story_hash, story_feed_id, subscribed);

    let mut attempts = 1;
    while controller.wait(page_timeout) {
        if attempts >= max_pages || !controller.load_more() {
            break;
        }
        attempts += 1;
    }
    if controller.session().is_some_and(|s| s.is_loading()) {
        eprintln!("Timed out waiting for more stories.");
    }
    controller.close();
}

struct TerminalView {
    spinner: Option<ProgressBar>,
}

impl TerminalView {
    fn new() -> Self {
        Self { spinner: None }
    }

    fn stop_spinner(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }
}

impl DiscoverView for TerminalView {
    fn loading(&mut self, section: Section, page: u32) {
        self.stop_spinner();
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
            spinner.set_style(style);
        }
        spinner.set_message(format!(
            "Finding similar stories ({}, page {page})...",
            section.display_name()
        ));
        spinner.enable_steady_tick(Duration::from_millis(100));
        self.spinner = Some(spinner);
    }

    fn append(&mut self, page: u32, stories: &[Story]) {
        self.stop_spinner();
        if page == 1 {
            println!();
        }
        for story in stories {
            print_story(story);
        }
    }

    fn empty(&mut self, _section: Section) {
        self.stop_spinner();
        println!("No similar stories found");
    }

    fn failed(&mut self, page: u32, error: &anyhow::Error) {
        self.stop_spinner();
        eprintln!("Could not load page {page}: {error:#}");
    }
}

impl Drop for TerminalView {
    fn drop(&mut self) {
        self.stop_spinner();
    }
}

fn print_story(story: &Story) {
    let title = if story.story_title.trim().is_empty() {
        "(untitled)"
    } else {
        story.story_title.trim()
    };
    println!("{title}");
    let mut meta = Vec::new();
    if !story.story_authors.is_empty() {
        meta.push(story.story_authors.clone());
    }
    if !story.short_parsed_date.is_empty() {
        meta.push(story.short_parsed_date.clone());
    }
    meta.push(story.story_hash.clone());
    println!("  {}", meta.join(" · "));
    if !story.story_permalink.is_empty() {
        println!("  {}", story.story_permalink);
    }
}

fn print_feeds(subs: &newsblur::Subscriptions, only_exceptions: bool) {
    let mut shown = 0;
    for feed in &subs.feeds {
        if only_exceptions && !feed.is_exception() {
            continue;
        }
        shown += 1;
        let mut line = format!("{:>8}  {}  ({})", feed.id, feed.feed_title, feed.subscribers_label());
        if feed.is_exception() {
            let code = feed
                .exception_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "?".into());
            let kind = feed.exception_type.as_deref().unwrap_or("unknown");
            line.push_str(&format!("  [{kind} exception, {code}]"));
            if let Some(option) = crate::exception::recommended_option(
                feed.exception_code,
                feed.exception_type.as_deref(),
            ) {
                line.push_str(&format!(" try: {}", option.title()));
            }
        }
        println!("{line}");
    }
    if shown == 0 {
        if only_exceptions {
            println!("All feeds are fetching normally.");
        } else {
            println!("No subscriptions.");
        }
    }
}

fn print_settings(fixer: &ExceptionFixer) {
    let feed = fixer.feed();
    println!("{}", fixer.mode().title());
    println!("{} ({})", feed.feed_title, feed.subscribers_label());
    println!("  RSS/XML URL: {}", fixer.feed_address());
    println!("  Website URL: {}", fixer.feed_link());
    println!();
    for entry in fixer.options() {
        let number = entry
            .number
            .map(|n| format!("Option {n}: "))
            .unwrap_or_default();
        let flag = if entry.recommended { "  (recommended)" } else { "" };
        println!("{number}{} - {}{flag}", entry.option.title(), entry.option.action_label());
    }
    if let Some(settings) = fixer.settings() {
        if !settings.duplicate_addresses.is_empty() {
            println!();
            println!("Also known as:");
            for address in &settings.duplicate_addresses {
                println!("  {address}");
            }
        }
        print_history("Feed fetch history", &settings.feed_fetch_history);
        print_history("Page fetch history", &settings.page_fetch_history);
    }
}

fn print_history(title: &str, entries: &[newsblur::FetchHistoryEntry]) {
    if entries.is_empty() {
        return;
    }
    println!();
    println!("{title}:");
    for entry in entries {
        let code = entry
            .status_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".into());
        println!("  {:>4}  {}  {}", code, entry.fetch_date, entry.message);
    }
}

fn print_outcome(outcome: &FixOutcome) {
    let verb = outcome.action.title();
    if !outcome.changed {
        println!("{verb}: NewsBlur left feed {} unchanged.", outcome.feed_id);
        return;
    }
    match outcome.new_feed_id {
        Some(new_id) if new_id != outcome.feed_id => {
            println!("{verb}: feed {} is now feed {new_id}.", outcome.feed_id)
        }
        _ => println!("{verb}: done for feed {}.", outcome.feed_id),
    }
}
