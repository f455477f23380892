//! Paginated "discover similar stories" sessions.
//!
//! [`DiscoverSession`] is the pure pagination state for one story's discover
//! panel. [`DiscoverController`] owns at most one session, runs its fetches on
//! worker threads and applies their completions when polled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::data::DiscoverService;
use crate::newsblur::{DiscoverQuery, FeedId, Story};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    #[default]
    Site,
    All,
    Global,
}

impl Section {
    /// Maps a section control label to its scope. Labels mentioning "all"
    /// or "global" pick those scopes; everything else, folder names
    /// included, scopes to the story's own site.
    pub fn from_label(label: &str) -> Self {
        let lower = label.to_lowercase();
        if lower.contains("all") {
            Section::All
        } else if lower.contains("global") {
            Section::Global
        } else {
            Section::Site
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Site => "site",
            Section::All => "all",
            Section::Global => "global",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Section::Site => "This site",
            Section::All => "All sites",
            Section::Global => "Global",
        }
    }
}

/// Labels shown on the section control, in order.
pub fn section_labels(folders: &[String]) -> Vec<String> {
    let mut labels = vec![Section::Site.display_name().to_string()];
    labels.extend(folders.iter().filter(|name| !name.is_empty()).cloned());
    labels.push(Section::All.display_name().to_string());
    labels.push(Section::Global.display_name().to_string());
    labels
}

#[derive(Debug)]
pub enum Completion {
    Loaded { page: u32, stories: Vec<Story> },
    /// The server had nothing for `page`; no further pages are requested.
    Exhausted { page: u32 },
    /// `page` and `has_more` are untouched so the same page can be retried.
    Failed { page: u32, error: anyhow::Error },
    /// The response belongs to a fetch this session no longer waits for.
    Stale,
}

#[derive(Debug, Clone)]
pub struct DiscoverSession {
    story_hash: String,
    story_feed_id: FeedId,
    subscribed: Vec<FeedId>,
    section: Section,
    page: u32,
    has_more: bool,
    is_loading: bool,
    in_flight: Option<u64>,
}

impl DiscoverSession {
    pub fn new(
        story_hash: impl Into<String>,
        story_feed_id: FeedId,
        subscribed: Vec<FeedId>,
        section: Section,
    ) -> Self {
        Self {
            story_hash: story_hash.into(),
            story_feed_id,
            subscribed,
            section,
            page: 1,
            has_more: true,
            is_loading: false,
            in_flight: None,
        }
    }

    pub fn story_hash(&self) -> &str {
        &self.story_hash
    }

    pub fn section(&self) -> Section {
        self.section
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn feed_ids(&self) -> Vec<FeedId> {
        match self.section {
            Section::Site => vec![self.story_feed_id],
            Section::All => self.subscribed.clone(),
            Section::Global => Vec::new(),
        }
    }

    /// Back to page one with more results expected; any fetch in flight is
    /// forgotten.
    pub fn reset(&mut self) {
        self.page = 1;
        self.has_more = true;
        self.is_loading = false;
        self.in_flight = None;
    }

    pub fn switch_section(&mut self, section: Section, request_id: u64) -> Option<DiscoverQuery> {
        self.section = section;
        self.reset();
        self.begin_load(request_id)
    }

    /// Starts a fetch of the current page unless one is already running or
    /// the results are exhausted.
    pub fn begin_load(&mut self, request_id: u64) -> Option<DiscoverQuery> {
        if self.is_loading || !self.has_more {
            return None;
        }
        self.is_loading = true;
        self.in_flight = Some(request_id);
        Some(DiscoverQuery {
            similar_to_story_hash: self.story_hash.clone(),
            feed_ids: self.feed_ids(),
            page: self.page,
        })
    }

    pub fn complete(&mut self, request_id: u64, result: Result<Vec<Story>>) -> Completion {
        if self.in_flight != Some(request_id) {
            return Completion::Stale;
        }
        self.in_flight = None;
        self.is_loading = false;
        let page = self.page;
        match result {
            Ok(stories) if stories.is_empty() => {
                self.has_more = false;
                Completion::Exhausted { page }
            }
            Ok(stories) => {
                self.page += 1;
                Completion::Loaded { page, stories }
            }
            Err(error) => Completion::Failed { page, error },
        }
    }
}

/// Rendering collaborator of the discover panel.
pub trait DiscoverView {
    fn loading(&mut self, section: Section, page: u32);
    fn append(&mut self, page: u32, stories: &[Story]);
    /// The first page came back empty.
    fn empty(&mut self, section: Section);
    fn failed(&mut self, page: u32, error: &anyhow::Error);
}

struct DiscoverResponse {
    request_id: u64,
    result: Result<Vec<Story>>,
}

pub struct DiscoverController<V: DiscoverView> {
    service: Arc<dyn DiscoverService>,
    view: V,
    default_section: Section,
    session: Option<DiscoverSession>,
    stories: Vec<Story>,
    next_request_id: u64,
    cancel_flag: Option<Arc<AtomicBool>>,
    response_tx: Sender<DiscoverResponse>,
    response_rx: Receiver<DiscoverResponse>,
}

impl<V: DiscoverView> DiscoverController<V> {
    pub fn new(service: Arc<dyn DiscoverService>, view: V, default_section: Section) -> Self {
        let (response_tx, response_rx) = unbounded();
        Self {
            service,
            view,
            default_section,
            session: None,
            stories: Vec::new(),
            next_request_id: 1,
            cancel_flag: None,
            response_tx,
            response_rx,
        }
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    pub fn session(&self) -> Option<&DiscoverSession> {
        self.session.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn stories(&self) -> &[Story] {
        &self.stories
    }

    /// Opens the panel for a story and requests its first page.
    pub fn open(&mut self, story_hash: &str, story_feed_id: FeedId, subscribed: Vec<FeedId>) {
        self.cancel_pending();
        self.stories.clear();
        let section = self
            .session
            .as_ref()
            .map(|session| session.section())
            .unwrap_or(self.default_section);
        self.session = Some(DiscoverSession::new(
            story_hash,
            story_feed_id,
            subscribed,
            section,
        ));
        tracing::debug!(story_hash, section = section.as_str(), "discover panel opened");
        self.load_more();
    }

    pub fn close(&mut self) {
        self.cancel_pending();
        self.session = None;
        self.stories.clear();
    }

    pub fn toggle(&mut self, story_hash: &str, story_feed_id: FeedId, subscribed: Vec<FeedId>) {
        if self.is_open() {
            self.close();
        } else {
            self.open(story_hash, story_feed_id, subscribed);
        }
    }

    pub fn switch_section(&mut self, section: Section) {
        let request_id = self.next_request_id;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let query = session.switch_section(section, request_id);
        self.cancel_pending();
        self.stories.clear();
        if let Some(query) = query {
            self.dispatch(query);
        }
    }

    /// Returns `false` when the call was a no-op.
    pub fn load_more(&mut self) -> bool {
        let request_id = self.next_request_id;
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        match session.begin_load(request_id) {
            Some(query) => {
                self.dispatch(query);
                true
            }
            None => false,
        }
    }

    /// Applies every completion that has already arrived.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Ok(response) = self.response_rx.try_recv() {
            changed |= self.handle_response(response);
        }
        changed
    }

    /// Blocks until the running fetch completes or `timeout` elapses.
    /// Responses of abandoned fetches are skipped while waiting.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.session.as_ref().is_some_and(|s| s.is_loading()) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.response_rx.recv_timeout(remaining) {
                Ok(response) => {
                    if self.handle_response(response) {
                        return true;
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return false;
                }
            }
        }
        false
    }

    fn dispatch(&mut self, query: DiscoverQuery) {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.cancel_flag = Some(cancel_flag.clone());

        if let Some(session) = self.session.as_ref() {
            self.view.loading(session.section(), query.page);
        }

        let tx = self.response_tx.clone();
        let service = self.service.clone();
        thread::spawn(move || {
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let result = service.discover_stories(query);
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(DiscoverResponse { request_id, result });
        });
    }

    fn cancel_pending(&mut self) {
        if let Some(flag) = self.cancel_flag.take() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Returns `false` when the response was stale and nothing changed.
    fn handle_response(&mut self, response: DiscoverResponse) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let section = session.section();
        match session.complete(response.request_id, response.result) {
            Completion::Loaded { page, stories } => {
                tracing::debug!(page, count = stories.len(), "discover page loaded");
                self.cancel_flag = None;
                self.view.append(page, &stories);
                self.stories.extend(stories);
            }
            Completion::Exhausted { page } => {
                tracing::debug!(page, "discover results exhausted");
                self.cancel_flag = None;
                if page == 1 {
                    self.view.empty(section);
                }
            }
            Completion::Failed { page, error } => {
                tracing::warn!(page, error = %error, "discover fetch failed");
                self.cancel_flag = None;
                self.view.failed(page, &error);
            }
            Completion::Stale => {
                tracing::debug!(request_id = response.request_id, "dropped stale discover response");
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{mock_story, MockDiscoverService};
    use anyhow::anyhow;
    use parking_lot::Mutex;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct RecordingView {
        events: Vec<String>,
    }

    impl DiscoverView for RecordingView {
        fn loading(&mut self, section: Section, page: u32) {
            self.events.push(format!("loading {} {}", section.as_str(), page));
        }

        fn append(&mut self, page: u32, stories: &[Story]) {
            self.events.push(format!("append {} {}", page, stories.len()));
        }

        fn empty(&mut self, section: Section) {
            self.events.push(format!("empty {}", section.as_str()));
        }

        fn failed(&mut self, page: u32, _error: &anyhow::Error) {
            self.events.push(format!("failed {}", page));
        }
    }

    fn session() -> DiscoverSession {
        DiscoverSession::new("42:abc", 42, vec![1, 2, 42], Section::Site)
    }

    #[test]
    fn labels_map_to_sections() {
        assert_eq!(Section::from_label("This site"), Section::Site);
        assert_eq!(Section::from_label("All sites"), Section::All);
        assert_eq!(Section::from_label("GLOBAL"), Section::Global);
        assert_eq!(Section::from_label("Tech blogs"), Section::Site);
        assert_eq!(Section::from_label(""), Section::Site);
    }

    #[test]
    fn section_control_lists_folders_between_site_and_all() {
        let labels = section_labels(&["Tech".into(), String::new()]);
        assert_eq!(labels, vec!["This site", "Tech", "All sites", "Global"]);
    }

    #[test]
    fn feed_filter_follows_section() {
        let mut s = session();
        assert_eq!(s.feed_ids(), vec![42]);
        s.switch_section(Section::All, 1);
        assert_eq!(s.feed_ids(), vec![1, 2, 42]);
        s.switch_section(Section::Global, 2);
        assert!(s.feed_ids().is_empty());
    }

    #[test]
    fn begin_load_is_gated_while_loading() {
        let mut s = session();
        let query = s.begin_load(1).unwrap();
        assert_eq!(query.page, 1);
        assert_eq!(query.similar_to_story_hash, "42:abc");
        assert!(s.is_loading());
        assert!(s.begin_load(2).is_none());
        assert!(s.begin_load(3).is_none());
    }

    #[test]
    fn empty_response_exhausts_without_advancing() {
        let mut s = session();
        s.begin_load(1).unwrap();
        let completion = s.complete(1, Ok(Vec::new()));
        assert!(matches!(completion, Completion::Exhausted { page: 1 }));
        assert_eq!(s.page(), 1);
        assert!(!s.has_more());
        assert!(!s.is_loading());
        assert!(s.begin_load(2).is_none());
    }

    #[test]
    fn non_empty_response_advances_one_page() {
        let mut s = session();
        s.begin_load(1).unwrap();
        let stories = vec![mock_story(1, "a"), mock_story(2, "b"), mock_story(3, "c")];
        let completion = s.complete(1, Ok(stories));
        assert!(matches!(completion, Completion::Loaded { page: 1, ref stories } if stories.len() == 3));
        assert_eq!(s.page(), 2);
        assert!(s.has_more());
        assert!(!s.is_loading());
        assert_eq!(s.begin_load(2).unwrap().page, 2);
    }

    #[test]
    fn failure_clears_loading_only() {
        let mut s = session();
        s.begin_load(1).unwrap();
        s.complete(1, Ok(vec![mock_story(1, "a")]));
        s.begin_load(2).unwrap();
        let completion = s.complete(2, Err(anyhow!("boom")));
        assert!(matches!(completion, Completion::Failed { page: 2, .. }));
        assert_eq!(s.page(), 2);
        assert!(s.has_more());
        assert!(!s.is_loading());
        assert_eq!(s.begin_load(3).unwrap().page, 2);
    }

    #[test]
    fn switch_resets_from_any_state() {
        let mut s = session();
        s.begin_load(1).unwrap();
        s.complete(1, Ok(vec![mock_story(1, "a")]));
        s.begin_load(2).unwrap();
        s.complete(2, Ok(Vec::new()));
        assert_eq!((s.page(), s.has_more()), (2, false));

        let query = s.switch_section(Section::All, 3).unwrap();
        assert_eq!(s.section(), Section::All);
        assert_eq!(s.page(), 1);
        assert!(s.has_more());
        assert!(s.is_loading());
        assert_eq!(query.page, 1);
        assert_eq!(query.feed_ids, vec![1, 2, 42]);
    }

    #[test]
    fn switch_while_loading_abandons_old_fetch() {
        let mut s = session();
        s.begin_load(1).unwrap();
        s.switch_section(Section::Global, 2).unwrap();
        assert!(matches!(
            s.complete(1, Ok(vec![mock_story(1, "old")])),
            Completion::Stale
        ));
        assert!(s.is_loading());
        assert!(matches!(
            s.complete(2, Ok(vec![mock_story(9, "new")])),
            Completion::Loaded { page: 1, .. }
        ));
    }

    #[test]
    fn controller_pages_until_exhausted() {
        let service = Arc::new(MockDiscoverService::with_pages(vec![
            vec![mock_story(42, "a"), mock_story(42, "b")],
            vec![mock_story(42, "c")],
        ]));
        let mut controller =
            DiscoverController::new(service.clone(), RecordingView::default(), Section::Site);
        controller.open("42:abc", 42, vec![42, 7]);
        assert!(!controller.load_more());
        assert!(controller.wait(WAIT));
        assert!(controller.load_more());
        assert!(controller.wait(WAIT));
        assert!(controller.load_more());
        assert!(controller.wait(WAIT));
        assert!(!controller.load_more());

        assert_eq!(controller.stories().len(), 3);
        let session = controller.session().unwrap();
        assert_eq!(session.page(), 3);
        assert!(!session.has_more());
        assert_eq!(
            controller.view().events,
            vec![
                "loading site 1",
                "append 1 2",
                "loading site 2",
                "append 2 1",
                "loading site 3",
            ]
        );
        let pages: Vec<_> = service.queries().iter().map(|q| q.page).collect();
        assert_eq!(pages, vec![1, 2, 3]);
    }

    #[test]
    fn controller_reports_empty_first_page() {
        let service = Arc::new(MockDiscoverService::default());
        let mut controller =
            DiscoverController::new(service, RecordingView::default(), Section::Global);
        controller.open("42:abc", 42, Vec::new());
        assert!(controller.wait(WAIT));
        assert_eq!(
            controller.view().events,
            vec!["loading global 1", "empty global"]
        );
        assert!(!controller.session().unwrap().has_more());
    }

    #[test]
    fn controller_retries_failed_page() {
        let service = Arc::new(MockDiscoverService::with_pages(vec![vec![mock_story(
            42, "a",
        )]]));
        service.fail_once(1);
        let mut controller =
            DiscoverController::new(service, RecordingView::default(), Section::Site);
        controller.open("42:abc", 42, Vec::new());
        assert!(controller.wait(WAIT));
        assert!(controller.stories().is_empty());
        assert!(controller.load_more());
        assert!(controller.wait(WAIT));
        assert_eq!(controller.stories().len(), 1);
        assert_eq!(
            controller.view().events,
            vec!["loading site 1", "failed 1", "loading site 1", "append 1 1"]
        );
    }

    struct GatedService {
        gate: Receiver<()>,
        queries: Mutex<Vec<DiscoverQuery>>,
    }

    impl DiscoverService for GatedService {
        fn discover_stories(&self, query: DiscoverQuery) -> Result<Vec<Story>> {
            self.queries.lock().push(query.clone());
            let _ = self.gate.recv_timeout(WAIT);
            let feed = query.feed_ids.first().copied().unwrap_or(0);
            Ok(vec![mock_story(feed, "x")])
        }
    }

    #[test]
    fn section_switch_discards_in_flight_results() {
        let (release, gate) = unbounded();
        let service = Arc::new(GatedService {
            gate,
            queries: Mutex::new(Vec::new()),
        });
        let mut controller =
            DiscoverController::new(service.clone(), RecordingView::default(), Section::Site);
        controller.open("42:abc", 42, vec![42, 7]);
        controller.switch_section(Section::Global);
        assert!(controller.session().unwrap().is_loading());

        release.send(()).unwrap();
        release.send(()).unwrap();
        assert!(controller.wait(WAIT));
        controller.poll();

        let feeds: Vec<_> = controller.stories().iter().map(|s| s.story_feed_id).collect();
        assert_eq!(feeds, vec![0]);
        assert_eq!(controller.session().unwrap().section(), Section::Global);
        assert_eq!(controller.session().unwrap().page(), 2);
    }

    #[test]
    fn wait_skips_abandoned_responses() {
        let (release, gate) = unbounded();
        let service = Arc::new(GatedService {
            gate,
            queries: Mutex::new(Vec::new()),
        });
        let mut controller =
            DiscoverController::new(service, RecordingView::default(), Section::Site);
        controller.open("42:abc", 42, vec![42, 7]);
        controller.switch_section(Section::Global);

        // The site fetch finished before it saw its cancel flag.
        controller
            .response_tx
            .send(DiscoverResponse {
                request_id: 1,
                result: Ok(vec![mock_story(42, "old")]),
            })
            .unwrap();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            let _ = release.send(());
            let _ = release.send(());
        });

        assert!(controller.wait(WAIT));
        let session = controller.session().unwrap();
        assert!(!session.is_loading());
        assert_eq!(session.page(), 2);
        let feeds: Vec<_> = controller.stories().iter().map(|s| s.story_feed_id).collect();
        assert_eq!(feeds, vec![0]);
        assert!(controller.load_more());
    }

    #[test]
    fn wait_gives_up_when_only_stale_responses_arrive() {
        let (_release, gate) = unbounded();
        let service = Arc::new(GatedService {
            gate,
            queries: Mutex::new(Vec::new()),
        });
        let mut controller =
            DiscoverController::new(service, RecordingView::default(), Section::Site);
        controller.open("42:abc", 42, Vec::new());
        controller
            .response_tx
            .send(DiscoverResponse {
                request_id: 99,
                result: Ok(vec![mock_story(42, "old")]),
            })
            .unwrap();
        assert!(!controller.wait(Duration::from_millis(200)));
        assert!(controller.session().unwrap().is_loading());
        assert!(controller.stories().is_empty());
        assert!(!controller.poll());
    }

    #[test]
    fn close_drops_session_and_toggle_reopens() {
        let service = Arc::new(MockDiscoverService::with_pages(vec![vec![mock_story(
            42, "a",
        )]]));
        let mut controller =
            DiscoverController::new(service, RecordingView::default(), Section::Site);
        controller.toggle("42:abc", 42, Vec::new());
        assert!(controller.is_open());
        controller.toggle("42:abc", 42, Vec::new());
        assert!(!controller.is_open());
        assert!(!controller.wait(WAIT));
        controller.poll();
        assert!(controller.stories().is_empty());
        assert!(!controller.load_more());
    }
}
