//! Dashboard Reconciliation Loop.
//!
//! The displayed state is always a full re-fetch of the session listing. A
//! refresh runs on every application event and on a fixed timer; refreshes
//! may overlap and the last one to finish wins.

use std::{
    collections::{BTreeSet, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, LazyLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tokio::sync::{mpsc, watch};

use crate::error::FetchError;
use crate::frame::{Frame, FrameKind};
use crate::store::SessionStore;
use crate::timestamp::{normalize_stored, to_date_bucket, to_display_string};
use crate::types::{
    default_session_name, non_blank, ContentType, Message, Role, Session, SessionWithMessages,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const SEEN_EVENT_CAPACITY: usize = 1024;
const DATA_URL_IMAGE_PREFIX: &str = "data:image/";
const BARE_BASE64_PREFIX: &str = "data:image/png;base64,";

static NAME_WORD: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-zÀ-ÖØ-öø-ÿ'\-\s]{2,60}$").ok());
static BARE_BASE64: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9+/=]+$").ok());

/// Where the dashboard gets the session listing from.
#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn fetch_sessions(&self) -> Result<Vec<SessionWithMessages>, FetchError>;
}

/// `GET {api}/api/session` on a running server.
pub struct HttpSessionSource {
    client: reqwest::Client,
    url: String,
}

impl HttpSessionSource {
    pub fn new(api_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/api/session", api_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl SessionSource for HttpSessionSource {
    async fn fetch_sessions(&self) -> Result<Vec<SessionWithMessages>, FetchError> {
        let listing = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<SessionWithMessages>>()
            .await?;
        Ok(listing)
    }
}

/// Reads the store directly, for a dashboard living in the server process.
pub struct StoreSessionSource {
    store: Arc<dyn SessionStore>,
    limit: usize,
}

impl StoreSessionSource {
    pub fn new(store: Arc<dyn SessionStore>, limit: usize) -> Self {
        Self { store, limit }
    }
}

#[async_trait]
impl SessionSource for StoreSessionSource {
    async fn fetch_sessions(&self) -> Result<Vec<SessionWithMessages>, FetchError> {
        Ok(self.store.list_sessions_with_recent_messages(self.limit).await?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageView {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub content_type: ContentType,
    pub media_ref: Option<String>,
    pub at: Option<DateTime<Utc>>,
}

impl MessageView {
    pub fn from_message(message: Message) -> Self {
        let (content_type, media_ref) = normalize_media(message.content_type, message.media_ref);
        Self {
            at: normalize_stored(message.created_at),
            id: message.id,
            role: message.role,
            content: message.content,
            content_type,
            media_ref,
        }
    }

    pub fn day(&self) -> Option<String> {
        to_date_bucket(self.at)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub session_id: String,
    pub display_name: String,
    pub full_name: Option<String>,
    pub remote_address: Option<String>,
    pub messages: Vec<MessageView>,
    pub message_count: usize,
    pub last_activity: Option<DateTime<Utc>>,
}

impl SessionView {
    pub fn build(listing: SessionWithMessages) -> Self {
        let SessionWithMessages { session, messages } = listing;
        let messages: Vec<MessageView> = messages.into_iter().map(MessageView::from_message).collect();
        let inferred = infer_name(&messages);
        let full_name = non_blank(session.full_name);
        let display_name = full_name
            .clone()
            .or_else(|| inferred.clone())
            .or_else(|| Some(session.name.clone()).filter(|n| !n.trim().is_empty()))
            .unwrap_or_else(|| fallback_name(&session.id));

        let mut view = Self {
            session_id: session.id,
            display_name,
            full_name: full_name.or(inferred),
            remote_address: session.remote_address,
            messages,
            message_count: 0,
            last_activity: None,
        };
        view.recount();
        view
    }

    fn recount(&mut self) {
        self.message_count = self.messages.len();
        self.last_activity = self.messages.last().and_then(|m| m.at);
    }

    pub fn last_activity_label(&self) -> String {
        to_display_string(self.last_activity)
    }

    fn has_message_between(&self, start: Option<&str>, end: Option<&str>) -> bool {
        self.messages.iter().filter_map(MessageView::day).any(|day| {
            start.map_or(true, |s| day.as_str() >= s) && end.map_or(true, |e| day.as_str() <= e)
        })
    }
}

fn fallback_name(session_id: &str) -> String {
    default_session_name(&session_id.chars().take(8).collect::<String>())
}

/// Newest user message that looks like a person's name: one to three words
/// of letters, apostrophes and hyphens, 2..=60 characters overall.
pub fn infer_name(messages: &[MessageView]) -> Option<String> {
    let word = NAME_WORD.as_ref()?;
    messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.trim())
        .find(|text| {
            let words: Vec<&str> = text.split_whitespace().collect();
            let len = text.chars().count();
            (2..=60).contains(&len)
                && (1..=3).contains(&words.len())
                && words.iter().all(|w| word.is_match(w))
        })
        .map(str::to_string)
}

/// Inline images arrive either as data URLs or as bare base64; both are shown
/// as images, the bare form gaining a PNG data-URL prefix.
pub fn normalize_media(content_type: ContentType, media_ref: Option<String>) -> (ContentType, Option<String>) {
    match media_ref {
        Some(media) if media.starts_with(DATA_URL_IMAGE_PREFIX) => (ContentType::Image, Some(media)),
        Some(media) if BARE_BASE64.as_ref().is_some_and(|re| re.is_match(&media)) => {
            (ContentType::Image, Some(format!("{BARE_BASE64_PREFIX}{media}")))
        }
        other => (content_type, other),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Order by last activity; sessions without any count as the epoch.
pub fn sort_views(views: &mut [SessionView], order: SortOrder) {
    let key = |v: &SessionView| v.last_activity.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    match order {
        SortOrder::NewestFirst => views.sort_by(|a, b| key(b).cmp(&key(a))),
        SortOrder::OldestFirst => views.sort_by_key(key),
    }
}

/// Case-insensitive text search over display name and id, plus an inclusive
/// calendar-day range (`YYYY-MM-DD` buckets) that at least one message must
/// fall in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewFilter {
    pub search: String,
    pub start_day: Option<String>,
    pub end_day: Option<String>,
}

impl ViewFilter {
    pub fn matches(&self, view: &SessionView) -> bool {
        let needle = self.search.trim().to_lowercase();
        if !needle.is_empty()
            && !view.display_name.to_lowercase().contains(&needle)
            && !view.session_id.to_lowercase().contains(&needle)
        {
            return false;
        }

        if self.start_day.is_none() && self.end_day.is_none() {
            return true;
        }
        view.has_message_between(self.start_day.as_deref(), self.end_day.as_deref())
    }

    pub fn apply<'a>(&self, views: &'a [SessionView]) -> Vec<&'a SessionView> {
        views.iter().filter(|v| self.matches(v)).collect()
    }
}

/// Every day that has at least one message, oldest first.
pub fn available_days(views: &[SessionView]) -> Vec<String> {
    views
        .iter()
        .flat_map(|v| v.messages.iter().filter_map(MessageView::day))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Sessions active after `last_seen`.
pub fn unread_count(views: &[SessionView], last_seen: DateTime<Utc>) -> usize {
    views
        .iter()
        .filter(|v| v.last_activity.is_some_and(|at| at > last_seen))
        .count()
}

/// Bounded memory of event ids already applied.
#[derive(Default)]
struct SeenEvents {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenEvents {
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == SEEN_EVENT_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}

pub struct Dashboard {
    source: Arc<dyn SessionSource>,
    sessions: RwLock<Vec<SessionView>>,
    filter: ViewFilter,
    seen: Mutex<SeenEvents>,
    last_seen: Mutex<Option<DateTime<Utc>>>,
    refreshes: AtomicU64,
}

impl Dashboard {
    pub fn new(source: Arc<dyn SessionSource>) -> Self {
        Self {
            source,
            sessions: RwLock::new(Vec::new()),
            filter: ViewFilter::default(),
            seen: Mutex::new(SeenEvents::default()),
            last_seen: Mutex::new(None),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Restrict what [`Dashboard::visible`] and the refresh log show. The
    /// full listing is still kept for merges and unread counts.
    pub fn with_filter(mut self, filter: ViewFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Re-fetch the listing and replace the displayed state with it.
    pub async fn refresh(&self) -> Result<usize, FetchError> {
        let listing = self.source.fetch_sessions().await?;
        let mut views: Vec<SessionView> = listing.into_iter().map(SessionView::build).collect();
        sort_views(&mut views, SortOrder::NewestFirst);

        let count = views.len();
        let unread = self.last_seen.lock().map(|seen| unread_count(&views, seen));
        let shown = self.filter.apply(&views);
        let days = available_days(&views);
        for view in &shown {
            tracing::debug!(
                session_id = %view.session_id,
                name = %view.display_name,
                messages = view.message_count,
                last_activity = %view.last_activity_label(),
                "session"
            );
        }
        let shown_count = shown.len();
        *self.sessions.write() = views;
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            sessions = count,
            shown = shown_count,
            unread,
            first_day = days.first().map(String::as_str),
            last_day = days.last().map(String::as_str),
            "dashboard reconciled"
        );
        Ok(count)
    }

    pub fn sessions(&self) -> Vec<SessionView> {
        self.sessions.read().clone()
    }

    /// Displayed sessions that pass the filter.
    pub fn visible(&self) -> Vec<SessionView> {
        let sessions = self.sessions.read();
        self.filter.apply(&sessions).into_iter().cloned().collect()
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    pub fn mark_seen(&self, at: DateTime<Utc>) {
        *self.last_seen.lock() = Some(at);
    }

    pub fn unread(&self) -> usize {
        match *self.last_seen.lock() {
            Some(seen) => unread_count(&self.sessions.read(), seen),
            None => 0,
        }
    }

    /// Apply one inbound frame. Returns whether a refresh should follow:
    /// protocol frames and redeliveries of an already-seen event do not.
    pub fn apply_event(&self, frame: &Frame) -> bool {
        if frame.kind.is_protocol() {
            return false;
        }
        // Only a message id names one immutable event. A session id repeats
        // across distinct updates, so those always refresh.
        if frame.kind == FrameKind::Message {
            if let Some(id) = frame.event_id() {
                if !self.seen.lock().insert(id) {
                    tracing::debug!(message_id = id, "skipping redelivered message");
                    return false;
                }
            }
            let message = frame
                .data
                .clone()
                .and_then(|data| serde_json::from_value::<Message>(data).ok());
            if let Some(message) = message {
                self.merge_message(message);
            }
        }
        true
    }

    /// Show a pushed message before the next refresh lands. A message already
    /// on display is left alone.
    pub fn merge_message(&self, message: Message) -> bool {
        let mut sessions = self.sessions.write();
        let index = match sessions.iter().position(|v| v.session_id == message.session_id) {
            Some(index) => index,
            None => {
                sessions.push(SessionView::build(SessionWithMessages {
                    session: Session {
                        id: message.session_id.clone(),
                        name: default_session_name(&message.session_id),
                        full_name: None,
                        remote_address: None,
                        created_at: message.created_at,
                    },
                    messages: Vec::new(),
                }));
                sessions.len() - 1
            }
        };

        let view = &mut sessions[index];
        if view.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        view.messages.push(MessageView::from_message(message));
        view.recount();
        sort_views(&mut sessions, SortOrder::NewestFirst);
        true
    }

    fn spawn_refresh(self: &Arc<Self>, trigger: &'static str) {
        let dashboard = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = dashboard.refresh().await {
                tracing::warn!(trigger, error = %err, "dashboard refresh failed");
            }
        });
    }

    /// Refresh on every application event from `events` and on each tick of
    /// `poll_interval`, until `shutdown` flips or the event source goes away.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<Frame>,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.spawn_refresh("timer"),
                event = events.recv() => match event {
                    Some(frame) => {
                        if self.apply_event(&frame) {
                            self.spawn_refresh("event");
                        }
                    }
                    None => break,
                },
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            }
        }
        tracing::info!("dashboard loop stopped");
    }
}
