//! Persistence Layer: sessions and their messages.
//!
//! Writes are idempotent upserts/appends. `append_message` is two sequential
//! writes (session row, then message row) and is not transactional: if the
//! message insert fails the session row stays behind, so readers must accept
//! sessions with zero messages.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{Message, NewMessage, Session, SessionUpsert, SessionWithMessages};

pub mod memory;
pub mod postgres;

pub use memory::MemorySessionStore;
pub use postgres::PgSessionStore;

/// Messages shown per session in the session listing unless asked otherwise.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert-or-merge. `None` fields preserve what is stored.
    async fn upsert_session(&self, upsert: &SessionUpsert) -> Result<(), StoreError>;

    /// Ensure the session exists, insert the message, then coalesce the
    /// optional contact fields onto the session row.
    async fn append_message(&self, message: &NewMessage) -> Result<Message, StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    /// All sessions, newest first, without messages.
    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError>;

    /// All sessions, newest first, each with its last `limit` messages in
    /// chronological order.
    async fn list_sessions_with_recent_messages(
        &self,
        limit: usize,
    ) -> Result<Vec<SessionWithMessages>, StoreError>;

    /// Every message of a session, oldest first. Unknown or blank ids yield
    /// an empty list.
    async fn list_messages_by_session(&self, session_id: &str) -> Result<Vec<Message>, StoreError>;
}

/// Turn a newest-first window into chronological order. Messages sharing a
/// timestamp keep their relative storage order, reversed.
pub(crate) fn into_chronological(mut newest_first: Vec<Message>) -> Vec<Message> {
    newest_first.reverse();
    newest_first.sort_by_key(|m| m.created_at);
    newest_first
}
