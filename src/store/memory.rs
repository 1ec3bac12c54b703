use std::collections::HashMap;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::{into_chronological, SessionStore};
use crate::error::StoreError;
use crate::types::{
    default_session_name, Message, NewMessage, Session, SessionUpsert, SessionWithMessages,
};

type Clock = Box<dyn Fn() -> NaiveDateTime + Send + Sync>;

#[derive(Default)]
struct Tables {
    sessions: Vec<(u64, Session)>,
    messages: Vec<(u64, Message)>,
    next_seq: u64,
}

impl Tables {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Process-local store with the same semantics as [`super::PgSessionStore`].
///
/// Rows are stamped with a naive wall-clock from the injected clock, like the
/// database's `DEFAULT now()`.
pub struct MemorySessionStore {
    tables: RwLock<Tables>,
    clock: Clock,
    #[cfg(test)]
    fail_next_message_insert: AtomicBool,
    #[cfg(test)]
    fail_next_contact_update: AtomicBool,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::with_clock(|| Utc::now().naive_utc())
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: impl Fn() -> NaiveDateTime + Send + Sync + 'static) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            clock: Box::new(clock),
            #[cfg(test)]
            fail_next_message_insert: AtomicBool::new(false),
            #[cfg(test)]
            fail_next_contact_update: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn fail_next_message_insert(&self) {
        self.fail_next_message_insert.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn injected_insert_failure(&self) -> Result<(), StoreError> {
        if self.fail_next_message_insert.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Database("injected message insert failure".into()));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn injected_insert_failure(&self) -> Result<(), StoreError> {
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fail_next_contact_update(&self) {
        self.fail_next_contact_update.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn injected_contact_failure(&self) -> Result<(), StoreError> {
        if self.fail_next_contact_update.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Database("injected contact update failure".into()));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn injected_contact_failure(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn coalesce_contact_fields(&self, message: &NewMessage) -> Result<(), StoreError> {
        self.injected_contact_failure()?;
        self.upsert_session(&SessionUpsert {
            id: message.session_id.clone(),
            name: None,
            full_name: message.full_name.clone(),
            remote_address: message.remote_address.clone(),
        })
        .await?;
        Ok(())
    }

    fn sessions_newest_first(tables: &Tables) -> Vec<Session> {
        let mut rows = tables.sessions.clone();
        rows.sort_by(|(a_seq, a), (b_seq, b)| {
            b.created_at.cmp(&a.created_at).then(b_seq.cmp(a_seq))
        });
        rows.into_iter().map(|(_, session)| session).collect()
    }

    fn messages_newest_first(tables: &Tables, session_id: &str) -> Vec<Message> {
        let mut rows = tables
            .messages
            .iter()
            .filter(|(_, m)| m.session_id == session_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|(a_seq, a), (b_seq, b)| {
            b.created_at.cmp(&a.created_at).then(b_seq.cmp(a_seq))
        });
        rows.into_iter().map(|(_, message)| message).collect()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn upsert_session(&self, upsert: &SessionUpsert) -> Result<(), StoreError> {
        if upsert.id.trim().is_empty() {
            return Err(StoreError::Invalid("session id is required".into()));
        }

        let now = (self.clock)();
        let mut tables = self.tables.write();
        if let Some((_, existing)) = tables.sessions.iter_mut().find(|(_, s)| s.id == upsert.id) {
            if let Some(name) = &upsert.name {
                existing.name = name.clone();
            }
            if let Some(full_name) = &upsert.full_name {
                existing.full_name = Some(full_name.clone());
            }
            if let Some(remote_address) = &upsert.remote_address {
                existing.remote_address = Some(remote_address.clone());
            }
            return Ok(());
        }

        let seq = tables.seq();
        tables.sessions.push((
            seq,
            Session {
                id: upsert.id.clone(),
                name: upsert
                    .name
                    .clone()
                    .unwrap_or_else(|| default_session_name(&upsert.id)),
                full_name: upsert.full_name.clone(),
                remote_address: upsert.remote_address.clone(),
                created_at: now,
            },
        ));
        Ok(())
    }

    async fn append_message(&self, message: &NewMessage) -> Result<Message, StoreError> {
        self.upsert_session(&SessionUpsert::new(message.session_id.clone()))
            .await?;

        self.injected_insert_failure()?;

        let stored = Message {
            id: Uuid::new_v4().to_string(),
            session_id: message.session_id.clone(),
            role: message.role,
            content: message.content.clone(),
            content_type: message.content_type,
            media_ref: message.media_ref.clone(),
            created_at: (self.clock)(),
        };
        {
            let mut tables = self.tables.write();
            let seq = tables.seq();
            tables.messages.push((seq, stored.clone()));
        }

        // The message is already stored; a failed contact update only loses
        // the coalesced fields.
        if message.full_name.is_some() || message.remote_address.is_some() {
            if let Err(err) = self.coalesce_contact_fields(message).await {
                tracing::error!(
                    session_id = %message.session_id,
                    error = %err,
                    "failed to update session contact fields"
                );
            }
        }

        Ok(stored)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .sessions
            .iter()
            .find(|(_, s)| s.id == session_id)
            .map(|(_, s)| s.clone()))
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let tables = self.tables.read();
        Ok(Self::sessions_newest_first(&tables))
    }

    async fn list_sessions_with_recent_messages(
        &self,
        limit: usize,
    ) -> Result<Vec<SessionWithMessages>, StoreError> {
        let tables = self.tables.read();
        let mut windows = HashMap::new();
        for session in &tables.sessions {
            let mut newest = Self::messages_newest_first(&tables, &session.1.id);
            newest.truncate(limit);
            windows.insert(session.1.id.clone(), newest);
        }

        Ok(Self::sessions_newest_first(&tables)
            .into_iter()
            .map(|session| {
                let messages = windows.remove(&session.id).unwrap_or_default();
                SessionWithMessages {
                    session,
                    messages: into_chronological(messages),
                }
            })
            .collect())
    }

    async fn list_messages_by_session(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        if session_id.trim().is_empty() {
            return Ok(Vec::new());
        }
        let tables = self.tables.read();
        Ok(into_chronological(Self::messages_newest_first(
            &tables, session_id,
        )))
    }
}
