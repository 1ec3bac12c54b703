use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use super::{into_chronological, SessionStore};
use crate::error::StoreError;
use crate::types::{
    default_session_name, ContentType, Message, NewMessage, Role, Session, SessionUpsert,
    SessionWithMessages,
};

const MESSAGE_COLUMNS: &str =
    "id, session_id, role, content, content_type, image_url, created_at";
const SESSION_COLUMNS: &str = "id, name, nome_completo, remote_jid, created_at";

/// Sessions and messages in Postgres, in the table layout the webhook
/// producer writes to.
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn coalesce_contact_fields(&self, message: &NewMessage) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sessions SET
                nome_completo = COALESCE($2, nome_completo),
                remote_jid = COALESCE($3, remote_jid)
            WHERE id = $1
            "#,
        )
        .bind(&message.session_id)
        .bind(&message.full_name)
        .bind(&message.remote_address)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn session_from_row(row: &PgRow) -> Result<Session, StoreError> {
    let id: String = row.try_get("id")?;
    let name = row
        .try_get::<Option<String>, _>("name")?
        .unwrap_or_else(|| default_session_name(&id));
    Ok(Session {
        name,
        full_name: row.try_get("nome_completo")?,
        remote_address: row.try_get("remote_jid")?,
        created_at: row
            .try_get::<Option<NaiveDateTime>, _>("created_at")?
            .unwrap_or_default(),
        id,
    })
}

fn message_from_row(row: &PgRow) -> Result<Message, StoreError> {
    Ok(Message {
        id: row.try_get("id")?,
        session_id: row
            .try_get::<Option<String>, _>("session_id")?
            .unwrap_or_default(),
        role: Role::from_db(
            row.try_get::<Option<String>, _>("role")?
                .as_deref()
                .unwrap_or_default(),
        ),
        content: row
            .try_get::<Option<String>, _>("content")?
            .unwrap_or_default(),
        content_type: ContentType::from_db(
            row.try_get::<Option<String>, _>("content_type")?
                .as_deref()
                .unwrap_or_default(),
        ),
        media_ref: row.try_get("image_url")?,
        created_at: row
            .try_get::<Option<NaiveDateTime>, _>("created_at")?
            .unwrap_or_default(),
    })
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn upsert_session(&self, upsert: &SessionUpsert) -> Result<(), StoreError> {
        if upsert.id.trim().is_empty() {
            return Err(StoreError::Invalid("session id is required".into()));
        }

        // The default name only applies to a fresh row; $2 is referenced
        // directly on conflict so it never overwrites a stored name.
        sqlx::query(
            r#"
            INSERT INTO sessions (id, name, nome_completo, remote_jid)
            VALUES ($1, COALESCE($2, $5), $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                name = COALESCE($2, sessions.name),
                nome_completo = COALESCE($3, sessions.nome_completo),
                remote_jid = COALESCE($4, sessions.remote_jid)
            "#,
        )
        .bind(&upsert.id)
        .bind(&upsert.name)
        .bind(&upsert.full_name)
        .bind(&upsert.remote_address)
        .bind(default_session_name(&upsert.id))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_message(&self, message: &NewMessage) -> Result<Message, StoreError> {
        self.upsert_session(&SessionUpsert::new(message.session_id.clone()))
            .await?;

        let row = sqlx::query(&format!(
            "INSERT INTO messages (id, session_id, role, content, content_type, image_url) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&message.session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.content_type.as_str())
        .bind(&message.media_ref)
        .fetch_one(&self.pool)
        .await?;
        let stored = message_from_row(&row)?;

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
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY created_at DESC NULLS LAST"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn list_sessions_with_recent_messages(
        &self,
        limit: usize,
    ) -> Result<Vec<SessionWithMessages>, StoreError> {
        let sessions = self.list_sessions().await?;

        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM ( \
                 SELECT m.*, ROW_NUMBER() OVER ( \
                     PARTITION BY m.session_id ORDER BY m.created_at DESC NULLS LAST, m.id DESC \
                 ) AS rn \
                 FROM messages m \
             ) ranked \
             WHERE rn <= $1 \
             ORDER BY session_id, created_at DESC NULLS LAST, id DESC"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut windows: HashMap<String, Vec<Message>> = HashMap::new();
        for row in &rows {
            let message = message_from_row(row)?;
            windows
                .entry(message.session_id.clone())
                .or_default()
                .push(message);
        }

        Ok(sessions
            .into_iter()
            .map(|session| {
                let newest = windows.remove(&session.id).unwrap_or_default();
                SessionWithMessages {
                    session,
                    messages: into_chronological(newest),
                }
            })
            .collect())
    }

    async fn list_messages_by_session(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        if session_id.trim().is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = $1 \
             ORDER BY created_at ASC NULLS FIRST, id ASC"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    //! These run against a scratch database named by `TEST_DATABASE_URL` and
    //! return early when it is unset.

    use super::*;

    async fn store() -> Option<PgSessionStore> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let store = PgSessionStore::connect(&url, 2).await.ok()?;
        store.migrate().await.ok()?;
        Some(store)
    }

    fn unique(prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::new_v4())
    }

    #[tokio::test]
    async fn upsert_coalesces() {
        let Some(store) = store().await else { return };
        let id = unique("coalesce");
        store.upsert_session(&SessionUpsert::new(&id).name("A")).await.unwrap();
        store
            .upsert_session(&SessionUpsert::new(&id).full_name("B"))
            .await
            .unwrap();
        let session = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(session.name, "A");
        assert_eq!(session.full_name.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn append_round_trip_and_window() {
        let Some(store) = store().await else { return };
        let id = unique("window");
        let mut ids = Vec::new();
        for i in 0..5 {
            let m = store
                .append_message(&NewMessage::text(&id, Role::User, format!("m{i}")))
                .await
                .unwrap();
            ids.push(m.id);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let all = store.list_messages_by_session(&id).await.unwrap();
        assert_eq!(all.iter().map(|m| m.id.clone()).collect::<Vec<_>>(), ids);
        assert_eq!(all[0].content, "m0");
        assert_eq!(all[0].role, Role::User);
        assert_eq!(all[0].content_type, ContentType::Text);

        let listing = store.list_sessions_with_recent_messages(2).await.unwrap();
        let ours = listing.iter().find(|s| s.session.id == id).unwrap();
        assert_eq!(
            ours.messages.iter().map(|m| m.id.clone()).collect::<Vec<_>>(),
            ids[3..].to_vec()
        );
        assert!(store.list_messages_by_session(&unique("missing")).await.unwrap().is_empty());
    }
}
