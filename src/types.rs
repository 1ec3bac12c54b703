use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::hub::Hub;
use crate::store::SessionStore;

/// Name given to a session row the first time it is written without one.
pub fn default_session_name(session_id: &str) -> String {
    format!("Session {session_id}")
}

/// Treat blank strings the same as absent ones.
pub fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Stored rows written by other producers may carry anything; unknown
    /// authors are shown as the assistant.
    pub fn from_db(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Role::User,
            _ => Role::Assistant,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Image,
    File,
    Audio,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Image => "image",
            ContentType::File => "file",
            ContentType::Audio => "audio",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "image" => ContentType::Image,
            "file" => ContentType::File,
            "audio" => ContentType::Audio,
            _ => ContentType::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub name: String,
    #[serde(default, alias = "nome_completo")]
    pub full_name: Option<String>,
    #[serde(default, alias = "remote_jid")]
    pub remote_address: Option<String>,
    #[serde(alias = "created_at")]
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(alias = "session_id")]
    pub session_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, alias = "content_type")]
    pub content_type: ContentType,
    #[serde(default, alias = "imageUrl", alias = "image_url")]
    pub media_ref: Option<String>,
    #[serde(alias = "created_at")]
    pub created_at: NaiveDateTime,
}

/// A session together with (a window of) its messages, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionWithMessages {
    #[serde(flatten)]
    pub session: Session,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Insert-or-merge of a session row. `None` fields leave stored values alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionUpsert {
    pub id: String,
    pub name: Option<String>,
    pub full_name: Option<String>,
    pub remote_address: Option<String>,
}

impl SessionUpsert {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn full_name(mut self, full_name: impl Into<String>) -> Self {
        self.full_name = Some(full_name.into());
        self
    }

    pub fn remote_address(mut self, remote_address: impl Into<String>) -> Self {
        self.remote_address = Some(remote_address.into());
        self
    }
}

/// A message to append. The session row is upserted first.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub content_type: ContentType,
    pub media_ref: Option<String>,
    pub full_name: Option<String>,
    pub remote_address: Option<String>,
}

impl NewMessage {
    pub fn text(session_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            role,
            content: content.into(),
            content_type: ContentType::Text,
            media_ref: None,
            full_name: None,
            remote_address: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertSessionBody {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "nome_completo")]
    pub full_name: Option<String>,
    #[serde(default, alias = "remote_jid")]
    pub remote_address: Option<String>,
}

impl UpsertSessionBody {
    pub fn into_upsert(self) -> Option<SessionUpsert> {
        let id = non_blank(self.id)?;
        Some(SessionUpsert {
            id: id.trim().to_string(),
            name: non_blank(self.name),
            full_name: non_blank(self.full_name),
            remote_address: non_blank(self.remote_address),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendMessageBody {
    #[serde(default, alias = "session_id")]
    pub session_id: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, alias = "content_type")]
    pub content_type: ContentType,
    #[serde(default, alias = "imageUrl", alias = "image_url")]
    pub media_ref: Option<String>,
    #[serde(default, alias = "nome_completo")]
    pub full_name: Option<String>,
    #[serde(default, alias = "remote_jid")]
    pub remote_address: Option<String>,
}

impl AppendMessageBody {
    /// `path_session_id` wins over the body's own `sessionId`.
    pub fn into_new_message(self, path_session_id: Option<String>) -> Option<NewMessage> {
        let session_id = non_blank(path_session_id).or_else(|| non_blank(self.session_id))?;
        Some(NewMessage {
            session_id: session_id.trim().to_string(),
            role: self.role,
            content: self.content,
            content_type: self.content_type,
            media_ref: non_blank(self.media_ref),
            full_name: non_blank(self.full_name),
            remote_address: non_blank(self.remote_address),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionListQuery {
    pub limit: Option<usize>,
}

pub struct AppState {
    pub store: Arc<dyn SessionStore>,
    pub hub: Arc<Hub>,
    pub history_limit: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn upsert_body_accepts_producer_field_names() {
        let body: UpsertSessionBody = serde_json::from_value(json!({
            "id": "s1",
            "nome_completo": "Maria Silva",
            "remote_jid": "5511999999999@s.whatsapp.net"
        }))
        .unwrap();
        let upsert = body.into_upsert().unwrap();
        assert_eq!(upsert.id, "s1");
        assert_eq!(upsert.name, None);
        assert_eq!(upsert.full_name.as_deref(), Some("Maria Silva"));
        assert_eq!(upsert.remote_address.as_deref(), Some("5511999999999@s.whatsapp.net"));
    }

    #[test]
    fn upsert_body_without_id_is_rejected() {
        let body: UpsertSessionBody = serde_json::from_value(json!({ "name": "x" })).unwrap();
        assert!(body.into_upsert().is_none());
        let body: UpsertSessionBody = serde_json::from_value(json!({ "id": "  " })).unwrap();
        assert!(body.into_upsert().is_none());
    }

    #[test]
    fn append_body_blank_optionals_become_none() {
        let body: AppendMessageBody = serde_json::from_value(json!({
            "sessionId": "s1",
            "role": "user",
            "content": "oi",
            "imageUrl": "",
            "fullName": " "
        }))
        .unwrap();
        let message = body.into_new_message(None).unwrap();
        assert_eq!(message.session_id, "s1");
        assert_eq!(message.content_type, ContentType::Text);
        assert_eq!(message.media_ref, None);
        assert_eq!(message.full_name, None);
    }

    #[test]
    fn append_body_path_id_wins() {
        let body: AppendMessageBody = serde_json::from_value(json!({
            "session_id": "from-body",
            "role": "assistant",
            "content": "olá",
            "content_type": "image",
            "image_url": "https://cdn.example/x.png"
        }))
        .unwrap();
        let message = body.into_new_message(Some("from-path".into())).unwrap();
        assert_eq!(message.session_id, "from-path");
        assert_eq!(message.content_type, ContentType::Image);
        assert_eq!(message.media_ref.as_deref(), Some("https://cdn.example/x.png"));
    }

    #[test]
    fn unknown_db_values_fall_back() {
        assert_eq!(Role::from_db("USER"), Role::User);
        assert_eq!(Role::from_db("bot"), Role::Assistant);
        assert_eq!(ContentType::from_db("video"), ContentType::Text);
        assert_eq!(ContentType::from_db("audio"), ContentType::Audio);
    }
}
