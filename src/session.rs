//! Session state and persistence
//!
//! A session is the durable per-conversation state: the optional
//! in-flight command, the three model selections, and both history
//! logs. Sessions are created lazily with defaults on the first event
//! for a chat, loaded before every event and saved after it, so a
//! single event is the unit of consistency.
//!
//! Storage is a SQLite key/value table (chat id -> JSON blob) with
//! last-write-wins per key. No business logic lives here.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::history::ChatMessage;
use crate::models::{
    default_code_model, default_image_model, default_text_model, ModelClass, ModelRef,
};

/// An in-flight multi-step command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentCommand {
    pub id: String,
    pub step: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcommand: Option<String>,
}

impl CurrentCommand {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step: 0,
            subcommand: None,
        }
    }
}

/// The three independent model slots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSelection {
    pub text: ModelRef,
    pub code: ModelRef,
    pub image: ModelRef,
}

impl Default for ModelSelection {
    fn default() -> Self {
        Self {
            text: default_text_model(),
            code: default_code_model(),
            image: default_image_model(),
        }
    }
}

impl ModelSelection {
    pub fn get(&self, class: ModelClass) -> &ModelRef {
        match class {
            ModelClass::Text => &self.text,
            ModelClass::Code => &self.code,
            ModelClass::Image => &self.image,
        }
    }

    /// Replace one slot wholesale; the other two are untouched.
    pub fn set(&mut self, class: ModelClass, model: ModelRef) {
        match class {
            ModelClass::Text => self.text = model,
            ModelClass::Code => self.code = model,
            ModelClass::Image => self.image = model,
        }
    }
}

/// Durable per-conversation state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Session {
    pub current_command: Option<CurrentCommand>,
    pub models: ModelSelection,
    pub text_history: Vec<ChatMessage>,
    pub code_history: Vec<ChatMessage>,
    /// Transient cache populated during an active model-selection
    /// command, cleared whenever the command ends.
    pub available_models: Vec<ModelRef>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            current_command: None,
            models: ModelSelection::default(),
            text_history: Vec::new(),
            code_history: Vec::new(),
            available_models: Vec::new(),
        }
    }
}

impl Session {
    /// Only the text and code classes keep logs; photo messages land
    /// in the text log, so the image arm is never reached in practice.
    pub fn history(&self, class: ModelClass) -> &Vec<ChatMessage> {
        match class {
            ModelClass::Code => &self.code_history,
            _ => &self.text_history,
        }
    }

    pub fn history_mut(&mut self, class: ModelClass) -> &mut Vec<ChatMessage> {
        match class {
            ModelClass::Code => &mut self.code_history,
            _ => &mut self.text_history,
        }
    }

    /// Drop the active command and its transient model cache
    pub fn clear_command(&mut self) {
        self.current_command = None;
        self.available_models.clear();
    }
}

/// Session store with SQLite backend
pub struct SessionStore {
    conn: Connection,
}

impl SessionStore {
    /// Open or create the session database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;

        info!("Session store opened: {}", path.display());
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                chat_id INTEGER PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL DEFAULT (unixepoch())
            );
            "#,
        )?;
        Ok(())
    }

    /// Load the session for a chat, or a default one if absent.
    /// A corrupt row is treated as absent so one bad blob cannot
    /// wedge a conversation.
    pub fn load(&self, chat_id: i64) -> Result<Session> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM sessions WHERE chat_id = ?1",
                params![chat_id],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(json) => match serde_json::from_str(&json) {
                Ok(session) => Ok(session),
                Err(e) => {
                    warn!("Discarding corrupt session for chat {}: {}", chat_id, e);
                    Ok(Session::default())
                }
            },
            None => {
                debug!("No session for chat {}, using defaults", chat_id);
                Ok(Session::default())
            }
        }
    }

    /// Persist the session for a chat (upsert, last write wins)
    pub fn save(&self, chat_id: i64, session: &Session) -> Result<()> {
        let json = serde_json::to_string(session)?;
        let now = chrono::Utc::now().timestamp();

        self.conn.execute(
            "INSERT INTO sessions (chat_id, data, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(chat_id) DO UPDATE SET data = ?2, updated_at = ?3",
            params![chat_id, json, now],
        )?;

        debug!("Saved session for chat {}", chat_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::ChatMessage;
    use std::path::PathBuf;

    fn temp_store(name: &str) -> SessionStore {
        let path = PathBuf::from(format!("/tmp/rambobot_session_test_{}.db", name));
        let _ = std::fs::remove_file(&path);
        SessionStore::open(&path).unwrap()
    }

    #[test]
    fn test_load_absent_returns_default() {
        let store = temp_store("default");
        let session = store.load(1).unwrap();
        assert!(session.current_command.is_none());
        assert!(session.text_history.is_empty());
        assert_eq!(session.models.text.id, "llama-4-maverick-17b");
        assert_eq!(session.models.code.id, "deepseek-coder-v2-lite");
        assert_eq!(session.models.image.id, "venice-sd35");
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let store = temp_store("roundtrip");
        let mut session = Session::default();
        session.current_command = Some(CurrentCommand {
            id: "config".to_string(),
            step: 1,
            subcommand: Some("text".to_string()),
        });
        session.text_history.push(ChatMessage::user("hello"));
        session.code_history.push(ChatMessage::user("fn main() {}"));

        store.save(42, &session).unwrap();
        let loaded = store.load(42).unwrap();

        assert_eq!(loaded.current_command, session.current_command);
        assert_eq!(loaded.text_history, session.text_history);
        assert_eq!(loaded.code_history, session.code_history);
    }

    #[test]
    fn test_save_overwrites() {
        let store = temp_store("overwrite");
        let mut session = Session::default();
        session.text_history.push(ChatMessage::user("v1"));
        store.save(7, &session).unwrap();

        session.text_history.push(ChatMessage::user("v2"));
        store.save(7, &session).unwrap();

        let loaded = store.load(7).unwrap();
        assert_eq!(loaded.text_history.len(), 2);
    }

    #[test]
    fn test_corrupt_row_falls_back_to_default() {
        let store = temp_store("corrupt");
        store
            .conn
            .execute(
                "INSERT INTO sessions (chat_id, data, updated_at) VALUES (9, 'not json', 0)",
                [],
            )
            .unwrap();

        let session = store.load(9).unwrap();
        assert!(session.current_command.is_none());
    }

    #[test]
    fn test_sessions_keyed_independently() {
        let store = temp_store("keys");
        let mut a = Session::default();
        a.text_history.push(ChatMessage::user("chat a"));
        store.save(1, &a).unwrap();

        let b = store.load(2).unwrap();
        assert!(b.text_history.is_empty());
    }

    #[test]
    fn test_model_selection_independent() {
        let mut models = ModelSelection::default();
        let code_before = models.code.id.clone();
        let image_before = models.image.id.clone();

        models.set(
            ModelClass::Text,
            ModelRef {
                id: "mistral-31-24b".to_string(),
                model_type: crate::models::ModelType::Text,
                model_spec: Default::default(),
            },
        );

        assert_eq!(models.text.id, "mistral-31-24b");
        assert_eq!(models.code.id, code_before);
        assert_eq!(models.image.id, image_before);
    }

    #[test]
    fn test_clear_command_drops_model_cache() {
        let mut session = Session::default();
        session.current_command = Some(CurrentCommand::new("config"));
        session.available_models.push(default_text_model());

        session.clear_command();
        assert!(session.current_command.is_none());
        assert!(session.available_models.is_empty());
    }
}
