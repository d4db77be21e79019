//! Configuration management

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Bot configuration, loaded once at startup
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot token
    pub telegram_bot_token: String,

    /// Venice API key
    pub venice_api_key: String,

    /// Allowed Telegram user ids (empty = allow all)
    pub allowed_users: Vec<i64>,

    /// SQLite database path for session state
    pub session_db_path: PathBuf,

    /// Entry cap per history log
    pub max_session_messages: usize,

    /// Token budget for models that do not declare a context window
    pub default_max_tokens: u32,

    /// System prompt used in private chats
    pub private_chat_system_prompt: String,

    /// System prompt used in group chats
    pub group_chat_system_prompt: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let telegram_bot_token =
            std::env::var("TELEGRAM_BOT_TOKEN").context("TELEGRAM_BOT_TOKEN must be set")?;

        let venice_api_key =
            std::env::var("VENICE_API_KEY").context("VENICE_API_KEY must be set")?;

        let allowed_users = std::env::var("TELEGRAM_ALLOWED_USERS")
            .unwrap_or_default()
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();

        let session_db_path = std::env::var("SESSION_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("sessions.db"));

        let max_session_messages = std::env::var("MAX_SESSION_MESSAGES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);

        let default_max_tokens = std::env::var("DEFAULT_MAX_TOKENS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(256_000);

        let private_chat_system_prompt = std::env::var("PRIVATE_CHAT_SYSTEM_PROMPT")
            .unwrap_or_else(|_| {
                "You are a Telegram bot assistant. Keep responses short and concise \
                 when possible."
                    .to_string()
            });

        let group_chat_system_prompt = std::env::var("GROUP_CHAT_SYSTEM_PROMPT")
            .unwrap_or_else(|_| {
                "You are an assistant in a Telegram group. Give short and concise \
                 responses only when necessary. Every message is prepended with the \
                 name of the user."
                    .to_string()
            });

        Ok(Self {
            telegram_bot_token,
            venice_api_key,
            allowed_users,
            session_db_path,
            max_session_messages,
            default_max_tokens,
            private_chat_system_prompt,
            group_chat_system_prompt,
        })
    }
}
