//! RamboBot
//!
//! Telegram proxy bot for the Venice.ai generative API.
//!
//! # Features
//!
//! - **Per-conversation sessions**: durable state (SQLite) loaded and
//!   saved around every event
//! - **Context windows**: newest-first token-budget trimming with
//!   vision-aware multi-part handling
//! - **Three model slots**: independent text / code / image selection
//!   via an interactive `/config` flow
//! - **Step-table commands**: multi-step flows as data, self-healing
//!   on malformed input
//! - **Web search**: automatic, with citations relayed to the chat
//!
//! # Architecture
//!
//! ```text
//! Telegram ──► Dispatcher ──► CommandStateMachine ──► Venice API
//!                 │                  │
//!                 │                  └── (idle) completion flow
//!                 ├── SessionStore (SQLite)
//!                 ├── HistoryStore (capped per-class logs)
//!                 └── ContextWindowBuilder (token budget)
//! ```

pub mod commands;
pub mod config;
pub mod context;
pub mod history;
pub mod models;
pub mod session;
pub mod telegram;
pub mod tokenizer;
pub mod venice;


pub use commands::{Effect, StepCtx};
pub use config::Config;
pub use context::ContextWindowBuilder;
pub use history::{ChatMessage, ChatRole, ContentPart, HistoryStore, MessageContent};
pub use models::{ModelCapabilities, ModelClass, ModelRef, ModelSpec, ModelType};
pub use session::{CurrentCommand, ModelSelection, Session, SessionStore};
pub use tokenizer::TokenCounter;
pub use venice::{ApiError, ChatCompletion, Citation, ImageRequest, VeniceApi, VeniceClient};
