//! Telegram Bot integration
//!
//! Wires the session engine to Telegram: explicit Dispatcher with a
//! dptree handler tree for messages and callback queries, allow-list
//! authorization, and rendering of the command machine's effects.
//!
//! Every inbound event follows the same shape: authorize, load the
//! session, run exactly one handler to completion, save the session.
//! The remote Venice call inside the handler is the only suspension
//! point, so per-conversation state never sees interleaved writes.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};
use teloxide::{
    dispatching::{Dispatcher, UpdateFilterExt},
    dptree,
    error_handlers::LoggingErrorHandler,
    prelude::*,
    types::{
        ChatAction, InlineKeyboardButton, InlineKeyboardMarkup, InlineQuery, InlineQueryResult,
        InputFile, ParseMode, ReplyParameters, Update,
    },
};

use crate::commands::{self, Button, Effect, StepCtx};
use crate::config::Config;
use crate::context::ContextWindowBuilder;
use crate::history::{ChatMessage, ChatRole, HistoryStore};
use crate::models::ModelClass;
use crate::session::{Session, SessionStore};
use crate::venice::{ApiError, ChatCompletion, Citation, VeniceApi, VeniceClient};

/// Telegram caps messages at 4096 chars; leave headroom
const MAX_MESSAGE_CHARS: usize = 4000;

/// Run the bot with long polling until interrupted
pub async fn run_bot(config: Config) -> Result<()> {
    let sessions = SessionStore::open(&config.session_db_path)?;
    let api = VeniceClient::new(config.venice_api_key.clone());

    tracing::info!("===========================================");
    tracing::info!("  RamboBot - Starting...");
    tracing::info!("===========================================");
    tracing::info!(
        "Allowed users: {}",
        if config.allowed_users.is_empty() {
            "ALL".to_string()
        } else {
            format!("{:?}", config.allowed_users)
        }
    );
    tracing::info!("Session database: {:?}", config.session_db_path);
    tracing::info!("History cap: {} messages per log", config.max_session_messages);

    let bot = Bot::new(config.telegram_bot_token.clone());

    // Verify bot token by calling getMe
    match bot.get_me().await {
        Ok(me) => {
            tracing::info!(
                "Bot authenticated: @{} (ID: {})",
                me.username.as_deref().unwrap_or("unknown"),
                me.id
            );
        }
        Err(e) => {
            tracing::error!("Failed to authenticate bot: {}", e);
            anyhow::bail!("Bot authentication failed: {}", e);
        }
    }

    // Delete any existing webhook to ensure polling works
    if let Err(e) = bot.delete_webhook().await {
        tracing::warn!("Failed to delete webhook: {} (continuing anyway)", e);
    }

    let data = Arc::new(BotData {
        history: HistoryStore::new(config.max_session_messages),
        builder: ContextWindowBuilder::new(config.default_max_tokens),
        sessions: Mutex::new(sessions),
        api,
        config,
    });

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(message_handler))
        .branch(Update::filter_callback_query().endpoint(callback_handler))
        .branch(Update::filter_inline_query().endpoint(inline_query_handler));

    tracing::info!("Starting dispatcher with long polling...");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![data])
        .default_handler(|upd| async move {
            tracing::debug!("Unhandled update: {:?}", upd);
        })
        .error_handler(LoggingErrorHandler::with_custom_text(
            "Error in update handler",
        ))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    tracing::warn!("Dispatcher stopped");
    Ok(())
}

struct BotData {
    config: Config,
    api: VeniceClient,
    sessions: Mutex<SessionStore>,
    history: HistoryStore,
    builder: ContextWindowBuilder,
}

impl BotData {
    fn is_allowed(&self, user_id: i64) -> bool {
        self.config.allowed_users.is_empty() || self.config.allowed_users.contains(&user_id)
    }

    fn load_session(&self, chat_id: i64) -> Result<Session> {
        self.sessions
            .lock()
            .map_err(|e| anyhow!("Lock error: {}", e))?
            .load(chat_id)
    }

    fn save_session(&self, chat_id: i64, session: &Session) -> Result<()> {
        self.sessions
            .lock()
            .map_err(|e| anyhow!("Lock error: {}", e))?
            .save(chat_id, session)
    }
}

/// Message handler endpoint for the dispatcher
async fn message_handler(bot: Bot, msg: Message, data: Arc<BotData>) -> ResponseResult<()> {
    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0);
    let chat_id = msg.chat.id.0;
    let preview = msg
        .text()
        .unwrap_or("<non-text>")
        .chars()
        .take(50)
        .collect::<String>();

    tracing::info!(
        ">>> Message received: user={}, chat={}, text={:?}",
        user_id,
        chat_id,
        preview
    );

    if let Err(e) = handle_message(bot, msg, data).await {
        tracing::error!("Error handling message: {}", e);
    }

    Ok(())
}

async fn handle_message(bot: Bot, msg: Message, data: Arc<BotData>) -> Result<()> {
    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0);
    let chat_id = msg.chat.id;

    // Rejected before any session I/O: no state is created for
    // unauthorized conversations.
    if !data.is_allowed(user_id) {
        tracing::warn!("Unauthorized user: {}", user_id);
        bot.send_message(chat_id, "Unauthorized.").await?;
        return Ok(());
    }

    let mut session = data.load_session(chat_id.0)?;

    let result = if let Some(text) = msg.text() {
        handle_text(&bot, &msg, &data, &mut session, text).await
    } else if msg.photo().is_some() {
        handle_photo(&bot, &msg, &data, &mut session).await
    } else {
        bot.send_message(chat_id, "Send me text or a photo. /help")
            .await?;
        Ok(())
    };

    data.save_session(chat_id.0, &session)?;
    result
}

async fn handle_text(
    bot: &Bot,
    msg: &Message,
    data: &BotData,
    session: &mut Session,
    text: &str,
) -> Result<()> {
    if text.starts_with('/') {
        if let Some(handled) = handle_command(bot, msg, data, session, text).await? {
            return Ok(handled);
        }
        // Unrecognized slash text falls through: an active step may
        // legitimately consume it (e.g. an image prompt).
    }

    // Active command owns all text events
    {
        let mut ctx = StepCtx {
            session,
            api: &data.api,
        };
        if let Some(effects) = commands::handle_message(&mut ctx, text).await? {
            return render_message_effects(bot, msg, effects).await;
        }
    }

    if text.starts_with('/') {
        bot.send_message(msg.chat.id, "Unknown command. /help").await?;
        return Ok(());
    }

    let user_message = ChatMessage::user(prefixed_content(msg, text));
    run_completion(bot, msg, data, session, ModelClass::Text, user_message).await
}

/// Dispatch a `/command`. Returns `None` for unrecognized commands so
/// the caller can offer the text to an active step handler instead.
async fn handle_command(
    bot: &Bot,
    msg: &Message,
    data: &BotData,
    session: &mut Session,
    text: &str,
) -> Result<Option<()>> {
    let chat_id = msg.chat.id;
    let parts: Vec<&str> = text.splitn(2, ' ').collect();
    let cmd = parts[0];
    let args = parts.get(1).copied().unwrap_or("").trim();

    match cmd {
        "/start" => {
            bot.send_message(chat_id, "Ask me anything!").await?;
        }

        "/help" => {
            bot.send_message(
                chat_id,
                "What do you need?\n\n\
                Chat:\n\
                - Send text: I answer with the current text model\n\
                - Send a photo: I look at it (vision models only)\n\
                /code <prompt> - Ask the coding model\n\
                /new [code|all] - Delete chat history and start over\n\n\
                Configuration:\n\
                /config - Choose text/code/image models\n\
                /image - Generate an image\n\
                /abort - Cancel the current operation",
            )
            .await?;
        }

        "/abort" => {
            session.clear_command();
            bot.send_message(chat_id, "Operation aborted").await?;
        }

        "/new" => {
            let confirmation = match args {
                "code" => {
                    data.history.clear(session, ModelClass::Code);
                    "Code history deleted. Starting a new chat..."
                }
                "all" => {
                    data.history.clear(session, ModelClass::Text);
                    data.history.clear(session, ModelClass::Code);
                    "All history deleted. Starting a new chat..."
                }
                _ => {
                    data.history.clear(session, ModelClass::Text);
                    "Chat history deleted. Starting a new chat..."
                }
            };
            bot.send_message(chat_id, confirmation).await?;
        }

        "/config" | "/image" => {
            let id = &cmd[1..];
            let effects = {
                let mut ctx = StepCtx {
                    session,
                    api: &data.api,
                };
                commands::invoke(&mut ctx, id).await?
            };
            render_message_effects(bot, msg, effects).await?;
        }

        "/code" => {
            if args.is_empty() {
                bot.send_message(chat_id, "Usage: /code <prompt>").await?;
            } else {
                let user_message = ChatMessage::user(args);
                run_completion(bot, msg, data, session, ModelClass::Code, user_message).await?;
            }
        }

        _ => return Ok(None),
    }

    Ok(Some(()))
}

async fn handle_photo(
    bot: &Bot,
    msg: &Message,
    data: &BotData,
    session: &mut Session,
) -> Result<()> {
    let chat_id = msg.chat.id;

    // Steps are indexed by text/callback events only; a photo during
    // an active command is not routable.
    if session.current_command.is_some() {
        bot.send_message(chat_id, "Finish the current command first, or /abort")
            .await?;
        return Ok(());
    }

    let Some(photo) = msg.photo().and_then(|sizes| sizes.last()) else {
        return Ok(());
    };

    // Largest size; resolve to a Bot API file URL the model can fetch
    let file = bot.get_file(&photo.file.id).await?;
    let file_url = format!(
        "https://api.telegram.org/file/bot{}/{}",
        data.config.telegram_bot_token, file.path
    );

    let caption = msg.caption().map(|c| prefixed_content(msg, c));
    let user_message = ChatMessage::user_with_image(caption.as_deref(), file_url);

    run_completion(bot, msg, data, session, ModelClass::Text, user_message).await
}

/// Outcome of one completion attempt, for the caller to render
#[derive(Debug)]
pub enum CompletionOutcome {
    /// Verified non-empty answer, already appended to the history
    Reply(ChatCompletion),
    /// The model answered with no content; history holds only the
    /// user turn
    Empty,
    /// Transport or API failure; history holds only the user turn
    Failed,
}

/// The shared completion core: append the user turn, build the
/// trimmed window, call Venice, and only append the assistant turn
/// once a non-empty response is in hand. Takes the backend as a
/// trait object so it runs in tests without network access.
pub async fn complete_chat(
    api: &dyn VeniceApi,
    history: &HistoryStore,
    builder: &ContextWindowBuilder,
    session: &mut Session,
    class: ModelClass,
    system_prompt: &str,
    user_message: ChatMessage,
) -> CompletionOutcome {
    history.append(session, class, user_message);

    let model = session.models.get(class).clone();

    // Budget reserved for the system prompt we prepend ourselves
    let offset = -(builder.counter().count(system_prompt) as i64);
    let window = builder.build(session.history(class), &model, offset);

    let mut messages = Vec::with_capacity(window.len() + 1);
    messages.push(ChatMessage::text(ChatRole::System, system_prompt));
    messages.extend(window);

    match api.chat_completion(&model.id, &messages).await {
        Ok(completion) => {
            history.append(session, class, ChatMessage::assistant(&completion.content));
            CompletionOutcome::Reply(completion)
        }
        Err(ApiError::EmptyResponse) => {
            tracing::warn!("Empty completion from model {}", model.id);
            CompletionOutcome::Empty
        }
        Err(e) => {
            tracing::error!("Chat completion failed: {}", e);
            CompletionOutcome::Failed
        }
    }
}

async fn run_completion(
    bot: &Bot,
    msg: &Message,
    data: &BotData,
    session: &mut Session,
    class: ModelClass,
    user_message: ChatMessage,
) -> Result<()> {
    let chat_id = msg.chat.id;

    bot.send_chat_action(chat_id, ChatAction::Typing).await?;

    let system_prompt = if msg.chat.is_private() {
        &data.config.private_chat_system_prompt
    } else {
        &data.config.group_chat_system_prompt
    };

    let outcome = complete_chat(
        &data.api,
        &data.history,
        &data.builder,
        session,
        class,
        system_prompt,
        user_message,
    )
    .await;

    match outcome {
        CompletionOutcome::Reply(completion) => {
            send_reply(bot, msg, &completion.content).await?;
            send_citations(bot, msg, &completion.citations).await
        }
        CompletionOutcome::Empty => {
            bot.send_message(chat_id, "Error: No response from Venice")
                .await?;
            Ok(())
        }
        CompletionOutcome::Failed => {
            bot.send_message(chat_id, "Failed to get a response from Venice. Try again later.")
                .await?;
            Ok(())
        }
    }
}

/// Prepend the sender's name in group chats (the group system prompt
/// tells the model to expect it)
fn prefixed_content(msg: &Message, text: &str) -> String {
    if msg.chat.is_private() {
        return text.to_string();
    }
    match msg.from.as_ref() {
        Some(user) => format!("{}: {}", user.full_name(), text),
        None => text.to_string(),
    }
}

/// Citation list as MarkdownV2 links
pub(crate) fn citations_markdown(citations: &[Citation]) -> String {
    let mut out = String::from("Sources:");
    for citation in citations {
        out.push_str(&format!(
            "\n[{}]({})",
            escape_markdown_v2(&citation.title),
            escape_markdown_v2_url(&citation.url)
        ));
    }
    out
}

/// Citation list as plain text, for the markup fallback
pub(crate) fn citations_plain(citations: &[Citation]) -> String {
    let mut out = String::from("Sources:");
    for citation in citations {
        out.push_str(&format!("\n{}: {}", citation.title, citation.url));
    }
    out
}

/// Escape the MarkdownV2 reserved characters
pub fn escape_markdown_v2(text: &str) -> String {
    const RESERVED: &[char] = &[
        '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
    ];

    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if RESERVED.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Escape a URL for the `(...)` part of a MarkdownV2 link, where only
/// `)` and `\` are reserved
pub fn escape_markdown_v2_url(url: &str) -> String {
    let mut escaped = String::with_capacity(url.len());
    for c in url.chars() {
        if c == ')' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Split text into chunks below the Telegram message limit on UTF-8
/// boundaries
pub fn chunk_message(text: &str) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        let split_at = remaining
            .char_indices()
            .take_while(|(i, _)| *i < MAX_MESSAGE_CHARS)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(remaining.len());
        let (chunk, rest) = remaining.split_at(split_at);
        chunks.push(chunk);
        remaining = rest;
    }
    chunks
}

/// Send a (possibly long) raw reply. Each chunk is escaped and sent
/// as MarkdownV2 first; if Telegram rejects the entity markup, the
/// chunk is resent verbatim so the user never sees escape
/// backslashes. Group replies quote the triggering message.
async fn send_reply(bot: &Bot, msg: &Message, text: &str) -> Result<()> {
    for chunk in chunk_message(text) {
        send_with_fallback(bot, msg, &escape_markdown_v2(chunk), chunk).await?;
    }
    Ok(())
}

/// Send the citation list, if any: MarkdownV2 links first, plain
/// "title: url" lines when the markup is rejected.
async fn send_citations(bot: &Bot, msg: &Message, citations: &[Citation]) -> Result<()> {
    if citations.is_empty() {
        return Ok(());
    }
    send_with_fallback(
        bot,
        msg,
        &citations_markdown(citations),
        &citations_plain(citations),
    )
    .await
}

async fn send_with_fallback(
    bot: &Bot,
    msg: &Message,
    markdown: &str,
    plain: &str,
) -> Result<()> {
    let mut request = bot
        .send_message(msg.chat.id, markdown)
        .parse_mode(ParseMode::MarkdownV2);
    if !msg.chat.is_private() {
        request = request.reply_parameters(ReplyParameters::new(msg.id));
    }

    if request.await.is_err() {
        let mut fallback = bot.send_message(msg.chat.id, plain);
        if !msg.chat.is_private() {
            fallback = fallback.reply_parameters(ReplyParameters::new(msg.id));
        }
        fallback.await?;
    }
    Ok(())
}

fn keyboard_markup(rows: Vec<Vec<Button>>) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(rows.into_iter().map(|row| {
        row.into_iter()
            .map(|(label, data)| InlineKeyboardButton::callback(label, data))
            .collect::<Vec<_>>()
    }))
}

/// Render step effects produced by a message event
async fn render_message_effects(bot: &Bot, msg: &Message, effects: Vec<Effect>) -> Result<()> {
    let chat_id = msg.chat.id;
    for effect in effects {
        match effect {
            Effect::Reply(text) => {
                bot.send_message(chat_id, text).await?;
            }
            Effect::Keyboard { text, rows } => {
                bot.send_message(chat_id, text)
                    .reply_markup(keyboard_markup(rows))
                    .await?;
            }
            Effect::Photo(bytes) => {
                bot.send_photo(chat_id, InputFile::memory(bytes)).await?;
            }
            other => {
                // Edits and callback acks only make sense for
                // callback-originated steps
                tracing::warn!("Dropping non-message effect: {:?}", other);
            }
        }
    }
    Ok(())
}

/// Inline queries are not supported; answer with an empty result
/// list so the client stops showing a loading spinner.
async fn inline_query_handler(bot: Bot, query: InlineQuery) -> ResponseResult<()> {
    bot.answer_inline_query(&query.id, Vec::<InlineQueryResult>::new())
        .await?;
    Ok(())
}

/// Callback query handler endpoint for the dispatcher
async fn callback_handler(bot: Bot, query: CallbackQuery, data: Arc<BotData>) -> ResponseResult<()> {
    let user_id = query.from.id.0 as i64;

    if !data.is_allowed(user_id) {
        bot.answer_callback_query(&query.id)
            .text("Unauthorized")
            .await?;
        return Ok(());
    }

    if let Err(e) = handle_callback(bot, query, data).await {
        tracing::error!("Error handling callback: {}", e);
    }

    Ok(())
}

async fn handle_callback(bot: Bot, query: CallbackQuery, data: Arc<BotData>) -> Result<()> {
    let Some(chat_id) = query.message.as_ref().map(|m| m.chat().id) else {
        // Inaccessible origin; nothing to route the event to
        bot.answer_callback_query(&query.id).await?;
        return Ok(());
    };

    let callback_data = match &query.data {
        Some(d) => d.clone(),
        None => {
            bot.answer_callback_query(&query.id).await?;
            return Ok(());
        }
    };

    tracing::info!(
        "Callback query: user={}, data={}",
        query.from.id.0,
        callback_data
    );

    let mut session = data.load_session(chat_id.0)?;

    let effects = {
        let mut ctx = StepCtx {
            session: &mut session,
            api: &data.api,
        };
        commands::handle_callback(&mut ctx, &callback_data).await?
    };

    data.save_session(chat_id.0, &session)?;

    render_callback_effects(&bot, &query, chat_id, effects).await
}

/// Render step effects produced by a callback event
async fn render_callback_effects(
    bot: &Bot,
    query: &CallbackQuery,
    chat_id: ChatId,
    effects: Vec<Effect>,
) -> Result<()> {
    for effect in effects {
        match effect {
            Effect::AnswerCallback { text, alert } => {
                let mut request = bot.answer_callback_query(&query.id);
                if let Some(text) = text {
                    request = request.text(text);
                }
                if alert {
                    request = request.show_alert(true);
                }
                request.await?;
            }
            Effect::EditReplyMarkup { rows } => {
                if let Some(msg) = &query.message {
                    bot.edit_message_reply_markup(chat_id, msg.id())
                        .reply_markup(keyboard_markup(rows))
                        .await?;
                }
            }
            Effect::EditMessageText(text) => {
                if let Some(msg) = &query.message {
                    bot.edit_message_text(chat_id, msg.id(), text).await?;
                }
            }
            Effect::Reply(text) => {
                bot.send_message(chat_id, text).await?;
            }
            Effect::Keyboard { text, rows } => {
                bot.send_message(chat_id, text)
                    .reply_markup(keyboard_markup(rows))
                    .await?;
            }
            Effect::Photo(bytes) => {
                bot.send_photo(chat_id, InputFile::memory(bytes)).await?;
            }
        }
    }
    Ok(())
}
