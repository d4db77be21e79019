//! Command State Machine
//!
//! Multi-step interactive flows (`/config`, `/image`). Each command
//! is a table entry: an ordered list of message-step handlers and an
//! ordered list of callback-step handlers, indexed by the session's
//! `CurrentCommand.step`. The router has exactly one branch point
//! (is a command active?), so adding a flow means adding a table
//! entry, not touching the router.
//!
//! Step handlers mutate the session and return a list of [`Effect`]s
//! for the transport layer to render, so the whole machine runs in
//! tests with a mock API and no Telegram or Venice access.
//!
//! Malformed input (step without a handler, unknown subcommand,
//! stale model id) always resolves back to Idle; a conversation can
//! never get stuck inside a broken step.

use anyhow::Result;
use futures_util::future::BoxFuture;
use tracing::{error, warn};

use crate::models::ModelClass;
use crate::session::{CurrentCommand, Session};
use crate::venice::{ImageRequest, VeniceApi};

/// A (label, callback-data) button
pub type Button = (String, String);

/// Side effects a step handler asks the transport to perform
#[derive(Debug, PartialEq)]
pub enum Effect {
    /// Send a plain text reply
    Reply(String),
    /// Send a text reply with an inline keyboard
    Keyboard { text: String, rows: Vec<Vec<Button>> },
    /// Swap the inline keyboard on the message behind the callback
    EditReplyMarkup { rows: Vec<Vec<Button>> },
    /// Replace the text of the message behind the callback
    EditMessageText(String),
    /// Acknowledge a callback query
    AnswerCallback { text: Option<String>, alert: bool },
    /// Send a generated photo
    Photo(Vec<u8>),
}

/// Collaborators a step handler may touch
pub struct StepCtx<'a> {
    pub session: &'a mut Session,
    pub api: &'a dyn VeniceApi,
}

type StepFn =
    for<'a, 'b> fn(&'a mut StepCtx<'b>, &'a str) -> BoxFuture<'a, Result<Vec<Effect>>>;

/// One command: two step-handler tables indexed by `step`
pub struct CommandSpec {
    pub id: &'static str,
    pub message_steps: &'static [StepFn],
    pub callback_steps: &'static [StepFn],
}

static CONFIG: CommandSpec = CommandSpec {
    id: "config",
    message_steps: &[config_message_0],
    callback_steps: &[config_callback_0, config_callback_1],
};

static IMAGE: CommandSpec = CommandSpec {
    id: "image",
    message_steps: &[image_message_0, image_message_1],
    callback_steps: &[],
};

/// Look up a command table entry
pub fn command_spec(id: &str) -> Option<&'static CommandSpec> {
    match id {
        "config" => Some(&CONFIG),
        "image" => Some(&IMAGE),
        _ => None,
    }
}

/// Start a command from a trigger (`/config`, `/image`). An already
/// active command is superseded with a notice to the user.
pub async fn invoke(ctx: &mut StepCtx<'_>, id: &str) -> Result<Vec<Effect>> {
    let Some(spec) = command_spec(id) else {
        warn!("Unknown command invoked: {}", id);
        return Ok(vec![Effect::Reply("Unknown command. /help".to_string())]);
    };

    let mut effects = Vec::new();
    if ctx.session.current_command.is_some() {
        ctx.session.clear_command();
        effects.push(Effect::Reply("Previous command aborted".to_string()));
    }

    ctx.session.current_command = Some(CurrentCommand::new(spec.id));

    match spec.message_steps.first() {
        Some(step) => effects.extend(step(ctx, "").await?),
        None => effects.extend(reset_invalid(ctx.session)),
    }
    Ok(effects)
}

/// Route a text message while a command is active. Returns `None`
/// when no command is active so the caller falls through to the
/// normal conversation flow.
pub async fn handle_message(ctx: &mut StepCtx<'_>, text: &str) -> Result<Option<Vec<Effect>>> {
    let Some(cmd) = ctx.session.current_command.clone() else {
        return Ok(None);
    };

    let handler = command_spec(&cmd.id).and_then(|spec| spec.message_steps.get(cmd.step));
    match handler {
        Some(step) => Ok(Some(step(ctx, text).await?)),
        None => {
            warn!("No message handler for command {:?} step {}", cmd.id, cmd.step);
            Ok(Some(reset_invalid(ctx.session)))
        }
    }
}

/// Route a callback event. A callback with no active command is
/// acknowledged without touching state.
pub async fn handle_callback(ctx: &mut StepCtx<'_>, data: &str) -> Result<Vec<Effect>> {
    let Some(cmd) = ctx.session.current_command.clone() else {
        return Ok(vec![Effect::AnswerCallback {
            text: Some("Invalid callback".to_string()),
            alert: false,
        }]);
    };

    let handler = command_spec(&cmd.id).and_then(|spec| spec.callback_steps.get(cmd.step));
    match handler {
        Some(step) => step(ctx, data).await,
        None => {
            warn!("No callback handler for command {:?} step {}", cmd.id, cmd.step);
            Ok(callback_error(ctx.session))
        }
    }
}

/// Invalid message input: generic reply, state healed to Idle
fn reset_invalid(session: &mut Session) -> Vec<Effect> {
    session.clear_command();
    vec![Effect::Reply(
        "Invalid operation. Command cancelled.".to_string(),
    )]
}

/// Invalid callback input: alert the user, state healed to Idle
fn callback_error(session: &mut Session) -> Vec<Effect> {
    session.clear_command();
    vec![Effect::AnswerCallback {
        text: Some("Invalid operation".to_string()),
        alert: true,
    }]
}

// ---- /config: pick a model class, then a model ----

fn config_message_0<'a>(
    _ctx: &'a mut StepCtx<'_>,
    _text: &'a str,
) -> BoxFuture<'a, Result<Vec<Effect>>> {
    Box::pin(async move {
        let rows = vec![
            vec![("Text model".to_string(), "text".to_string())],
            vec![("Code model".to_string(), "code".to_string())],
            vec![("Image model".to_string(), "image".to_string())],
        ];
        Ok(vec![Effect::Keyboard {
            text: "Choose an option".to_string(),
            rows,
        }])
    })
}

fn config_callback_0<'a>(
    ctx: &'a mut StepCtx<'_>,
    data: &'a str,
) -> BoxFuture<'a, Result<Vec<Effect>>> {
    Box::pin(async move {
        let Some(class) = ModelClass::parse(data) else {
            return Ok(callback_error(ctx.session));
        };

        let models = match ctx.api.list_models(class.api_type()).await {
            Ok(models) => models,
            Err(e) => {
                // Never leave a half-updated model cache behind:
                // surface the failure as a cancelled command.
                error!("Model listing failed: {}", e);
                ctx.session.clear_command();
                return Ok(vec![
                    Effect::AnswerCallback { text: None, alert: false },
                    Effect::Reply(format!("Failed to fetch models: {}", e)),
                ]);
            }
        };

        let models: Vec<_> = match class {
            ModelClass::Code => models
                .into_iter()
                .filter(|m| m.model_spec.capabilities.optimized_for_code)
                .collect(),
            _ => models,
        };

        if models.is_empty() {
            ctx.session.clear_command();
            return Ok(vec![
                Effect::AnswerCallback { text: None, alert: false },
                Effect::Reply(format!("No {} models available", class.as_str())),
            ]);
        }

        let rows = models
            .iter()
            .map(|m| vec![(m.button_label(), m.id.clone())])
            .collect();

        if let Some(cmd) = ctx.session.current_command.as_mut() {
            cmd.step = 1;
            cmd.subcommand = Some(data.to_string());
        }
        ctx.session.available_models = models;

        Ok(vec![
            Effect::EditReplyMarkup { rows },
            Effect::AnswerCallback { text: None, alert: false },
        ])
    })
}

fn config_callback_1<'a>(
    ctx: &'a mut StepCtx<'_>,
    data: &'a str,
) -> BoxFuture<'a, Result<Vec<Effect>>> {
    Box::pin(async move {
        let class = ctx
            .session
            .current_command
            .as_ref()
            .and_then(|cmd| cmd.subcommand.as_deref())
            .and_then(ModelClass::parse);
        let Some(class) = class else {
            return Ok(callback_error(ctx.session));
        };

        let Some(model) = ctx
            .session
            .available_models
            .iter()
            .find(|m| m.id == data)
            .cloned()
        else {
            return Ok(callback_error(ctx.session));
        };

        let label = format!("Your new {} model is {}", class.as_str(), model.id);
        ctx.session.models.set(class, model);
        ctx.session.clear_command();

        Ok(vec![
            Effect::AnswerCallback { text: None, alert: false },
            Effect::EditMessageText(label),
        ])
    })
}

// ---- /image: collect a prompt, generate ----

fn image_message_0<'a>(
    ctx: &'a mut StepCtx<'_>,
    _text: &'a str,
) -> BoxFuture<'a, Result<Vec<Effect>>> {
    Box::pin(async move {
        if let Some(cmd) = ctx.session.current_command.as_mut() {
            cmd.step = 1;
        }
        Ok(vec![Effect::Reply("Send me the specifications".to_string())])
    })
}

fn image_message_1<'a>(
    ctx: &'a mut StepCtx<'_>,
    text: &'a str,
) -> BoxFuture<'a, Result<Vec<Effect>>> {
    Box::pin(async move {
        let request = ImageRequest {
            model: ctx.session.models.image.id.clone(),
            prompt: text.trim().to_string(),
        };

        let effects = match ctx.api.generate_image(&request).await {
            Ok(bytes) => vec![Effect::Photo(bytes)],
            Err(e) => {
                error!("Image generation failed: {}", e);
                vec![Effect::Reply(format!("Failed to generate image. {}", e))]
            }
        };

        ctx.session.clear_command();
        Ok(effects)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        default_code_model, default_image_model, default_text_model, ModelRef, ModelType,
    };
    use crate::venice::{ApiError, ChatCompletion};
    use async_trait::async_trait;

    /// Canned Venice backend for exercising the machine offline
    struct MockApi {
        models: Vec<ModelRef>,
        fail_listing: bool,
        image: Result<Vec<u8>, ()>,
    }

    impl Default for MockApi {
        fn default() -> Self {
            Self {
                models: vec![default_text_model(), default_code_model()],
                fail_listing: false,
                image: Ok(vec![1, 2, 3]),
            }
        }
    }

    #[async_trait]
    impl VeniceApi for MockApi {
        async fn chat_completion(
            &self,
            _model: &str,
            _messages: &[crate::history::ChatMessage],
        ) -> Result<ChatCompletion, ApiError> {
            Err(ApiError::EmptyResponse)
        }

        async fn generate_image(&self, _request: &ImageRequest) -> Result<Vec<u8>, ApiError> {
            self.image.clone().map_err(|_| ApiError::Status {
                status: 500,
                body: "boom".to_string(),
            })
        }

        async fn list_models(&self, _model_type: ModelType) -> Result<Vec<ModelRef>, ApiError> {
            if self.fail_listing {
                return Err(ApiError::Status {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            Ok(self.models.clone())
        }
    }

    fn cmd(session: &Session) -> &CurrentCommand {
        session.current_command.as_ref().unwrap()
    }

    #[tokio::test]
    async fn test_invoke_from_idle_lands_on_step_zero() {
        let mut session = Session::default();
        let api = MockApi::default();
        let mut ctx = StepCtx { session: &mut session, api: &api };

        let effects = invoke(&mut ctx, "config").await.unwrap();

        assert_eq!(cmd(&session).id, "config");
        assert_eq!(cmd(&session).step, 0);
        assert!(matches!(effects[0], Effect::Keyboard { .. }));
    }

    #[tokio::test]
    async fn test_invoke_supersedes_active_command() {
        let mut session = Session::default();
        session.current_command = Some(CurrentCommand {
            id: "image".to_string(),
            step: 1,
            subcommand: None,
        });
        let api = MockApi::default();
        let mut ctx = StepCtx { session: &mut session, api: &api };

        let effects = invoke(&mut ctx, "config").await.unwrap();

        assert_eq!(effects[0], Effect::Reply("Previous command aborted".to_string()));
        assert_eq!(cmd(&session).id, "config");
        assert_eq!(cmd(&session).step, 0);
    }

    #[tokio::test]
    async fn test_message_falls_through_when_idle() {
        let mut session = Session::default();
        let api = MockApi::default();
        let mut ctx = StepCtx { session: &mut session, api: &api };

        let routed = handle_message(&mut ctx, "just chatting").await.unwrap();
        assert!(routed.is_none());
    }

    #[tokio::test]
    async fn test_step_beyond_handlers_resets_to_idle() {
        let mut session = Session::default();
        session.current_command = Some(CurrentCommand {
            id: "config".to_string(),
            step: 99,
            subcommand: None,
        });
        let api = MockApi::default();
        let mut ctx = StepCtx { session: &mut session, api: &api };

        let effects = handle_message(&mut ctx, "anything").await.unwrap().unwrap();

        assert!(session.current_command.is_none());
        assert!(matches!(&effects[0], Effect::Reply(text) if text.contains("Invalid operation")));
    }

    #[tokio::test]
    async fn test_callback_without_command_is_acknowledged_only() {
        let mut session = Session::default();
        let api = MockApi::default();
        let mut ctx = StepCtx { session: &mut session, api: &api };

        let effects = handle_callback(&mut ctx, "text").await.unwrap();

        assert_eq!(
            effects,
            vec![Effect::AnswerCallback {
                text: Some("Invalid callback".to_string()),
                alert: false,
            }]
        );
        assert!(session.current_command.is_none());
    }

    #[tokio::test]
    async fn test_config_class_pick_commits_model_cache() {
        let mut session = Session::default();
        let api = MockApi::default();
        {
            let mut ctx = StepCtx { session: &mut session, api: &api };
            invoke(&mut ctx, "config").await.unwrap();
            let effects = handle_callback(&mut ctx, "text").await.unwrap();
            assert!(matches!(effects[0], Effect::EditReplyMarkup { .. }));
        }

        assert_eq!(cmd(&session).step, 1);
        assert_eq!(cmd(&session).subcommand.as_deref(), Some("text"));
        assert_eq!(session.available_models.len(), 2);
    }

    #[tokio::test]
    async fn test_config_code_pick_filters_code_models() {
        let mut session = Session::default();
        let api = MockApi::default();
        let mut ctx = StepCtx { session: &mut session, api: &api };
        invoke(&mut ctx, "config").await.unwrap();
        handle_callback(&mut ctx, "code").await.unwrap();

        assert_eq!(session.available_models.len(), 1);
        assert!(session.available_models[0].model_spec.capabilities.optimized_for_code);
    }

    #[tokio::test]
    async fn test_config_fetch_failure_cancels_cleanly() {
        let mut session = Session::default();
        let api = MockApi {
            fail_listing: true,
            ..MockApi::default()
        };
        let mut ctx = StepCtx { session: &mut session, api: &api };
        invoke(&mut ctx, "config").await.unwrap();
        let effects = handle_callback(&mut ctx, "text").await.unwrap();

        // Cancelled command, no half-committed cache
        assert!(session.current_command.is_none());
        assert!(session.available_models.is_empty());
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Reply(text) if text.contains("Failed to fetch models"))));
    }

    #[tokio::test]
    async fn test_config_model_pick_is_independent_per_class() {
        let mut session = Session::default();
        let code_before = session.models.code.id.clone();
        let image_before = session.models.image.id.clone();
        let api = MockApi::default();
        let mut ctx = StepCtx { session: &mut session, api: &api };

        invoke(&mut ctx, "config").await.unwrap();
        handle_callback(&mut ctx, "text").await.unwrap();
        let effects = handle_callback(&mut ctx, "deepseek-coder-v2-lite").await.unwrap();

        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::EditMessageText(text) if text.contains("deepseek-coder-v2-lite")
        )));
        assert_eq!(session.models.text.id, "deepseek-coder-v2-lite");
        assert_eq!(session.models.code.id, code_before);
        assert_eq!(session.models.image.id, image_before);
        // Command done: state and cache cleared
        assert!(session.current_command.is_none());
        assert!(session.available_models.is_empty());
    }

    #[tokio::test]
    async fn test_config_stale_model_id_heals_to_idle() {
        let mut session = Session::default();
        let api = MockApi::default();
        let mut ctx = StepCtx { session: &mut session, api: &api };

        invoke(&mut ctx, "config").await.unwrap();
        handle_callback(&mut ctx, "text").await.unwrap();
        let effects = handle_callback(&mut ctx, "no-such-model").await.unwrap();

        assert_eq!(
            effects,
            vec![Effect::AnswerCallback {
                text: Some("Invalid operation".to_string()),
                alert: true,
            }]
        );
        assert!(session.current_command.is_none());
    }

    #[tokio::test]
    async fn test_image_flow_generates_and_clears() {
        let mut session = Session::default();
        let api = MockApi::default();
        let mut ctx = StepCtx { session: &mut session, api: &api };

        let effects = invoke(&mut ctx, "image").await.unwrap();
        assert_eq!(effects, vec![Effect::Reply("Send me the specifications".to_string())]);
        assert_eq!(cmd(&session).step, 1);

        let mut ctx = StepCtx { session: &mut session, api: &api };
        let effects = handle_message(&mut ctx, "a rusty robot").await.unwrap().unwrap();
        assert_eq!(effects, vec![Effect::Photo(vec![1, 2, 3])]);
        assert!(session.current_command.is_none());
    }

    #[tokio::test]
    async fn test_image_failure_replies_and_clears() {
        let mut session = Session::default();
        session.current_command = Some(CurrentCommand {
            id: "image".to_string(),
            step: 1,
            subcommand: None,
        });
        let api = MockApi {
            image: Err(()),
            ..MockApi::default()
        };
        let mut ctx = StepCtx { session: &mut session, api: &api };

        let effects = handle_message(&mut ctx, "a prompt").await.unwrap().unwrap();

        assert!(matches!(&effects[0], Effect::Reply(text) if text.contains("Failed to generate image")));
        assert!(session.current_command.is_none());
    }

    #[tokio::test]
    async fn test_unknown_command_id_in_session_resets() {
        let mut session = Session::default();
        session.current_command = Some(CurrentCommand::new("ghost"));
        let api = MockApi::default();
        let mut ctx = StepCtx { session: &mut session, api: &api };

        let effects = handle_message(&mut ctx, "hello").await.unwrap().unwrap();
        assert!(session.current_command.is_none());
        assert!(matches!(&effects[0], Effect::Reply(text) if text.contains("Invalid operation")));
    }
}
