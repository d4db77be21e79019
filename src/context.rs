//! Context Window Builder
//!
//! Decides which history entries survive into an upstream request.
//! The scan walks the log newest-first with a running token total:
//! recent context matters most, so older messages are the ones that
//! fall out when the budget tightens.
//!
//! Multi-part (image-bearing) messages are special-cased twice:
//! models without vision support never see them at all, and even a
//! vision model gets at most one image per built window to bound
//! request cost.
//!
//! One quirk carried over from the observed production behavior: the
//! running total keeps accumulating even for excluded messages, and
//! the scan never stops early, so an older message can still be
//! rejected by a total a newer message already blew through. Do not
//! "fix" this without product-owner sign-off.

use crate::history::ChatMessage;
use crate::models::ModelRef;
use crate::tokenizer::TokenCounter;

/// Builds trimmed message lists from per-class history logs
pub struct ContextWindowBuilder {
    counter: TokenCounter,
    /// Budget used when a model does not declare a context window
    default_budget: u32,
}

impl ContextWindowBuilder {
    pub fn new(default_budget: u32) -> Self {
        Self {
            counter: TokenCounter::new(),
            default_budget,
        }
    }

    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    /// Trim `history` (chronological, oldest first) to the model's
    /// token budget. `token_offset` is added to the budget; callers
    /// typically pass the negated token count of the system prompt
    /// they will prepend themselves.
    ///
    /// The returned list is chronological and is always a subsequence
    /// of `history`. The newest message that survives the vision
    /// filter is included even when it alone exceeds the budget;
    /// there is no intra-message splitting.
    pub fn build(
        &self,
        history: &[ChatMessage],
        model: &ModelRef,
        token_offset: i64,
    ) -> Vec<ChatMessage> {
        let budget = model.context_window().unwrap_or(self.default_budget) as i64 + token_offset;
        let vision = model.supports_vision();

        let mut selected: Vec<ChatMessage> = Vec::new();
        let mut total: i64 = 0;
        let mut image_included = false;

        for message in history.iter().rev() {
            if message.content.has_image() {
                // Dropped outright, never counted: the model cannot
                // consume it, or the window already carries an image.
                if !vision || image_included {
                    continue;
                }
            }

            let cost = self.counter.count(&message.content.as_countable_text()) as i64;
            total += cost;

            if total <= budget || selected.is_empty() {
                if message.content.has_image() {
                    image_included = true;
                }
                selected.push(message.clone());
            }
        }

        selected.reverse();
        selected
    }
}
