//! Token Counter
//!
//! Approximate token counting for context-window budgeting.
//! Venice models use BPE tokenizers close to cl100k_base; a
//! character-based approximation is good enough for trimming
//! history and avoids shipping tokenizer tables.

/// Approximate token counter
///
/// Accuracy: ±10% for typical text, ±15% for code. Pure and
/// deterministic for a given input.
pub struct TokenCounter {
    /// Average characters per token (~4 chars/token for English)
    chars_per_token: f32,
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter {
    pub fn new() -> Self {
        Self {
            // English prose averages ~4 chars/token; code runs denser
            // due to symbols, so split the difference.
            chars_per_token: 3.8,
        }
    }

    /// Count approximate tokens in text
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        let char_count = text.chars().count();
        let base_tokens = (char_count as f32 / self.chars_per_token).ceil() as usize;

        (base_tokens as f32 * self.calculate_adjustments(text)).ceil() as usize
    }

    /// Adjustment factor based on content type
    fn calculate_adjustments(&self, text: &str) -> f32 {
        let mut factor = 1.0f32;

        // Code has more tokens per character (symbols, short identifiers)
        let code_indicators = ["{", "}", "(", ")", ";", "=>", "->", "::"];
        let code_density: f32 = code_indicators
            .iter()
            .map(|p| text.matches(p).count() as f32)
            .sum::<f32>()
            / text.len().max(1) as f32;

        if code_density > 0.01 {
            factor *= 1.15;
        }

        // URLs and paths are token-heavy
        if text.contains("http://") || text.contains("https://") {
            factor *= 1.1;
        }

        // Numbers compress well
        let digit_ratio = text.chars().filter(|c| c.is_ascii_digit()).count() as f32
            / text.len().max(1) as f32;
        if digit_ratio > 0.3 {
            factor *= 0.9;
        }

        factor
    }
}
