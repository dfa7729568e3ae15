//! Sanitization of the user's idea text before it reaches any prompt.
//!
//! Rejects over-long input and known prompt-injection phrasings (English and
//! Korean), then HTML-escapes what remains. Detection runs on a normalized
//! copy: NFKD with combining marks stripped, recomposed to NFC so Hangul
//! syllables still match, whitespace collapsed, lowercased.

use crate::config::SanitizeConfig;
use crate::error::RetrievalError;
use regex::Regex;
use std::sync::LazyLock;
use unicode_normalization::UnicodeNormalization;

const INJECTION_PATTERNS: &[&str] = &[
    r"(?:ignore|disregard)\s+(?:the\s+)?(?:above|previous|below|system|instruction|prompt)",
    r"you\s+are\s+now\s+a",
    r"new\s+rule",
    r"system\s+override",
    r"don't\s+follow\s+the\s+instructions",
    r"answer\s+as\s+a",
    r"forget\s+everything\s+we\s+talked\s+about",
    r"previous\s+context\s+is\s+deleted",
    r"translated\s+as\s+follow",
    r"이전\s*지침을?\s*무시",
    r"시스템\s*프롬프트를?\s*무시",
    r"앞의\s*내용은?\s*무시",
    r"지금부터\s*당신은",
    r"새로운\s*규칙",
    r"시스템\s*재설정",
    r"지침을?\s*따르지\s*마세요",
    r"대신\s*답변하세요",
];

static INJECTION_RES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    INJECTION_PATTERNS
        .iter()
        .filter_map(|p| Regex::new(p).ok().map(|re| (*p, re)))
        .collect()
});

/// Validates and escapes user input.
#[derive(Debug, Clone)]
pub struct InputSanitizer {
    enabled: bool,
    max_input_chars: usize,
}

impl Default for InputSanitizer {
    fn default() -> Self {
        Self::new(&SanitizeConfig::default())
    }
}

impl InputSanitizer {
    pub fn new(config: &SanitizeConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_input_chars: config.max_input_chars,
        }
    }

    /// Return the escaped text, or `InvalidInput` when it must not be used.
    ///
    /// Empty input is rejected even when sanitization is disabled.
    pub fn sanitize(&self, text: &str) -> Result<String, RetrievalError> {
        if text.trim().is_empty() {
            return Err(RetrievalError::InvalidInput {
                reason: "input is empty".to_string(),
            });
        }
        if !self.enabled {
            return Ok(text.to_string());
        }

        let length = text.chars().count();
        if length > self.max_input_chars {
            tracing::warn!(length, max = self.max_input_chars, "Input length exceeded");
            return Err(RetrievalError::InvalidInput {
                reason: format!("input is too long (max {} characters)", self.max_input_chars),
            });
        }

        if let Some(pattern) = detect_injection(text) {
            tracing::warn!(
                event = "prompt_injection_detection",
                pattern,
                masked_input = %mask(text),
                "Potential prompt injection detected"
            );
            return Err(RetrievalError::InvalidInput {
                reason: "potentially malicious input pattern detected".to_string(),
            });
        }

        Ok(escape_html(text))
    }
}

/// Return the first injection pattern the text matches.
pub fn detect_injection(text: &str) -> Option<&'static str> {
    let normalized = normalize_text(text);
    INJECTION_RES
        .iter()
        .find(|(_, re)| re.is_match(&normalized))
        .map(|(p, _)| *p)
}

fn normalize_text(text: &str) -> String {
    let recomposed: String = text
        .nfkd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .nfc()
        .collect();
    let mut result = String::with_capacity(recomposed.len());
    let mut prev_space = false;
    for c in recomposed.chars() {
        if c.is_whitespace() {
            if !prev_space {
                result.push(' ');
                prev_space = true;
            }
        } else {
            result.extend(c.to_lowercase());
            prev_space = false;
        }
    }
    result.trim().to_string()
}

/// Escape `& < > " '` for safe embedding.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// Fence user text inside a prompt so it stays separate from instructions.
pub fn wrap_user_query(text: &str) -> String {
    format!("<user_query>\n{text}\n</user_query>")
}

/// First and last 15 characters, for logs.
fn mask(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= 30 {
        return text.to_string();
    }
    let head: String = chars[..15].iter().collect();
    let tail: String = chars[chars.len() - 15..].iter().collect();
    format!("{head}...{tail}")
}
