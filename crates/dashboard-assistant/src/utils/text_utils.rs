//! Small text helpers shared by the prompt builder and the synthesizer

use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").unwrap();
    static ref NUMBER_REGEX: Regex = Regex::new(r"\d+(?:[.,]\d+)*").unwrap();
}

pub struct TextUtils;

impl TextUtils {
    /// Check if text contains pattern, ignoring case
    pub fn contains_ignore_case(text: &str, pattern: &str) -> bool {
        if pattern.len() > text.len() {
            return false;
        }
        text.to_lowercase().contains(&pattern.to_lowercase())
    }

    /// Collapse whitespace runs (including newlines) to single spaces
    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        let trimmed = text.trim();
        if trimmed.len() != text.len() || WHITESPACE_REGEX.find_iter(trimmed).any(|m| m.as_str() != " ") {
            Cow::Owned(WHITESPACE_REGEX.replace_all(trimmed, " ").into_owned())
        } else {
            Cow::Borrowed(text)
        }
    }

    /// Truncate to at most `max_chars` characters, ending with "..." when cut
    pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> Cow<'_, str> {
        if text.chars().count() <= max_chars {
            Cow::Borrowed(text)
        } else if max_chars <= 3 {
            Cow::Borrowed("...")
        } else {
            let mut result: String = text.chars().take(max_chars - 3).collect();
            result.push_str("...");
            Cow::Owned(result)
        }
    }

    /// Digit runs in the text, with grouping and decimal separators kept.
    pub fn numeric_tokens(text: &str) -> Vec<&str> {
        NUMBER_REGEX.find_iter(text).map(|m| m.as_str()).collect()
    }

    pub fn has_digits(text: &str) -> bool {
        text.bytes().any(|b| b.is_ascii_digit())
    }
}
