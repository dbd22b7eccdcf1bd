//! Text normalization shared by every comparison in the pipeline.
//!
//! Normalized text is NFC-composed with all whitespace runs collapsed to a
//! single space and no leading/trailing whitespace. The transform is
//! idempotent, so hashes over normalized text are stable.

use sha2::{Digest, Sha256};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// NFC-compose and collapse whitespace
pub fn normalize_text(text: &str) -> String {
    let composed: String = text.nfc().collect();
    composed.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whitespace-split tokens of already-normalized text
pub fn tokens(normalized: &str) -> Vec<&str> {
    normalized.split_whitespace().collect()
}

/// A base letter (not a combining mark, not punctuation or digits)
pub fn is_letter(c: char) -> bool {
    !is_combining_mark(c) && c.is_alphabetic()
}

pub fn is_mark(c: char) -> bool {
    is_combining_mark(c)
}

/// Hebrew cantillation marks (te'amim), U+0591..=U+05AF
pub fn is_taam(c: char) -> bool {
    ('\u{0591}'..='\u{05AF}').contains(&c)
}

pub fn letter_count(text: &str) -> usize {
    text.chars().filter(|c| is_letter(*c)).count()
}

/// Strip every combining mark, leaving consonantal text
pub fn strip_marks(text: &str) -> String {
    text.nfd().filter(|c| !is_combining_mark(*c)).collect::<String>().nfc().collect()
}

/// SHA-256 (hex) of the normalized form of `text`
pub fn text_hash(text: &str) -> String {
    let normalized = normalize_text(text);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}
