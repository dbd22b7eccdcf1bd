//! Mark extraction and linear projection onto a target text.

use chrono::Utc;

use crate::alignment::{is_letter, is_taam, normalize_text, tokens};
use crate::domain::{AlignmentMetrics, AlignmentStatus, MarkPlacement, TaamAlignment, VerseId};

/// A cantillation mark and the 0-based ordinal of the letter it follows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractedMark {
    pub mark: char,
    pub letter_ordinal: usize,
}

/// Collect cantillation marks (U+0591..=U+05AF) from `text`.
///
/// Vowel points, dagesh and meteg are not taam and are skipped. Marks before
/// the first letter have no anchor and are dropped. Returns the
/// marks and the number of letters seen.
pub fn extract_marks(text: &str) -> (Vec<ExtractedMark>, usize) {
    let normalized = normalize_text(text);
    let mut marks = Vec::new();
    let mut letters = 0usize;

    for c in normalized.chars() {
        if is_letter(c) {
            letters += 1;
        } else if is_taam(c) && letters > 0 {
            marks.push(ExtractedMark {
                mark: c,
                letter_ordinal: letters - 1,
            });
        }
    }
    (marks, letters)
}

/// `(token_index, letter_index)` for every letter of `text`, in order
pub fn letter_slots(text: &str) -> Vec<(usize, usize)> {
    let normalized = normalize_text(text);
    let mut slots = Vec::new();
    for (token_index, token) in tokens(&normalized).into_iter().enumerate() {
        let mut letter_index = 0;
        for c in token.chars() {
            if is_letter(c) {
                slots.push((token_index, letter_index));
                letter_index += 1;
            }
        }
    }
    slots
}

/// Project a witness letter ordinal onto a target letter ordinal
pub fn project_ordinal(witness_ordinal: usize, witness_letters: usize, target_letters: usize) -> usize {
    if witness_letters == 0 || target_letters == 0 {
        return 0;
    }
    let scaled = witness_ordinal as f64 / witness_letters as f64 * (target_letters - 1) as f64;
    (scaled.round() as usize).min(target_letters - 1)
}

/// Align one witness's marks onto the target text
pub fn align_marks(
    verse_id: &VerseId,
    witness_id: &str,
    witness_text: &str,
    target_text: &str,
    target_text_hash: &str,
    target_layer: &str,
) -> TaamAlignment {
    let (extracted, witness_letters) = extract_marks(witness_text);
    let slots = letter_slots(target_text);

    let mut marks: Vec<MarkPlacement> = extracted
        .iter()
        .filter_map(|m| {
            let ordinal = project_ordinal(m.letter_ordinal, witness_letters, slots.len());
            slots.get(ordinal).map(|&(token_index, letter_index)| MarkPlacement {
                token_index,
                letter_index,
                mark: m.mark,
            })
        })
        .collect();
    marks.sort();
    marks.dedup();

    let status = if slots.is_empty() || witness_letters == 0 {
        AlignmentStatus::Empty
    } else if extracted.is_empty() {
        AlignmentStatus::NoMarks
    } else {
        AlignmentStatus::Aligned
    };

    TaamAlignment {
        verse_id: verse_id.clone(),
        witness_id: witness_id.to_string(),
        target_layer: target_layer.to_string(),
        target_text_hash: target_text_hash.to_string(),
        metrics: AlignmentMetrics {
            witness_letters,
            target_letters: slots.len(),
            marks_extracted: extracted.len(),
            marks_placed: marks.len(),
        },
        marks,
        status,
        computed_at: Utc::now(),
    }
}
