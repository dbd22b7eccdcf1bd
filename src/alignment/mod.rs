//! Alignment engine.
//!
//! Pure functions over two texts: normalization, character-level edit
//! distance, match score and a positional token diff with character-level
//! sub-diffs for replaced tokens. No state, no I/O.

pub mod diff;
pub mod normalize;

pub use diff::{
    align, char_ops, levenshtein, match_score, similarity, Alignment, CharOp, CharStats,
    DiffKind, ReplaceDetail, TokenDiffOp,
};
pub use normalize::{
    is_letter, is_mark, is_taam, letter_count, normalize_text, strip_marks, text_hash, tokens,
};
