//! Edit distance and positional token diff.
//!
//! Token diff is index-aligned: token `i` of the candidate is compared with
//! token `i` of the baseline. Index drift shows up as a run of `replace` ops,
//! which is itself a useful signal for verse-length texts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::normalize::{letter_count, normalize_text, tokens};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    Equal,
    /// Present in the candidate only
    Insert,
    /// Present in the baseline only
    Delete,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenDiffOp {
    pub index: usize,
    pub kind: DiffKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharOp {
    pub kind: DiffKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<char>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<char>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CharStats {
    pub candidate_chars: usize,
    pub baseline_chars: usize,
    pub candidate_letters: usize,
    pub baseline_letters: usize,
}

/// Character-level sub-diff for one replaced token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaceDetail {
    pub edit_distance: usize,
    pub match_score: f64,
    pub char_stats: CharStats,
    pub ops: Vec<CharOp>,
}

/// Result of aligning a candidate text against a baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alignment {
    pub edit_distance: usize,
    pub match_score: f64,
    pub token_ops: Vec<TokenDiffOp>,
    pub char_stats: CharStats,

    /// Keyed by token index of each `replace` op
    pub replace_details: BTreeMap<usize, ReplaceDetail>,
}

/// Levenshtein distance with unit costs (two-row DP)
pub fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// `1 - distance / max(len_a, len_b, 1)`, clamped to [0, 1]
pub fn match_score(edit_distance: usize, len_a: usize, len_b: usize) -> f64 {
    let denom = len_a.max(len_b).max(1) as f64;
    (1.0 - edit_distance as f64 / denom).clamp(0.0, 1.0)
}

/// Match score of two texts after normalization, without building a diff
pub fn similarity(candidate: &str, baseline: &str) -> f64 {
    let a: Vec<char> = normalize_text(candidate).chars().collect();
    let b: Vec<char> = normalize_text(baseline).chars().collect();
    match_score(levenshtein(&a, &b), a.len(), b.len())
}

/// Full alignment of `candidate` against `baseline`
pub fn align(candidate: &str, baseline: &str) -> Alignment {
    let candidate = normalize_text(candidate);
    let baseline = normalize_text(baseline);

    let a: Vec<char> = candidate.chars().collect();
    let b: Vec<char> = baseline.chars().collect();
    let edit_distance = levenshtein(&a, &b);

    let cand_tokens = tokens(&candidate);
    let base_tokens = tokens(&baseline);
    let width = cand_tokens.len().max(base_tokens.len());

    let mut token_ops = Vec::with_capacity(width);
    let mut replace_details = BTreeMap::new();

    for index in 0..width {
        let op = match (cand_tokens.get(index), base_tokens.get(index)) {
            (Some(c), Some(b)) if c == b => TokenDiffOp {
                index,
                kind: DiffKind::Equal,
                candidate: Some(c.to_string()),
                baseline: Some(b.to_string()),
            },
            (Some(c), Some(b)) => {
                replace_details.insert(index, replace_detail(c, b));
                TokenDiffOp {
                    index,
                    kind: DiffKind::Replace,
                    candidate: Some(c.to_string()),
                    baseline: Some(b.to_string()),
                }
            }
            (Some(c), None) => TokenDiffOp {
                index,
                kind: DiffKind::Insert,
                candidate: Some(c.to_string()),
                baseline: None,
            },
            (None, Some(b)) => TokenDiffOp {
                index,
                kind: DiffKind::Delete,
                candidate: None,
                baseline: Some(b.to_string()),
            },
            (None, None) => continue,
        };
        token_ops.push(op);
    }

    Alignment {
        edit_distance,
        match_score: match_score(edit_distance, a.len(), b.len()),
        token_ops,
        char_stats: char_stats(&candidate, &baseline),
        replace_details,
    }
}

fn char_stats(candidate: &str, baseline: &str) -> CharStats {
    CharStats {
        candidate_chars: candidate.chars().count(),
        baseline_chars: baseline.chars().count(),
        candidate_letters: letter_count(candidate),
        baseline_letters: letter_count(baseline),
    }
}

fn replace_detail(candidate: &str, baseline: &str) -> ReplaceDetail {
    let a: Vec<char> = candidate.chars().collect();
    let b: Vec<char> = baseline.chars().collect();
    let ops = char_ops(&a, &b);
    let edit_distance = ops.iter().filter(|op| op.kind != DiffKind::Equal).count();

    ReplaceDetail {
        edit_distance,
        match_score: match_score(edit_distance, a.len(), b.len()),
        char_stats: char_stats(candidate, baseline),
        ops,
    }
}

/// Minimal edit script from the full DP matrix (tokens are short)
pub fn char_ops(a: &[char], b: &[char]) -> Vec<CharOp> {
    let rows = a.len() + 1;
    let cols = b.len() + 1;
    let mut dp = vec![0usize; rows * cols];

    for i in 0..rows {
        dp[i * cols] = i;
    }
    for j in 0..cols {
        dp[j] = j;
    }
    for i in 1..rows {
        for j in 1..cols {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            dp[i * cols + j] = (dp[(i - 1) * cols + j - 1] + cost)
                .min(dp[(i - 1) * cols + j] + 1)
                .min(dp[i * cols + j - 1] + 1);
        }
    }

    let mut ops = Vec::new();
    let (mut i, mut j) = (a.len(), b.len());
    while i > 0 || j > 0 {
        let here = dp[i * cols + j];
        if i > 0 && j > 0 {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            if here == dp[(i - 1) * cols + j - 1] + cost {
                ops.push(CharOp {
                    kind: if cost == 0 { DiffKind::Equal } else { DiffKind::Replace },
                    candidate: Some(a[i - 1]),
                    baseline: Some(b[j - 1]),
                });
                i -= 1;
                j -= 1;
                continue;
            }
        }
        if i > 0 && here == dp[(i - 1) * cols + j] + 1 {
            ops.push(CharOp {
                kind: DiffKind::Insert,
                candidate: Some(a[i - 1]),
                baseline: None,
            });
            i -= 1;
        } else {
            ops.push(CharOp {
                kind: DiffKind::Delete,
                candidate: None,
                baseline: Some(b[j - 1]),
            });
            j -= 1;
        }
    }

    ops.reverse();
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    #[test]
    fn test_levenshtein_classic() {
        assert_eq!(levenshtein(&chars("kitten"), &chars("sitting")), 3);
        assert_eq!(levenshtein(&chars(""), &chars("abc")), 3);
        assert_eq!(levenshtein(&chars("abc"), &chars("")), 3);
        assert_eq!(levenshtein(&chars("flaw"), &chars("lawn")), 2);
    }

    #[test]
    fn test_identical_scores_one() {
        let result = align("בראשית ברא", "  בראשית   ברא ");
        assert_eq!(result.edit_distance, 0);
        assert_eq!(result.match_score, 1.0);
        assert!(result.token_ops.iter().all(|op| op.kind == DiffKind::Equal));
        assert!(result.replace_details.is_empty());
    }

    #[test]
    fn test_empty_inputs() {
        let result = align("", "");
        assert_eq!(result.edit_distance, 0);
        assert_eq!(result.match_score, 1.0);
        assert!(result.token_ops.is_empty());

        let result = align("abc", "");
        assert_eq!(result.match_score, 0.0);
        assert_eq!(result.token_ops[0].kind, DiffKind::Insert);
    }

    #[test]
    fn test_positional_token_ops() {
        let result = align("a bx c d", "a b c");
        let kinds: Vec<DiffKind> = result.token_ops.iter().map(|op| op.kind).collect();
        assert_eq!(
            kinds,
            vec![DiffKind::Equal, DiffKind::Replace, DiffKind::Equal, DiffKind::Insert]
        );

        let detail = &result.replace_details[&1];
        assert_eq!(detail.edit_distance, 1);
        assert_eq!(detail.match_score, 0.5);

        let result = align("a", "a b");
        assert_eq!(result.token_ops[1].kind, DiffKind::Delete);
        assert_eq!(result.token_ops[1].baseline.as_deref(), Some("b"));
    }

    #[test]
    fn test_positional_not_lcs() {
        // A leading insertion shifts every later index into a replace
        let result = align("x a b", "a b");
        let kinds: Vec<DiffKind> = result.token_ops.iter().map(|op| op.kind).collect();
        assert_eq!(kinds, vec![DiffKind::Replace, DiffKind::Replace, DiffKind::Insert]);
    }

    #[test]
    fn test_char_ops_reconstruct_inputs() {
        let a = chars("shalom");
        let b = chars("salem");
        let ops = char_ops(&a, &b);

        let rebuilt_a: String = ops.iter().filter_map(|op| op.candidate).collect();
        let rebuilt_b: String = ops.iter().filter_map(|op| op.baseline).collect();
        assert_eq!(rebuilt_a, "shalom");
        assert_eq!(rebuilt_b, "salem");

        let edits = ops.iter().filter(|op| op.kind != DiffKind::Equal).count();
        assert_eq!(edits, levenshtein(&a, &b));
    }

    #[test]
    fn test_match_score_bounds_and_monotonic() {
        for d in 0..=12 {
            let score = match_score(d, 10, 8);
            assert!((0.0..=1.0).contains(&score));
            assert!(score >= match_score(d + 1, 10, 8));
        }
        assert_eq!(match_score(0, 0, 0), 1.0);
    }

    #[test]
    fn test_similarity_matches_align() {
        let a = "ויאמר אלהים יהי אור";
        let b = "ויאמר אלהים יהי אורר";
        assert_eq!(similarity(a, b), align(a, b).match_score);
    }
}
