//! Verse identifiers and canonical ordering.
//!
//! Verse ids are written `"<Book> <chapter>:<verse>"` (e.g. `"1 Samuel 3:10"`).
//! Ordering follows the Tanakh book order, then chapter and verse numerically,
//! so `"Genesis 2:1"` sorts after `"Genesis 1:31"` and before `"Exodus 1:1"`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical book order (Torah, Prophets, Writings)
pub const BOOK_ORDER: &[&str] = &[
    "Genesis",
    "Exodus",
    "Leviticus",
    "Numbers",
    "Deuteronomy",
    "Joshua",
    "Judges",
    "1 Samuel",
    "2 Samuel",
    "1 Kings",
    "2 Kings",
    "Isaiah",
    "Jeremiah",
    "Ezekiel",
    "Hosea",
    "Joel",
    "Amos",
    "Obadiah",
    "Jonah",
    "Micah",
    "Nahum",
    "Habakkuk",
    "Zephaniah",
    "Haggai",
    "Zechariah",
    "Malachi",
    "Psalms",
    "Proverbs",
    "Job",
    "Song of Songs",
    "Ruth",
    "Lamentations",
    "Ecclesiastes",
    "Esther",
    "Daniel",
    "Ezra",
    "Nehemiah",
    "1 Chronicles",
    "2 Chronicles",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid verse id '{0}' (expected '<Book> <chapter>:<verse>')")]
pub struct VerseIdError(pub String);

/// A parsed verse reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VerseId {
    pub book: String,
    pub chapter: u32,
    pub verse: u32,
}

impl VerseId {
    pub fn new(book: impl Into<String>, chapter: u32, verse: u32) -> Self {
        Self {
            book: book.into(),
            chapter,
            verse,
        }
    }

    /// Position of the book in canonical order (unknown books sort last)
    pub fn book_rank(&self) -> usize {
        book_rank(&self.book)
    }
}

pub fn book_rank(book: &str) -> usize {
    BOOK_ORDER
        .iter()
        .position(|b| b.eq_ignore_ascii_case(book))
        .unwrap_or(BOOK_ORDER.len())
}

impl Ord for VerseId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.book_rank()
            .cmp(&other.book_rank())
            .then_with(|| self.book.cmp(&other.book))
            .then_with(|| self.chapter.cmp(&other.chapter))
            .then_with(|| self.verse.cmp(&other.verse))
    }
}

impl PartialOrd for VerseId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for VerseId {
    type Err = VerseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let err = || VerseIdError(s.to_string());

        let (book, reference) = trimmed.rsplit_once(' ').ok_or_else(err)?;
        let (chapter, verse) = reference.split_once(':').ok_or_else(err)?;

        let book = book.trim();
        if book.is_empty() {
            return Err(err());
        }

        Ok(Self {
            book: book.to_string(),
            chapter: chapter.parse().map_err(|_| err())?,
            verse: verse.parse().map_err(|_| err())?,
        })
    }
}

impl TryFrom<String> for VerseId {
    type Error = VerseIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VerseId> for String {
    fn from(id: VerseId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for VerseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.book, self.chapter, self.verse)
    }
}

/// Inclusive verse range in canonical order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerseRange {
    pub start: VerseId,
    pub end: VerseId,
}

impl VerseRange {
    pub fn new(start: VerseId, end: VerseId) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self { start: end, end: start }
        }
    }

    pub fn single(verse: VerseId) -> Self {
        Self {
            start: verse.clone(),
            end: verse,
        }
    }

    pub fn contains(&self, verse: &VerseId) -> bool {
        &self.start <= verse && verse <= &self.end
    }
}

impl fmt::Display for VerseRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// A verse with its digital baseline text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verse {
    pub id: VerseId,
    pub baseline_text: String,
}
