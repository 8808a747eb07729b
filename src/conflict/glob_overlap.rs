//! Whether two path globs can match a common path.
//!
//! Patterns are compared segment by segment, with `**` standing for zero or
//! more whole segments. Inside a segment `*` and `?` are handled exactly;
//! character classes are treated as "any character", so the answer errs
//! towards reporting an overlap.

use crate::errors::{PhaseGateError, Result};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyChar,
    Star,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Globstar,
    Part(Vec<Token>),
}

#[derive(Debug, Clone)]
pub struct PathGlob {
    source: String,
    segments: Vec<Segment>,
}

impl PathGlob {
    pub fn parse(pattern: &str) -> Result<Self> {
        let invalid = |message: String| PhaseGateError::InvalidPattern {
            pattern: pattern.to_string(),
            message,
        };
        if pattern.trim().is_empty() {
            return Err(invalid("empty pattern".to_string()));
        }
        glob::Pattern::new(pattern).map_err(|e| invalid(e.to_string()))?;

        let trimmed = pattern.strip_prefix("./").unwrap_or(pattern);
        let segments = trimmed
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if s == "**" {
                    Segment::Globstar
                } else {
                    Segment::Part(tokenize(s))
                }
            })
            .collect::<Vec<_>>();
        if segments.is_empty() {
            return Err(invalid("pattern names no path".to_string()));
        }

        Ok(Self {
            source: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Every segment is a pure wildcard (`**`, `**/*`, `*/**`, ...).
    pub fn is_overly_broad(&self) -> bool {
        self.segments.iter().all(|segment| match segment {
            Segment::Globstar => true,
            Segment::Part(tokens) => tokens.iter().all(|t| *t == Token::Star),
        })
    }

    pub fn overlaps(&self, other: &PathGlob) -> bool {
        let mut memo = HashMap::new();
        segments_overlap(&self.segments, &other.segments, 0, 0, &mut memo)
    }
}

fn tokenize(segment: &str) -> Vec<Token> {
    let chars: Vec<char> = segment.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                // Consecutive stars inside a segment behave like one
                if tokens.last() != Some(&Token::Star) {
                    tokens.push(Token::Star);
                }
                i += 1;
            }
            '?' => {
                tokens.push(Token::AnyChar);
                i += 1;
            }
            '[' => {
                // `[]]` and `[!]]` include a literal `]` as the first member
                let mut j = i + 1;
                if chars.get(j) == Some(&'!') {
                    j += 1;
                }
                j += 1;
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                if j < chars.len() {
                    tokens.push(Token::AnyChar);
                    i = j + 1;
                } else {
                    tokens.push(Token::Literal('['));
                    i += 1;
                }
            }
            c => {
                tokens.push(Token::Literal(c));
                i += 1;
            }
        }
    }
    tokens
}

fn segments_overlap(
    a: &[Segment],
    b: &[Segment],
    i: usize,
    j: usize,
    memo: &mut HashMap<(usize, usize), bool>,
) -> bool {
    if let Some(&known) = memo.get(&(i, j)) {
        return known;
    }

    let result = match (a.get(i), b.get(j)) {
        (None, None) => true,
        (Some(Segment::Globstar), _) => {
            segments_overlap(a, b, i + 1, j, memo)
                || (j < b.len() && segments_overlap(a, b, i, j + 1, memo))
        }
        (_, Some(Segment::Globstar)) => {
            segments_overlap(a, b, i, j + 1, memo)
                || (i < a.len() && segments_overlap(a, b, i + 1, j, memo))
        }
        (Some(Segment::Part(x)), Some(Segment::Part(y))) => {
            tokens_overlap(x, y) && segments_overlap(a, b, i + 1, j + 1, memo)
        }
        _ => false,
    };

    memo.insert((i, j), result);
    result
}

/// Whether two single-segment patterns accept a common (non-empty) name.
fn tokens_overlap(x: &[Token], y: &[Token]) -> bool {
    let mut memo = vec![vec![None; y.len() + 1]; x.len() + 1];
    tokens_overlap_at(x, y, 0, 0, &mut memo)
}

fn tokens_overlap_at(
    x: &[Token],
    y: &[Token],
    i: usize,
    j: usize,
    memo: &mut [Vec<Option<bool>>],
) -> bool {
    if let Some(known) = memo[i][j] {
        return known;
    }

    let result = match (x.get(i), y.get(j)) {
        (None, None) => true,
        (Some(Token::Star), _) => {
            tokens_overlap_at(x, y, i + 1, j, memo)
                || (j < y.len() && tokens_overlap_at(x, y, i, j + 1, memo))
        }
        (_, Some(Token::Star)) => {
            tokens_overlap_at(x, y, i, j + 1, memo)
                || (i < x.len() && tokens_overlap_at(x, y, i + 1, j, memo))
        }
        (Some(Token::Literal(p)), Some(Token::Literal(q))) => {
            p == q && tokens_overlap_at(x, y, i + 1, j + 1, memo)
        }
        (Some(_), Some(_)) => tokens_overlap_at(x, y, i + 1, j + 1, memo),
        _ => false,
    };

    memo[i][j] = Some(result);
    result
}
