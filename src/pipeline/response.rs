//! Parsing of role output: the one place that knows how models misbehave.
//!
//! Even well-prompted models wrap answers in ` ``` ` fences, prepend
//! reasoning, emit Windows line endings or sprinkle zero-width characters.
//! Every cleanup heuristic lives here so callers only ever see:
//!
//! * [`clean_role_text`]: free text with the noise removed;
//! * [`parse_structured`]: typed data, or a classified [`ResponseParseError`];
//! * [`parse_critic_verdict`]: one of the three critic signals;
//! * [`extract_final_instruction`]: the instruction part of a proposer reply.

use crate::prompts::{
    CLARIFICATION_MARKER, FINAL_INSTRUCTION_MARKER, NO_STEP_MARKER, SATISFIED_MARKER,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

/// Why a structured response could not be parsed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResponseParseError {
    #[error("response is empty")]
    Empty,

    #[error("no JSON value found in response: {excerpt:?}")]
    NoJson { excerpt: String },

    #[error("invalid JSON ({detail}) in response: {excerpt:?}")]
    InvalidJson { detail: String, excerpt: String },
}

/// What the critic decided about a draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CriticVerdict {
    /// The draft is clear enough.
    Accept,
    /// The critic needs this question answered.
    Clarify(String),
    /// Neither signal could be recognised; carries the raw reply.
    Unrecognized(String),
}

// ── Cleanup ──────────────────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z0-9_-]*\n(.*)\n```\s*$").unwrap());

fn strip_fences(input: &str) -> &str {
    let trimmed = input.trim();
    match RE_OUTER_FENCES.captures(trimmed).and_then(|c| c.get(1)) {
        Some(m) => m.as_str(),
        None => trimmed,
    }
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

/// Zero-width spaces, BOM, soft hyphens and directional marks.
fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            !matches!(
                c,
                '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}'
                    | '\u{200E}' | '\u{200F}'
            )
        })
        .collect()
}

/// Clean free-form role output: fences, line endings, invisible characters,
/// trailing whitespace.
pub fn clean_role_text(input: &str) -> String {
    let s = remove_invisible_chars(input);
    let s = normalise_line_endings(&s);
    strip_fences(&s)
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Regex source for a prompt marker: trailing colon dropped, words
/// separated by any whitespace.
fn marker_pattern(marker: &str) -> String {
    marker
        .trim_end_matches(':')
        .split_whitespace()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\s+")
}

fn excerpt(s: &str) -> String {
    s.chars().take(120).collect()
}

// ── Structured output ────────────────────────────────────────────────────────

/// Parse a JSON value out of a role or detector reply.
///
/// Tries the cleaned text as-is, then the outermost `{…}` or `[…]` span
/// (models like to add a sentence before or after the JSON).
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T, ResponseParseError> {
    let cleaned = clean_role_text(raw);
    if cleaned.is_empty() {
        return Err(ResponseParseError::Empty);
    }

    let first_err = match serde_json::from_str::<T>(&cleaned) {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };

    let span = json_span(&cleaned).ok_or_else(|| ResponseParseError::NoJson {
        excerpt: excerpt(&cleaned),
    })?;
    if span.len() == cleaned.len() {
        return Err(ResponseParseError::InvalidJson {
            detail: first_err.to_string(),
            excerpt: excerpt(&cleaned),
        });
    }
    serde_json::from_str::<T>(span).map_err(|e| ResponseParseError::InvalidJson {
        detail: e.to_string(),
        excerpt: excerpt(span),
    })
}

/// The outermost JSON object or array in `s`, by first opener / last closer.
fn json_span(s: &str) -> Option<&str> {
    let start = s.find(['{', '['])?;
    let closer = if s[start..].starts_with('{') { '}' } else { ']' };
    let end = s.rfind(closer)?;
    (end > start).then(|| &s[start..=end])
}

// ── Critic verdicts ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct VerdictJson {
    verdict: String,
    #[serde(default)]
    question: Option<String>,
}

static RE_CLARIFY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?s)\b{}\b\s*:?\s*(.*)$",
        marker_pattern(CLARIFICATION_MARKER)
    ))
    .unwrap()
});

static RE_SATISFIED: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"\b{}\b", marker_pattern(SATISFIED_MARKER))).unwrap());

/// Classify a critic reply.
///
/// Accepts either a JSON object `{"verdict": "...", "question": "..."}` or
/// the plain-text markers `SATISFIED` / `CLARIFICATION_NEEDED: <question>`.
/// A clarification marker wins over an acceptance marker in the same reply.
/// A clarification request without a question, or anything else, is
/// [`CriticVerdict::Unrecognized`].
pub fn parse_critic_verdict(raw: &str) -> CriticVerdict {
    let cleaned = clean_role_text(raw);

    if cleaned.starts_with('{') {
        if let Ok(v) = parse_structured::<VerdictJson>(&cleaned) {
            let question = v.question.map(|q| q.trim().to_string()).unwrap_or_default();
            return match v.verdict.trim().to_ascii_lowercase().as_str() {
                "accept" | "accepted" | "satisfied" => CriticVerdict::Accept,
                "clarify" | "clarification_needed" if !question.is_empty() => {
                    CriticVerdict::Clarify(question)
                }
                _ => CriticVerdict::Unrecognized(cleaned),
            };
        }
    }

    if let Some(caps) = RE_CLARIFY.captures(&cleaned) {
        let question = caps
            .get(1)
            .map(|m| m.as_str().trim().trim_matches('"').trim())
            .unwrap_or_default();
        return if question.is_empty() {
            CriticVerdict::Unrecognized(cleaned)
        } else {
            CriticVerdict::Clarify(question.to_string())
        };
    }

    if RE_SATISFIED.is_match(&cleaned) {
        return CriticVerdict::Accept;
    }

    CriticVerdict::Unrecognized(cleaned)
}

// ── Proposer output ──────────────────────────────────────────────────────────

static RE_FINAL_INSTRUCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\**\s*{}\s*:\s*\**",
        marker_pattern(FINAL_INSTRUCTION_MARKER)
    ))
    .unwrap()
});

static RE_NO_STEP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\b{}", marker_pattern(NO_STEP_MARKER))).unwrap()
});

/// Take the text after the first `FINAL INSTRUCTION:` marker.
///
/// Without a marker (or with nothing after it) the whole cleaned reply is
/// the instruction.
pub fn extract_final_instruction(raw: &str) -> String {
    let cleaned = clean_role_text(raw);
    if let Some(m) = RE_FINAL_INSTRUCTION.find(&cleaned) {
        let rest = cleaned[m.end()..].trim();
        if !rest.is_empty() {
            return rest.to_string();
        }
    }
    cleaned
}

/// Whether a first draft says the image shows no assembly step at all.
pub fn reports_no_step(draft: &str) -> bool {
    RE_NO_STEP.is_match(&clean_role_text(draft))
}
