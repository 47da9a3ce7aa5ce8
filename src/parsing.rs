//! Grammars for free-text model replies.
//!
//! Each parser has a documented fallback chain and never fails: a reply that
//! matches no grammar degrades to a coarser reading of the same text.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

/// Shorter candidates are treated as noise.
const MIN_VARIATION_CHARS: usize = 10;

static VARIATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)VARIATION\s*\d+:\s*(.*?)(?:REASONING:|$)").expect("valid regex")
});

static REASONING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)REASONING:\s*(.*?)(?:VARIATION|$)").expect("valid regex")
});

static LEADING_BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-*#]+\s*").expect("valid regex"));

static NUMBERED_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\d+[.)]\s*").expect("valid regex"));

static NUMBERED_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+[.)]\s*").expect("valid regex"));

static CLEAN_CONTEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)UNBIASED CONTEXT:\s*(.*?)(?:FILTERED OUT:|$)").expect("valid regex")
});

static FILTERED_OUT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)FILTERED OUT:\s*(.*)$").expect("valid regex"));

/// One proposed prompt and the model's justification for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Variation {
    pub text: String,
    pub reasoning: String,
}

/// Which grammar produced a parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariationSource {
    Structured,
    NumberedList,
    WholeResponse,
}

/// Parse a `VARIATION n: ... REASONING: ...` reply.
///
/// Fallbacks, in order: split on numbered list markers; the whole reply as
/// a single variation. At most `limit` variations are returned.
pub fn parse_variations(text: &str, limit: usize) -> (Vec<Variation>, VariationSource) {
    let reasonings: Vec<String> = REASONING_RE
        .captures_iter(text)
        .map(|c| c[1].trim().to_string())
        .collect();

    let mut variations = Vec::new();
    for (i, caps) in VARIATION_RE.captures_iter(text).enumerate() {
        let body = LEADING_BULLET_RE.replace(caps[1].trim(), "");
        let body = body.trim();
        if body.chars().count() > MIN_VARIATION_CHARS {
            variations.push(Variation {
                text: body.to_string(),
                reasoning: reasonings.get(i).cloned().unwrap_or_default(),
            });
        }
    }
    if !variations.is_empty() {
        variations.truncate(limit);
        return (variations, VariationSource::Structured);
    }

    for section in NUMBERED_SPLIT_RE.split(text) {
        let section = section.trim();
        if section.chars().count() > MIN_VARIATION_CHARS && !section.starts_with("REASONING") {
            variations.push(Variation {
                text: section.to_string(),
                reasoning: String::new(),
            });
        }
    }
    if !variations.is_empty() {
        debug!(count = variations.len(), "variation grammar missed, used numbered split");
        variations.truncate(limit);
        return (variations, VariationSource::NumberedList);
    }

    let whole = text.trim();
    if whole.chars().count() > MIN_VARIATION_CHARS {
        variations.push(Variation {
            text: whole.to_string(),
            reasoning: "Generated as fallback".to_string(),
        });
    }
    variations.truncate(limit);
    (variations, VariationSource::WholeResponse)
}

/// Parse a list with one `1.` / `2)` item per line. Unnumbered lines
/// continue the previous item; lines before the first item are ignored.
pub fn parse_numbered_lines(text: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current: Option<String> = None;

    for line in text.trim().lines() {
        if let Some(m) = NUMBERED_LINE_RE.find(line) {
            if let Some(done) = current.take() {
                push_nonempty(&mut items, done);
            }
            current = Some(line[m.end()..].trim().to_string());
        } else if let Some(ref mut item) = current {
            let line = line.trim();
            if !line.is_empty() {
                item.push(' ');
                item.push_str(line);
            }
        }
    }
    if let Some(done) = current {
        push_nonempty(&mut items, done);
    }
    items
}

fn push_nonempty(items: &mut Vec<String>, item: String) {
    let item = item.trim().to_string();
    if !item.is_empty() {
        items.push(item);
    }
}

/// Outcome of a context-filter call.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredContext {
    pub clean: String,
    pub filtered_out: Vec<String>,
    /// True when the reply had no `UNBIASED CONTEXT:` section.
    pub used_fallback: bool,
}

impl FilteredContext {
    /// The unfiltered context, used when the filter call fails.
    pub fn passthrough(raw_context: &str) -> Self {
        FilteredContext {
            clean: raw_context.to_string(),
            filtered_out: Vec::new(),
            used_fallback: true,
        }
    }
}

/// Parse an `UNBIASED CONTEXT: ... FILTERED OUT: ...` reply.
pub fn parse_filter_reply(text: &str, raw_context: &str) -> FilteredContext {
    let (clean, used_fallback) = match CLEAN_CONTEXT_RE.captures(text) {
        Some(caps) => (caps[1].trim().to_string(), false),
        None => (raw_context.to_string(), true),
    };

    let filtered_out = FILTERED_OUT_RE
        .captures(text)
        .map(|caps| {
            caps[1]
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    FilteredContext {
        clean,
        filtered_out,
        used_fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_variations_with_reasoning() {
        let reply = "VARIATION 1:\n- Summarize the article in three bullet points.\nREASONING: Bullets are easier to score.\n\nVARIATION 2:\nWrite a one-paragraph summary for executives.\nREASONING: Audience focus.";
        let (vars, source) = parse_variations(reply, 5);
        assert_eq!(source, VariationSource::Structured);
        assert_eq!(vars.len(), 2);
        assert_eq!(vars[0].text, "Summarize the article in three bullet points.");
        assert_eq!(vars[0].reasoning, "Bullets are easier to score.");
        assert_eq!(vars[1].reasoning, "Audience focus.");
    }

    #[test]
    fn structured_variations_respect_limit() {
        let reply = "VARIATION 1:\nFirst long enough prompt\nREASONING: a\nVARIATION 2:\nSecond long enough prompt\nREASONING: b";
        let (vars, _) = parse_variations(reply, 1);
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].text, "First long enough prompt");
    }

    #[test]
    fn short_structured_bodies_fall_through() {
        let reply = "VARIATION 1:\nshort\nREASONING: tiny";
        let (vars, source) = parse_variations(reply, 3);
        assert_ne!(source, VariationSource::Structured);
        assert_eq!(vars.len(), 1);
    }

    #[test]
    fn numbered_list_fallback() {
        let reply = "Ideas:\n1. Explain the answer step by step please\n2) Answer in formal English only";
        let (vars, source) = parse_variations(reply, 5);
        assert_eq!(source, VariationSource::NumberedList);
        assert_eq!(vars.len(), 2);
        assert_eq!(vars[1].text, "Answer in formal English only");
    }

    #[test]
    fn whole_response_fallback() {
        let (vars, source) = parse_variations("  Just answer concisely and politely.  ", 3);
        assert_eq!(source, VariationSource::WholeResponse);
        assert_eq!(vars[0].text, "Just answer concisely and politely.");
        assert_eq!(vars[0].reasoning, "Generated as fallback");
    }

    #[test]
    fn tiny_response_yields_nothing() {
        let (vars, _) = parse_variations("ok", 3);
        assert!(vars.is_empty());
    }

    #[test]
    fn numbered_lines_join_continuations() {
        let text = "Here you go:\n1. Translate the text\n   into French.\n2) Translate to French, keep names.\n\n3. Translate faithfully.";
        let items = parse_numbered_lines(text);
        assert_eq!(
            items,
            vec![
                "Translate the text into French.",
                "Translate to French, keep names.",
                "Translate faithfully.",
            ]
        );
    }

    #[test]
    fn numbered_lines_without_numbers_is_empty() {
        assert!(parse_numbered_lines("no list here").is_empty());
    }

    #[test]
    fn filter_reply_sections() {
        let reply = "UNBIASED CONTEXT:\nParis is the capital of France.\n\nFILTERED OUT:\n- 'Paris is overrated' (opinion)\n- weather tangent";
        let parsed = parse_filter_reply(reply, "raw");
        assert_eq!(parsed.clean, "Paris is the capital of France.");
        assert_eq!(parsed.filtered_out, vec!["- 'Paris is overrated' (opinion)", "- weather tangent"]);
        assert!(!parsed.used_fallback);
    }

    #[test]
    fn filter_reply_without_sections_keeps_raw() {
        let parsed = parse_filter_reply("I cannot help with that.", "the raw context");
        assert_eq!(parsed.clean, "the raw context");
        assert!(parsed.filtered_out.is_empty());
        assert!(parsed.used_fallback);
    }
}
