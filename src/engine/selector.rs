//! Candidate selectors for a recorded step.
//!
//! Candidates are tried in generation order: the recorded selector, the
//! recorder's own fallbacks, then fallbacks derived here from the selector
//! text and the element snapshot stored with the step.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::Step;

static POSITIONAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":nth-(?:of-type|child)\(\s*\d+\s*\)").expect("Invalid regex"));
static ATTRIBUTE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[[^\]]*\]").expect("Invalid regex"));
static CLASS_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.(-?[A-Za-z_][A-Za-z0-9_-]*)").expect("Invalid regex"));
static TEXT_MATCH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^([A-Za-z][A-Za-z0-9-]*|\*)\[text-content="(.*)"\]$"#).expect("Invalid regex")
});

/// Longest element text turned into a text-match candidate
const MAX_TEXT_LEN: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    Css(String),
    /// Element whose own text equals `text`, optionally restricted to a tag
    Text { text: String, tag: Option<String> },
}

impl Candidate {
    /// Recognise the recorder's `tag[text-content="..."]` pseudo-selector
    pub fn parse(selector: &str) -> Self {
        let selector = selector.trim();
        match TEXT_MATCH.captures(selector) {
            Some(caps) => {
                let tag = &caps[1];
                Candidate::Text {
                    text: caps[2].replace("\\\"", "\""),
                    tag: (tag != "*").then(|| tag.to_lowercase()),
                }
            }
            None => Candidate::Css(selector.to_string()),
        }
    }

    pub fn as_css(&self) -> Option<&str> {
        match self {
            Candidate::Css(s) => Some(s),
            Candidate::Text { .. } => None,
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Candidate::Css(s) => f.write_str(s),
            Candidate::Text { text, tag } => write!(
                f,
                "{}[text-content=\"{}\"]",
                tag.as_deref().unwrap_or("*"),
                text
            ),
        }
    }
}

/// Ordered, de-duplicated candidates for `step`. The recorded selector is always first.
pub fn candidates(step: &Step) -> Vec<Candidate> {
    let mut out: Vec<Candidate> = Vec::new();
    let mut push = |c: Candidate| {
        let empty = match &c {
            Candidate::Css(s) => s.is_empty(),
            Candidate::Text { text, .. } => text.is_empty(),
        };
        if !empty && !out.contains(&c) {
            out.push(c);
        }
    };

    let primary = step.selector.trim();
    push(Candidate::parse(primary));

    for fallback in &step.options.fallback_selectors {
        push(Candidate::parse(fallback));
    }

    for derived in derived_from_selector(primary) {
        push(Candidate::Css(derived));
    }

    let fragments = match Candidate::parse(primary) {
        Candidate::Css(_) => class_fragments(primary),
        Candidate::Text { .. } => Vec::new(),
    };
    for hint in fragments.iter().chain(&step.options.class_hints) {
        let hint = hint.trim().trim_start_matches('.');
        if hint.is_empty() || hint.contains('"') {
            continue;
        }
        push(Candidate::Css(format!("[class*=\"{}\"]", hint)));
        push(Candidate::Css(format!("div[class*=\"{}\"]", hint)));
    }

    if let Some(text) = step.options.element_text.as_deref() {
        let text = text.trim();
        if !text.is_empty() && text.chars().count() < MAX_TEXT_LEN {
            let tag = step
                .options
                .tag_name
                .as_deref()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty());
            if tag.is_some() {
                push(Candidate::Text {
                    text: text.to_string(),
                    tag,
                });
            }
            push(Candidate::Text {
                text: text.to_string(),
                tag: None,
            });
        }
    }

    out
}

/// Relaxed and class-only variants of a recorded CSS path
fn derived_from_selector(selector: &str) -> Vec<String> {
    if selector.is_empty() || TEXT_MATCH.is_match(selector) {
        return Vec::new();
    }
    let mut out = Vec::new();

    let relaxed = POSITIONAL.replace_all(selector, "").to_string();
    if relaxed != selector {
        out.push(relaxed);
    }

    let without_attrs = ATTRIBUTE_BLOCK.replace_all(selector, "");
    let last_part = without_attrs
        .rsplit('>')
        .next()
        .unwrap_or_default()
        .split_whitespace()
        .last()
        .unwrap_or_default()
        .to_string();
    if let Some(first) = CLASS_TOKEN.captures(&last_part) {
        out.push(format!(".{}", &first[1]));
    }

    for caps in CLASS_TOKEN.captures_iter(&without_attrs) {
        out.push(format!(".{}", &caps[1]));
    }

    out
}

/// Class fragments of a selector, used when searching for similar elements
pub fn class_fragments(selector: &str) -> Vec<String> {
    let without_attrs = ATTRIBUTE_BLOCK.replace_all(selector, "");
    let mut out: Vec<String> = Vec::new();
    for caps in CLASS_TOKEN.captures_iter(&without_attrs) {
        let class = caps[1].to_string();
        if !out.contains(&class) {
            out.push(class);
        }
    }
    out
}
