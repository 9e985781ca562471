//! Parsing of untrusted oracle replies into typed values.
//!
//! Every reply is free text. Anything referential (an index, a URL) is only
//! returned when it can be matched against the candidates the caller offered.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::core::types::CustomizationNeed;

/// A reply that does not match the line format a query asked for.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponseError {
    #[error("malformed {expected} reply: {reply:?}")]
    Malformed {
        expected: &'static str,
        reply: String,
    },
}

/// True if the reply starts with "yes" (case-insensitive).
pub fn is_yes(reply: &str) -> bool {
    reply.trim_start().to_lowercase().starts_with("yes")
}

/// The criterion verifier's reply rejects the draft when its opening contains "no".
pub fn verifier_rejects(reply: &str) -> bool {
    let head: String = reply.trim_start().chars().take(4).collect();
    head.to_lowercase().contains("no")
}

/// Convert `Key : Value` lines into a map, skipping malformed lines and `None` values.
pub fn lines_to_map(reply: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for line in reply.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = strip_decoration(key);
        let value = value.trim();
        if key.is_empty() || value.is_empty() || value.eq_ignore_ascii_case("none") {
            continue;
        }
        out.insert(key.to_string(), value.to_string());
    }
    out
}

fn strip_decoration(text: &str) -> &str {
    text.trim()
        .trim_start_matches(['-', '*', '•'])
        .trim()
        .trim_matches(['*', '\'', '"', '`'])
        .trim()
}

/// Render items as a 1-based numbered list, one item per line.
pub fn indexed_list<T: Display>(items: &[T]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {}", i + 1, item.to_string().replace('\n', "")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse whitespace-separated 1-based indices into 0-based positions.
///
/// `-1`, out-of-range and non-numeric tokens are dropped, as are repeats.
pub fn indexed_selection(reply: &str, len: usize) -> Vec<usize> {
    let mut picked = Vec::new();
    for token in reply.split(|c: char| c.is_whitespace() || c == ',') {
        let token = token.trim_matches(|c: char| !c.is_ascii_digit() && c != '-');
        let Ok(number) = token.parse::<i64>() else {
            continue;
        };
        if number < 1 || number as usize > len {
            continue;
        }
        let index = number as usize - 1;
        if !picked.contains(&index) {
            picked.push(index);
        }
    }
    picked
}

/// One classified link from the discovery classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkVerdict {
    Add(String),
    Browse(String),
}

static VERDICT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*]\s*)?(ADD|BROWSE):\s*(\S+)\s*$").expect("verdict regex should be valid")
});

/// Extract `ADD: <url>` / `BROWSE: <url>` lines; other lines are ignored.
pub fn link_verdicts(reply: &str) -> Vec<LinkVerdict> {
    reply
        .lines()
        .filter_map(|line| {
            let caps = VERDICT_RE.captures(line)?;
            let url = caps[2].to_string();
            Some(match &caps[1] {
                "ADD" => LinkVerdict::Add(url),
                _ => LinkVerdict::Browse(url),
            })
        })
        .collect()
}

/// Keep the reply lines that exactly match an offered candidate, in reply order.
pub fn matching_lines<'a>(reply: &str, candidates: &'a [String]) -> Vec<&'a String> {
    let mut kept: Vec<&String> = Vec::new();
    for line in reply.lines() {
        let line = strip_decoration(line);
        if let Some(found) = candidates.iter().find(|c| c.as_str() == line)
            && !kept.contains(&found)
        {
            kept.push(found);
        }
    }
    kept
}

/// First non-empty line that looks like an http(s) URL.
pub fn first_url(reply: &str) -> Option<String> {
    reply
        .lines()
        .map(strip_decoration)
        .find(|line| line.starts_with("http://") || line.starts_with("https://"))
        .map(str::to_string)
}

/// Customization named by an add-to-cart failure diagnosis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureCause {
    pub group: String,
    pub value: String,
}

/// Parse a `Cause : detail` diagnosis. `None` means no evident cause.
pub fn failure_cause(reply: &str) -> Result<Option<FailureCause>, ResponseError> {
    let trimmed = reply.trim();
    if trimmed.is_empty() || trimmed.to_lowercase().starts_with("none") {
        return Ok(None);
    }
    let malformed = || ResponseError::Malformed {
        expected: "failure cause",
        reply: reply.to_string(),
    };
    let line = trimmed.lines().next().ok_or_else(malformed)?;
    let (group, value) = line.split_once(':').ok_or_else(malformed)?;
    let group = strip_decoration(group);
    let value = strip_decoration(value);
    if group.is_empty() || value.is_empty() {
        return Err(malformed());
    }
    Ok(Some(FailureCause {
        group: group.to_string(),
        value: value.to_string(),
    }))
}

/// Map `Option : required|default` lines. Unknown classifications count as required.
pub fn customization_needs(reply: &str) -> BTreeMap<String, CustomizationNeed> {
    lines_to_map(reply)
        .into_iter()
        .map(|(group, need)| {
            let need = if need.to_lowercase().contains("default") {
                CustomizationNeed::Default
            } else {
                CustomizationNeed::Required
            };
            (group, need)
        })
        .collect()
}

static LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\W*([A-Za-z_]+)").expect("label regex should be valid"));

/// Leading status word of the final outcome reply, upper-cased.
pub fn outcome_label(reply: &str) -> Option<String> {
    LABEL_RE
        .captures(reply.trim())
        .map(|caps| caps[1].to_uppercase())
}
