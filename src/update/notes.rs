//! Turns release-note payloads into a short list of display lines.

use once_cell::sync::Lazy;
use regex::Regex;

use super::models::RawReleaseNotes;

/// Number of note lines shown before collapsing the rest into "+N more".
pub const MAX_PREVIEW_ITEMS: usize = 3;
/// Longest single note line handed to the UI.
pub const MAX_NOTE_CHARS: usize = 120;

static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s{0,3}#{1,6}\s*").unwrap());
static BULLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+").unwrap());
static RULE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(?:[-*_]\s*){3,}$").unwrap());
static LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"!?\[([^\]]*)\]\([^)]*\)").unwrap());
static BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\*\*|__)(.+?)(\*\*|__)").unwrap());
static ITALIC_STAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*([^*\s][^*]*)\*").unwrap());
static ITALIC_UNDERSCORE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|[\s(])_([^_\s][^_]*)_").unwrap());
static INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]*)`").unwrap());
static CHECKSUM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^sha-?256\b.*\b[0-9a-f]{64}\b").unwrap());

/// Normalize `raw` into at most `MAX_PREVIEW_ITEMS` lines plus a "+N more" entry.
///
/// Never fails: when nothing usable is present the result is a single line
/// saying that `version` is available.
pub fn format_release_notes(raw: &RawReleaseNotes, version: &str) -> Vec<String> {
    let lines = match raw {
        RawReleaseNotes::Markdown(text) => markdown_lines(text),
        RawReleaseNotes::Items(items) => items
            .iter()
            .map(|item| item.trim())
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
        RawReleaseNotes::Missing => Vec::new(),
    };

    if lines.is_empty() {
        return vec![format!("Version {} is available", version)];
    }

    let total = lines.len();
    let mut preview: Vec<String> = lines
        .into_iter()
        .take(MAX_PREVIEW_ITEMS)
        .map(|line| truncate_line(&line))
        .collect();
    if total > MAX_PREVIEW_ITEMS {
        preview.push(format!("+{} more", total - MAX_PREVIEW_ITEMS));
    }
    preview
}

/// Strip markdown decoration and return the non-empty lines of `text`.
/// Published checksum lines are dropped.
pub fn markdown_lines(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| !RULE.is_match(line))
        .map(strip_markdown)
        .filter(|line| !line.is_empty() && !CHECKSUM.is_match(line))
        .collect()
}

fn strip_markdown(line: &str) -> String {
    let line = HEADING.replace(line, "");
    let line = BULLET.replace(&line, "");
    let line = LINK.replace_all(&line, "$1");
    let line = BOLD.replace_all(&line, "$2");
    let line = ITALIC_STAR.replace_all(&line, "$1");
    let line = ITALIC_UNDERSCORE.replace_all(&line, "$1$2");
    let line = INLINE_CODE.replace_all(&line, "$1");
    line.trim().to_string()
}

fn truncate_line(line: &str) -> String {
    if line.chars().count() <= MAX_NOTE_CHARS {
        return line.to_string();
    }
    let mut cut: String = line.chars().take(MAX_NOTE_CHARS - 3).collect();
    cut.push_str("...");
    cut
}
