//! Session title derivation from the first user message.

use crate::model::MessagePart;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Words kept when the text is space-delimited.
pub const MAX_TITLE_WORDS: usize = 10;
/// Characters kept when the text has no spaces (CJK and similar scripts).
pub const MAX_TITLE_CHARS_NO_SPACE: usize = 10;
/// Hard cap applied to every title.
pub const MAX_TITLE_CHARS: usize = 16;

const QUOTE_CHARS: &[char] = &['"', '\'', '“', '”', '‘', '’', '《', '》'];

/// `@[label](target)` file mentions inserted by the composer.
static FILE_MENTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@\[([^\]]*)\]\(([^)\s]*)\)").expect("valid mention regex"));

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// Derive a title candidate from message parts. Returns an empty string when the parts carry
/// no usable text.
pub fn derive_title(parts: &[MessagePart]) -> String {
    let text = parts
        .iter()
        .filter_map(|part| match part {
            MessagePart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    normalize_session_title(&text)
}

/// Normalize free text into a short session title.
pub fn normalize_session_title(raw: &str) -> String {
    let replaced = replace_file_mentions(raw);
    let first_line = replaced
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");
    let collapsed = WHITESPACE.replace_all(first_line, " ");
    let truncated = truncate_words_or_chars(collapsed.trim());
    let unquoted = truncated.trim_matches(QUOTE_CHARS).trim();
    take_chars(unquoted, MAX_TITLE_CHARS).trim().to_string()
}

fn replace_file_mentions(text: &str) -> String {
    FILE_MENTION
        .replace_all(text, |caps: &Captures<'_>| {
            let label = caps[1].trim();
            if !label.is_empty() {
                return label.to_string();
            }
            caps[2]
                .trim_end_matches('/')
                .rsplit(['/', '\\'])
                .next()
                .unwrap_or_default()
                .to_string()
        })
        .into_owned()
}

fn truncate_words_or_chars(text: &str) -> String {
    if text.contains(' ') {
        text.split(' ')
            .take(MAX_TITLE_WORDS)
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        take_chars(text, MAX_TITLE_CHARS_NO_SPACE).to_string()
    }
}

fn take_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_limit_then_hard_cap() {
        let title = normalize_session_title(
            "  Hello world this is a fairly long first message about something",
        );
        assert_eq!(title, "Hello world this");
    }

    #[test]
    fn no_space_text_keeps_ten_chars() {
        let title = normalize_session_title("你好这是一条很长的中文消息用于测试标题截断规则");
        assert_eq!(title, "你好这是一条很长的中");
    }

    #[test]
    fn strips_quotes_and_whitespace() {
        assert_eq!(normalize_session_title("“引用的标题”"), "引用的标题");
        assert_eq!(normalize_session_title("\"fix   the\tbug\""), "fix the bug");
        assert_eq!(normalize_session_title("《书名》"), "书名");
    }

    #[test]
    fn only_first_line_is_used() {
        assert_eq!(
            normalize_session_title("\n\n  Deploy plan \nsecond line here"),
            "Deploy plan"
        );
    }

    #[test]
    fn file_mentions_become_labels() {
        assert_eq!(
            normalize_session_title("Review @[main.rs](/home/me/project/src/main.rs)"),
            "Review main.rs"
        );
        assert_eq!(
            normalize_session_title("@[](/very/long/path/to/notes.md) summary"),
            "notes.md summary"
        );
    }

    #[test]
    fn empty_input_gives_empty_title() {
        assert_eq!(normalize_session_title(""), "");
        assert_eq!(normalize_session_title("   \n\t "), "");
        assert_eq!(derive_title(&[]), "");
    }

    #[test]
    fn derive_joins_text_parts_only() {
        let parts = vec![
            MessagePart::File {
                url: "file:///tmp/x.png".into(),
                filename: Some("x.png".into()),
                media_type: None,
            },
            MessagePart::text("  "),
            MessagePart::text("Summarize this image"),
        ];
        assert_eq!(derive_title(&parts), "Summarize this i");
    }
}
