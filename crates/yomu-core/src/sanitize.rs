//! Text cleanup applied to every freshly fetched message.
//!
//! Feeds in the wild ship percent-encoded bodies, titles split across
//! several lines and all kinds of stray indentation. The sanitizer is a
//! pure, total function: malformed input degrades to a lossy decode and
//! never fails.

use std::sync::LazyLock;

use percent_encoding::percent_decode_str;
use regex::Regex;

use crate::models::Message;

static RE_WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s{2,}").unwrap());

static RE_BREAK_OR_LEADING_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\n\r]|^\s").unwrap());

/// Sanitize a single message, returning the cleaned copy.
pub fn sanitize(mut message: Message) -> Message {
    message.contents = decode(&message.contents);
    message.author = decode(&message.author);
    message.title = sanitize_title(&message.title);
    message
}

/// Sanitize every message in place.
pub fn sanitize_all(messages: &mut [Message]) {
    for message in messages.iter_mut() {
        *message = sanitize(std::mem::take(message));
    }
}

/// Decode a title, collapse whitespace runs, then strip line breaks and a
/// single leading whitespace character.
pub fn sanitize_title(title: &str) -> String {
    let decoded = decode(title);
    let collapsed = RE_WHITESPACE_RUN.replace_all(&decoded, " ");
    RE_BREAK_OR_LEADING_SPACE
        .replace_all(&collapsed, "")
        .into_owned()
}

/// Best-effort percent decoding. Invalid escapes are kept verbatim and
/// invalid UTF-8 is replaced with U+FFFD. One level is decoded per call, so
/// `%2520` becomes `%20` and only turns into a space on the next pass.
fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(title: &str, author: &str, contents: &str) -> Message {
        Message {
            title: title.into(),
            author: author.into(),
            contents: contents.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_collapses_whitespace_in_title() {
        assert_eq!(sanitize_title("Hello   \n\n  World"), "Hello World");
    }

    #[test]
    fn test_strips_line_breaks_and_leading_space() {
        assert_eq!(sanitize_title(" Leading"), "Leading");
        assert_eq!(sanitize_title("a\nb"), "ab");
        assert_eq!(sanitize_title("Line\r\nbreak"), "Line break");
        assert_eq!(sanitize_title("\n\tIndented"), "Indented");
    }

    #[test]
    fn test_decodes_percent_encoding() {
        let msg = sanitize(message("Caf%C3%A9%20news", "Jane%20Doe", "%3Cp%3Ehi%3C%2Fp%3E"));
        assert_eq!(msg.title, "Café news");
        assert_eq!(msg.author, "Jane Doe");
        assert_eq!(msg.contents, "<p>hi</p>");
    }

    #[test]
    fn test_malformed_encoding_degrades_gracefully() {
        assert_eq!(sanitize_title("100% sure"), "100% sure");
        assert_eq!(sanitize_title("%zz"), "%zz");
        assert_eq!(sanitize_title("bad %FF byte"), "bad \u{FFFD} byte");
    }

    #[test]
    fn test_idempotent() {
        let inputs = [
            message("  Breaking:\n\n  news   today ", "Some One", "<b>body</b>"),
            message("\r\nTitle", "", ""),
            message("plain", "author", "contents"),
            message("tabs\t\tand  spaces", "x", "y"),
        ];

        for input in inputs {
            let once = sanitize(input);
            let twice = sanitize(once.clone());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_double_encoded_escapes_decode_one_level_per_pass() {
        let once = sanitize(message("Save 50%2520 now", "", "<a href=\"/a%2520b\">x</a>"));
        assert_eq!(once.title, "Save 50%20 now");
        assert_eq!(once.contents, "<a href=\"/a%20b\">x</a>");

        let twice = sanitize(once);
        assert_eq!(twice.title, "Save 50 now");
        assert_eq!(twice.contents, "<a href=\"/a b\">x</a>");
    }

    #[test]
    fn test_sanitize_all_keeps_other_fields() {
        let mut msgs = vec![Message {
            url: "https://example.com/a".into(),
            is_important: true,
            ..message("A  \n B", "", "")
        }];
        sanitize_all(&mut msgs);
        assert_eq!(msgs[0].title, "A B");
        assert_eq!(msgs[0].url, "https://example.com/a");
        assert!(msgs[0].is_important);
    }
}
