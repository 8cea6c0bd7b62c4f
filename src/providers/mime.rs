//! MIME text extraction, HTML-to-text conversion, and address helpers.

use std::collections::VecDeque;

use html2text::render::text_renderer::TrivialDecorator;
use mail_parser::{MessagePart, MimeHeaders, PartType};

/// Nesting beyond this depth yields an empty body.
pub const MAX_PART_DEPTH: usize = 64;

/// One node of a message body-part tree. Leaf data is already decoded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BodyPart {
    pub mime_type: String,
    pub data: Option<Vec<u8>>,
    pub children: Vec<BodyPart>,
}

impl BodyPart {
    pub fn leaf(mime_type: &str, data: impl Into<Vec<u8>>) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            data: Some(data.into()),
            children: Vec::new(),
        }
    }

    pub fn multipart(mime_type: &str, children: Vec<BodyPart>) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            data: None,
            children,
        }
    }
}

/// Best-effort plain text for a body-part tree.
///
/// All `text/plain` leaves are concatenated in breadth-first order, as are
/// all `text/html` leaves. Non-blank plain text wins; otherwise the HTML is
/// converted to text; otherwise the result is empty.
pub fn extract_text(root: &BodyPart) -> String {
    let mut plain = String::new();
    let mut html = String::new();
    let mut queue = VecDeque::from([(root, 0_usize)]);

    while let Some((part, depth)) = queue.pop_front() {
        if depth > MAX_PART_DEPTH {
            tracing::warn!(depth, "Body part tree nested too deeply, dropping body");
            return String::new();
        }
        if let Some(data) = &part.data {
            let mime = part.mime_type.to_ascii_lowercase();
            if mime == "text/plain" {
                plain.push_str(&String::from_utf8_lossy(data));
            } else if mime == "text/html" {
                html.push_str(&String::from_utf8_lossy(data));
            }
        }
        queue.extend(part.children.iter().map(|c| (c, depth + 1)));
    }

    if !plain.trim().is_empty() {
        plain
    } else if !html.trim().is_empty() {
        html_to_text(&html)
    } else {
        String::new()
    }
}

/// Wrap width handed to the renderer. Wide enough that prose is not re-wrapped.
const RENDER_WIDTH: usize = 1000;

/// Render HTML as undecorated text.
///
/// Line ends are trimmed and runs of blank lines collapse to one. A renderer
/// panic on hostile markup yields an empty string.
pub fn html_to_text(html: &str) -> String {
    let rendered = std::panic::catch_unwind(|| {
        html2text::from_read_with_decorator(html.as_bytes(), RENDER_WIDTH, TrivialDecorator::new())
    });
    let Ok(rendered) = rendered else {
        tracing::warn!("HTML renderer panicked, dropping body");
        return String::new();
    };

    let mut lines: Vec<&str> = Vec::new();
    for line in rendered.lines().map(str::trim_end) {
        if line.is_empty() && lines.last().is_none_or(|l| l.is_empty()) {
            continue;
        }
        lines.push(line);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// Bare address from a `Name <addr>` header value.
///
/// Uses the first angle-bracketed token, else the trimmed raw value.
pub fn bare_address(raw: &str) -> String {
    if let Some(start) = raw.find('<')
        && let Some(len) = raw[start + 1..].find('>')
    {
        return raw[start + 1..start + 1 + len].trim().to_string();
    }
    raw.trim().to_string()
}

/// Build a body-part tree from a parsed message.
///
/// Attachments and embedded messages are left out.
pub fn part_tree(message: &mail_parser::Message) -> BodyPart {
    convert_part(message, 0, 0)
}

fn convert_part(message: &mail_parser::Message, index: usize, depth: usize) -> BodyPart {
    let Some(part) = message.parts.get(index) else {
        return BodyPart::default();
    };
    // A node past the cap still sits past it in the tree, so `extract_text` rejects it.
    if depth > MAX_PART_DEPTH || is_attachment(part) {
        return BodyPart::default();
    }
    match &part.body {
        PartType::Text(text) => BodyPart::leaf("text/plain", text.as_bytes()),
        PartType::Html(html) => BodyPart::leaf("text/html", html.as_bytes()),
        PartType::Multipart(ids) => BodyPart::multipart(
            "multipart/mixed",
            ids.iter()
                .map(|id| convert_part(message, *id as usize, depth + 1))
                .collect(),
        ),
        PartType::Binary(_) | PartType::InlineBinary(_) | PartType::Message(_) => BodyPart::default(),
    }
}

fn is_attachment(part: &MessagePart) -> bool {
    part.content_disposition()
        .is_some_and(|d| d.ctype().eq_ignore_ascii_case("attachment"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── extract_text ────────────────────────────────────────────────

    #[test]
    fn plain_text_preferred_over_html() {
        let tree = BodyPart::multipart(
            "multipart/alternative",
            vec![
                BodyPart::leaf("text/html", "<p>Rich</p>"),
                BodyPart::leaf("text/plain", "Plain body"),
            ],
        );
        assert_eq!(extract_text(&tree), "Plain body");
    }

    #[test]
    fn split_plain_parts_concatenate_breadth_first() {
        let tree = BodyPart::multipart(
            "multipart/mixed",
            vec![
                BodyPart::multipart("multipart/alternative", vec![BodyPart::leaf("text/plain", "deep")]),
                BodyPart::leaf("text/plain", "first "),
                BodyPart::leaf("text/plain", "second "),
            ],
        );
        assert_eq!(extract_text(&tree), "first second deep");
    }

    #[test]
    fn html_used_when_plain_blank() {
        let tree = BodyPart::multipart(
            "multipart/alternative",
            vec![
                BodyPart::leaf("text/plain", "   \n"),
                BodyPart::leaf("text/html", "<p>Hello</p><p>World</p>"),
            ],
        );
        assert_eq!(extract_text(&tree), "Hello\n\nWorld");
    }

    #[test]
    fn empty_when_no_text_leaves() {
        let tree = BodyPart::multipart(
            "multipart/mixed",
            vec![BodyPart::leaf("application/pdf", vec![0_u8, 1, 2])],
        );
        assert_eq!(extract_text(&tree), "");
    }

    #[test]
    fn mime_type_match_is_case_insensitive() {
        assert_eq!(extract_text(&BodyPart::leaf("Text/Plain", "ok")), "ok");
    }

    #[test]
    fn pathological_nesting_fails_open() {
        let mut tree = BodyPart::leaf("text/plain", "buried");
        for _ in 0..(MAX_PART_DEPTH + 2) {
            tree = BodyPart::multipart("multipart/mixed", vec![tree]);
        }
        assert_eq!(extract_text(&tree), "");
    }

    #[test]
    fn nesting_at_cap_is_read() {
        let mut tree = BodyPart::leaf("text/plain", "reachable");
        for _ in 0..MAX_PART_DEPTH {
            tree = BodyPart::multipart("multipart/mixed", vec![tree]);
        }
        assert_eq!(extract_text(&tree), "reachable");
    }

    // ── html_to_text ────────────────────────────────────────────────

    #[test]
    fn html_basic() {
        assert_eq!(html_to_text("<p>Hello</p>"), "Hello");
    }

    #[test]
    fn html_inline_tags_collapse() {
        assert_eq!(
            html_to_text("<div><b>Bold</b> and <i>italic</i></div>"),
            "Bold and italic"
        );
    }

    #[test]
    fn html_line_breaks_preserved() {
        assert_eq!(html_to_text("Line one<br>Line two<br/>Line three"), "Line one\nLine two\nLine three");
    }

    #[test]
    fn html_script_and_style_dropped() {
        let html = "<style>p { color: red }</style><p>Visible</p><script>alert(1)</script>";
        assert_eq!(html_to_text(html), "Visible");
    }

    #[test]
    fn html_entities_decoded() {
        assert_eq!(html_to_text("<p>Fish &amp; chips &lt;3</p>"), "Fish & chips <3");
    }

    #[test]
    fn html_named_and_numeric_entities_decoded() {
        assert_eq!(
            html_to_text("<p>caf&eacute; &#8217;s &mdash; &#x2019;</p>"),
            "caf\u{e9} \u{2019}s \u{2014} \u{2019}"
        );
    }

    #[test]
    fn html_blank_runs_collapse() {
        assert_eq!(html_to_text("<p>A</p><p></p><p></p><p>B</p>"), "A\n\nB");
    }

    #[test]
    fn html_plain_passthrough() {
        assert_eq!(html_to_text("No HTML here"), "No HTML here");
    }

    // ── bare_address ────────────────────────────────────────────────

    #[test]
    fn bare_address_from_display_name() {
        assert_eq!(bare_address("Alice Smith <alice@example.com>"), "alice@example.com");
    }

    #[test]
    fn bare_address_without_brackets() {
        assert_eq!(bare_address("  bob@example.com "), "bob@example.com");
    }

    #[test]
    fn bare_address_takes_first_token() {
        assert_eq!(bare_address("<a@x.com>, B <b@x.com>"), "a@x.com");
    }

    #[test]
    fn bare_address_empty() {
        assert_eq!(bare_address(""), "");
    }

    // ── part_tree ───────────────────────────────────────────────────

    #[test]
    fn part_tree_from_multipart_alternative() {
        let raw = concat!(
            "From: a@example.com\r\n",
            "Subject: test\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/alternative; boundary=\"b1\"\r\n",
            "\r\n",
            "--b1\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "plain part\r\n",
            "--b1\r\n",
            "Content-Type: text/html; charset=utf-8\r\n",
            "\r\n",
            "<p>html part</p>\r\n",
            "--b1--\r\n",
        );
        let parsed = mail_parser::MessageParser::default()
            .parse(raw.as_bytes())
            .unwrap();
        let text = extract_text(&part_tree(&parsed));
        assert!(text.contains("plain part"));
        assert!(!text.contains("html part"));
    }

    #[test]
    fn part_tree_skips_text_attachments() {
        let raw = concat!(
            "From: a@example.com\r\n",
            "Subject: test\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/mixed; boundary=\"b2\"\r\n",
            "\r\n",
            "--b2\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "see attached\r\n",
            "--b2\r\n",
            "Content-Type: text/plain\r\n",
            "Content-Disposition: attachment; filename=\"log.txt\"\r\n",
            "\r\n",
            "secret log contents\r\n",
            "--b2--\r\n",
        );
        let parsed = mail_parser::MessageParser::default()
            .parse(raw.as_bytes())
            .unwrap();
        let text = extract_text(&part_tree(&parsed));
        assert!(text.contains("see attached"));
        assert!(!text.contains("secret log"));
    }
}
