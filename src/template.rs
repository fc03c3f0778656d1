// src/template.rs
//! HTML mail-merge helpers shared by the report templates and the receipt
//! letters.
//!
//! Placeholders are upper case words prefixed with `#`, e.g. `#DONORNAME`.
//! A repeating table row is marked by a sentinel token inside one `<tr>`; the
//! row is cut out as the row template and replaced by [`ROW_PLACEHOLDER`].

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

pub const ROW_PLACEHOLDER: &str = "#ROWTEMPLATE";

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#[A-Z][A-Z0-9_]*").expect("token pattern is valid"));
static HEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<head[\s>].*?</head>|<style[\s>].*?</style>|<script[\s>].*?</script>")
        .expect("head pattern is valid")
});
static LINE_BREAK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</p>|</div>|</tr>|</h[1-6]>|</li>|</table>")
        .expect("line break pattern is valid")
});
static CELL_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</t[dh]>").expect("cell pattern is valid"));
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("tag pattern is valid"));

/// Replaces every known `#TOKEN`; unknown tokens are left as they are so that
/// later passes (row tokens, the row placeholder) still find them.
pub fn replace_tokens(template: &str, values: &HashMap<&str, String>) -> String {
    TOKEN
        .replace_all(template, |caps: &Captures| {
            let token = &caps[0];
            values
                .get(token)
                .cloned()
                .unwrap_or_else(|| token.to_string())
        })
        .to_string()
}

/// Cuts the table row that contains `sentinel` out of `html`.
///
/// Returns the document with the row replaced by [`ROW_PLACEHOLDER`] and the
/// row markup itself. Without a sentinel inside a `<tr>..</tr>` the document
/// comes back unchanged with an empty row template.
pub fn get_table_row(html: &str, sentinel: &str) -> (String, String) {
    let lower = html.to_ascii_lowercase();
    let Some(pos) = html.find(sentinel) else {
        return (html.to_string(), String::new());
    };
    let Some(start) = lower[..pos].rfind("<tr") else {
        return (html.to_string(), String::new());
    };
    let Some(end) = lower[pos..].find("</tr>").map(|e| pos + e + "</tr>".len()) else {
        return (html.to_string(), String::new());
    };

    let row = html[start..end].to_string();
    let document = format!("{}{}{}", &html[..start], ROW_PLACEHOLDER, &html[end..]);
    (document, row)
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Plain text lines of an HTML document, for the PDF rendering.
pub fn html_to_text(html: &str) -> Vec<String> {
    let text = HEAD.replace_all(html, "");
    let text = LINE_BREAK.replace_all(&text, "\n");
    let text = CELL_END.replace_all(&text, "  ");
    let text = TAG.replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        // collapse runs of blank lines
        if line.is_empty() && lines.last().is_none_or(|l| l.is_empty()) {
            continue;
        }
        lines.push(line);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_tokens_keeps_unknown_tokens() {
        let mut values = HashMap::new();
        values.insert("#CITY", "Westhausen".to_string());

        let rendered = replace_tokens(
            "<p style=\"color: #FF0000\">#CITY #POSTALCODE</p>",
            &values,
        );
        assert_eq!(rendered, "<p style=\"color: #FF0000\">Westhausen #POSTALCODE</p>");
    }

    #[test]
    fn test_replace_tokens_does_not_match_prefixes() {
        let mut values = HashMap::new();
        values.insert("#DATE", "1. January 2018".to_string());

        let rendered = replace_tokens("#DATE / #DONATIONDATE", &values);
        assert_eq!(rendered, "1. January 2018 / #DONATIONDATE");
    }

    #[test]
    fn test_get_table_row_cuts_out_sentinel_row() {
        let html = "<table><tr><th>Amount</th></tr><TR class=\"row\"><td>#AMOUNT</td></TR></table>";
        let (document, row) = get_table_row(html, "#AMOUNT");

        assert_eq!(row, "<TR class=\"row\"><td>#AMOUNT</td></TR>");
        assert_eq!(document, "<table><tr><th>Amount</th></tr>#ROWTEMPLATE</table>");
    }

    #[test]
    fn test_get_table_row_without_sentinel() {
        let html = "<table><tr><td>nothing</td></tr></table>";
        let (document, row) = get_table_row(html, "#AMOUNT");

        assert_eq!(document, html);
        assert!(row.is_empty());
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("Smith & Sons <Ltd>"), "Smith &amp; Sons &lt;Ltd&gt;");
    }

    #[test]
    fn test_html_to_text() {
        let html = "<html><head><title>x</title><style>p { color: red }</style></head>\
                    <body><p>Dear   Hans,</p><br/><table><tr><td>01.02.2017</td><td>10.00 EUR</td></tr></table>\
                    <p>Smith &amp; Sons</p></body></html>";

        assert_eq!(
            html_to_text(html),
            vec!["Dear Hans,", "", "01.02.2017 10.00 EUR", "", "Smith & Sons"]
        );
    }
}
