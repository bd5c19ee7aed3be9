//! Lightweight body markup: blank-line paragraphs, `- ` bullet lists,
//! `**bold**` and `[label](url)` links.

use regex::{Captures, Regex};
use std::sync::LazyLock;
use tera::escape_html;

static BOLD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*").unwrap());
static LINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").unwrap());

const LINK_SCHEMES: [&str; 3] = ["http://", "https://", "mailto:"];

// Markup characters inside substituted values travel as private-use
// stand-ins so they never open bold or link syntax.
const LITERALS: [(char, char, &str); 3] = [
    ('*', '\u{E000}', "&#42;"),
    ('[', '\u{E001}', "&#91;"),
    (']', '\u{E002}', "&#93;"),
];

/// Marks a substituted value as literal text for [`to_html`] and
/// [`to_plain_text`].
pub fn literal(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            LITERALS
                .iter()
                .find(|&&(markup, ..)| markup == c)
                .map_or(c, |&(_, stand_in, _)| stand_in)
        })
        .collect()
}

fn restore_literals(text: String, entities: bool) -> String {
    if !text.contains(|c: char| LITERALS.iter().any(|&(_, stand_in, _)| stand_in == c)) {
        return text;
    }
    LITERALS.iter().fold(text, |text, &(markup, stand_in, entity)| {
        if entities {
            text.replace(stand_in, entity)
        } else {
            text.replace(stand_in, &markup.to_string())
        }
    })
}

enum Block<'a> {
    Text(Vec<&'a str>),
    List(Vec<&'a str>),
}

/// Renders markup as an HTML fragment. All user text is escaped before any
/// tag is emitted.
pub fn to_html(text: &str) -> String {
    let escaped = escape_html(&text.replace("\r\n", "\n"));
    let mut out = Vec::new();

    for paragraph in paragraphs(&escaped) {
        for block in blocks(&paragraph) {
            match block {
                Block::Text(lines) => {
                    let lines: Vec<String> = lines.into_iter().map(inline).collect();
                    out.push(format!("<p>{}</p>", lines.join("<br>\n")));
                }
                Block::List(items) => {
                    let items: String = items
                        .into_iter()
                        .map(|item| format!("<li>{}</li>", inline(item)))
                        .collect();
                    out.push(format!("<ul>{items}</ul>"));
                }
            }
        }
    }

    restore_literals(out.join("\n"), true)
}

/// Plain-text counterpart used for text/plain parts and mail-app drafts.
pub fn to_plain_text(text: &str) -> String {
    let linked = LINK.replace_all(text, |caps: &Captures| format!("{} ({})", &caps[1], &caps[2]));
    restore_literals(BOLD.replace_all(&linked, "$1").into_owned(), false)
}

fn paragraphs(text: &str) -> Vec<Vec<&str>> {
    let mut paragraphs = Vec::new();
    let mut current = Vec::new();
    for line in text.split('\n') {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }
    paragraphs
}

fn blocks<'a>(lines: &[&'a str]) -> Vec<Block<'a>> {
    let mut blocks: Vec<Block<'a>> = Vec::new();
    for &line in lines {
        let item = line.trim_start().strip_prefix("- ");
        match (item, blocks.last_mut()) {
            (Some(item), Some(Block::List(items))) => {
                items.push(item);
                continue;
            }
            (None, Some(Block::Text(text))) => {
                text.push(line);
                continue;
            }
            _ => {}
        }
        blocks.push(match item {
            Some(item) => Block::List(vec![item]),
            None => Block::Text(vec![line]),
        });
    }
    blocks
}

fn inline(line: &str) -> String {
    let bolded = BOLD.replace_all(line, "<strong>$1</strong>");
    LINK.replace_all(&bolded, |caps: &Captures| {
        let url = unescape_html(caps[2].trim());
        if LINK_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
            format!(
                r#"<a href="{}" target="_blank" rel="noopener noreferrer">{}</a>"#,
                escape_html(&url),
                caps[1].trim()
            )
        } else {
            caps[0].to_string()
        }
    })
    .into_owned()
}

// Inverse of `escape_html` for the entities it produces.
fn unescape_html(text: &str) -> String {
    text.replace("&#x2F;", "/")
        .replace("&#x27;", "'")
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
