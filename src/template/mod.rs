pub mod mapping;
pub mod markup;

pub use mapping::{ColumnMapping, MappingError};

use crate::session::Row;
use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use thiserror::Error;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").unwrap());
static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Failed to read template file '{path}': {source}")]
    ReadError {
        path: String,
        source: std::io::Error,
    },
    #[error("Template format error: Missing 'Subject:' line or '---' separator")]
    FormatError,
}

/// Subject and body templates written with `{{Name}}` placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailTemplate {
    pub subject_template: String,
    pub body_template: String,
}

/// One recipient's rendering. `address` is empty when the row has none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedMessage {
    pub recipient_index: usize,
    pub address: String,
    pub subject_text: String,
    /// Body after substitution, before HTML formatting.
    pub body_text: String,
    pub body_html: String,
    /// text/plain part: template markup flattened, values kept verbatim.
    pub body_plain: String,
}

impl EmailTemplate {
    /// Loads a template from a file.
    /// Expects format:
    /// Subject: <subject template>
    /// ---
    /// <body template>
    pub fn load(template_path: &Path) -> Result<Self, TemplateError> {
        let content = fs::read_to_string(template_path).map_err(|e| TemplateError::ReadError {
            path: template_path.to_string_lossy().to_string(),
            source: e,
        })?;

        let mut lines = content.lines();
        let subject_line = lines.next().ok_or(TemplateError::FormatError)?;
        let separator = lines.next().ok_or(TemplateError::FormatError)?;

        if !subject_line.starts_with("Subject:") || separator.trim() != "---" {
            return Err(TemplateError::FormatError);
        }

        let subject = subject_line.trim_start_matches("Subject:").trim();
        let body = lines.collect::<Vec<&str>>().join("\n");
        Ok(Self::from_content(subject, &body))
    }

    pub fn from_content(subject: &str, body: &str) -> Self {
        EmailTemplate {
            subject_template: subject.to_string(),
            body_template: body.to_string(),
        }
    }

    /// Renders this template for one row. See [`render`].
    pub fn render(&self, index: usize, row: &Row, mapping: &ColumnMapping) -> RenderedMessage {
        render(&self.body_template, &self.subject_template, index, row, mapping)
    }
}

/// Cell text as used for rendering: trimmed, missing cells read as empty.
pub fn cell<'a>(row: &'a Row, column: &str) -> &'a str {
    row.get(column).map(|v| v.trim()).unwrap_or("")
}

pub fn is_valid_email(address: &str) -> bool {
    EMAIL.is_match(address.trim())
}

/// The recipient's address per the mapping's email column, trimmed.
pub fn recipient_address(row: &Row, mapping: &ColumnMapping) -> String {
    if mapping.has_email_column() {
        cell(row, &mapping.email_column).to_string()
    } else {
        String::new()
    }
}

/// Substitutes every `{{Name}}` in `body` and `subject` and formats the body
/// as HTML. Unknown placeholders are left as written. Pure: safe to call
/// concurrently for different rows.
pub fn render(
    body: &str,
    subject: &str,
    index: usize,
    row: &Row,
    mapping: &ColumnMapping,
) -> RenderedMessage {
    let address = recipient_address(row, mapping);
    let (subject_text, body_text, marked_body) = {
        let resolver = Resolver::new(row, mapping, &address);
        (
            resolver.substitute(subject, |value| value.to_string()).trim().to_string(),
            resolver.substitute(body, |value| value.to_string()),
            resolver.substitute(body, markup::literal),
        )
    };

    RenderedMessage {
        recipient_index: index,
        address,
        subject_text,
        body_text,
        body_html: markup::to_html(&marked_body),
        body_plain: markup::to_plain_text(&marked_body),
    }
}

struct Resolver<'a> {
    row: &'a Row,
    mapping: &'a ColumnMapping,
    address: &'a str,
    // lowercased column name -> column, first spelling wins
    columns_folded: HashMap<String, &'a str>,
    // alphanumeric-only key -> value, columns before variables
    loose: HashMap<String, &'a str>,
}

impl<'a> Resolver<'a> {
    fn new(row: &'a Row, mapping: &'a ColumnMapping, address: &'a str) -> Self {
        let mut columns_folded = HashMap::new();
        let mut loose = HashMap::new();

        let mut columns: Vec<&String> = row.keys().collect();
        columns.sort();
        for column in columns {
            columns_folded
                .entry(mapping::fold_name(column))
                .or_insert(column.as_str());
            let key = loose_key(column);
            if !key.is_empty() {
                loose.entry(key).or_insert(cell(row, column));
            }
        }
        for (name, column) in mapping.variables() {
            let key = loose_key(name);
            if !key.is_empty() {
                loose.entry(key).or_insert(cell(row, column));
            }
        }

        Self {
            row,
            mapping,
            address,
            columns_folded,
            loose,
        }
    }

    fn substitute(&self, text: &str, value_text: impl Fn(&str) -> String) -> String {
        PLACEHOLDER
            .replace_all(text, |caps: &Captures| match self.resolve(&caps[1]) {
                Some(value) => value_text(value),
                None => caps[0].to_string(),
            })
            .into_owned()
    }

    fn resolve(&self, token: &str) -> Option<&'a str> {
        let token = token.trim();
        let folded = mapping::fold_name(token);
        if mapping::RESERVED_VARIABLES.contains(&folded.as_str()) {
            return Some(self.address);
        }
        if let Some(column) = self.mapping.column_for(token) {
            return Some(cell(self.row, column));
        }
        if self.row.contains_key(token) {
            return Some(cell(self.row, token));
        }
        if let Some(column) = self.columns_folded.get(&folded) {
            return Some(cell(self.row, column));
        }
        self.loose.get(&loose_key(token)).copied()
    }
}

fn loose_key(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
