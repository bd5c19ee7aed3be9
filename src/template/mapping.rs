use std::collections::HashMap;
use thiserror::Error;

/// Placeholder names that always resolve to the recipient's address.
pub const RESERVED_VARIABLES: [&str; 2] = ["mail", "email"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("Variable '{0}' is reserved. Please use a different name.")]
    ReservedVariable(String),

    #[error("Variable '{0}' is mapped more than once.")]
    DuplicateVariable(String),
}

/// Case-folded, trimmed form used for both mapping keys and placeholder
/// tokens.
pub fn fold_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Which column holds the address, and which column each template variable
/// reads from. Built per request, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMapping {
    pub email_column: String,
    variables: HashMap<String, String>,
}

impl ColumnMapping {
    /// Builds a mapping from raw `(variable, column)` pairs as entered by the
    /// user. Variable names may be written with their braces (`{{First}}`).
    /// Pairs with an empty side are ignored.
    pub fn new<I, K, V>(email_column: &str, variables: I) -> Result<Self, MappingError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut folded = HashMap::new();
        for (name, column) in variables {
            let name = name.as_ref().trim().trim_matches(|c| c == '{' || c == '}').trim();
            let column = column.as_ref().trim();
            if name.is_empty() || column.is_empty() {
                continue;
            }
            let key = fold_name(name);
            if RESERVED_VARIABLES.contains(&key.as_str()) {
                return Err(MappingError::ReservedVariable(name.to_string()));
            }
            if folded.insert(key, column.to_string()).is_some() {
                return Err(MappingError::DuplicateVariable(name.to_string()));
            }
        }

        Ok(Self {
            email_column: email_column.trim().to_string(),
            variables: folded,
        })
    }

    /// Column for a placeholder token, if the token names a mapped variable.
    pub fn column_for(&self, token: &str) -> Option<&str> {
        self.variables.get(&fold_name(token)).map(String::as_str)
    }

    pub fn variables(&self) -> impl Iterator<Item = (&str, &str)> {
        self.variables.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn has_email_column(&self) -> bool {
        !self.email_column.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_trimmed_folded_and_unbraced() {
        let mapping =
            ColumnMapping::new(" Email ", [(" {{First}} ", "FirstName"), ("Co", " Company ")]).unwrap();
        assert_eq!(mapping.email_column, "Email");
        assert_eq!(mapping.column_for("FIRST"), Some("FirstName"));
        assert_eq!(mapping.column_for(" co "), Some("Company"));
        assert_eq!(mapping.column_for("Last"), None);
    }

    #[test]
    fn empty_pairs_are_skipped() {
        let mapping = ColumnMapping::new("Email", [("", "A"), ("B", " ")]).unwrap();
        assert_eq!(mapping.variables().count(), 0);
    }

    #[test]
    fn reserved_and_duplicate_names_fail() {
        assert_eq!(
            ColumnMapping::new("Email", [("Mail", "A")]),
            Err(MappingError::ReservedVariable("Mail".to_string()))
        );
        assert_eq!(
            ColumnMapping::new("Email", [("first", "A"), ("First ", "B")]),
            Err(MappingError::DuplicateVariable("First".to_string()))
        );
    }
}
