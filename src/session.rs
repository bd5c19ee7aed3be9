use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use uuid::Uuid;

/// One spreadsheet row: column name -> cell text.
pub type Row = HashMap<String, String>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session not found. Please upload the recipient file again.")]
    NotFound(String),

    #[error("Row {index} is out of range ({total} rows)")]
    IndexOutOfRange { index: usize, total: usize },

    #[error("The recipient list is empty.")]
    NoRecipients,

    #[error("Duplicate column name '{0}'")]
    DuplicateColumn(String),
}

/// What the (external) spreadsheet parser hands over: ordered column names
/// and positional rows.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParsedSpreadsheet {
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
}

impl ParsedSpreadsheet {
    /// Converts positional rows into keyed rows. Short rows are padded with
    /// empty cells, extra cells are dropped.
    pub fn into_parts(self) -> (Vec<String>, Vec<Row>) {
        let columns: Vec<String> = self.columns.iter().map(|c| c.trim().to_string()).collect();
        let rows = self
            .rows
            .into_iter()
            .map(|cells| {
                let mut cells = cells.into_iter();
                columns
                    .iter()
                    .map(|column| (column.clone(), cells.next().unwrap_or_default()))
                    .collect()
            })
            .collect();
        (columns, rows)
    }
}

/// In-memory record of one uploaded recipient set. Never mutated after
/// creation.
#[derive(Debug, Clone)]
pub struct RecipientSession {
    pub id: String,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub created_at: DateTime<Utc>,
}

impl RecipientSession {
    pub fn total(&self) -> usize {
        self.rows.len()
    }

    pub fn row_at(&self, index: usize) -> Result<&Row, SessionError> {
        self.rows.get(index).ok_or(SessionError::IndexOutOfRange {
            index,
            total: self.rows.len(),
        })
    }
}

/// Returned to the uploader after a session is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    pub columns: Vec<String>,
    pub total_rows: usize,
}

/// Process-wide map of sessions. Lives from process start to shutdown;
/// nothing is written to disk.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<RecipientSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new session under a freshly generated id.
    ///
    /// Column names are trimmed and must be distinct. Rows whose cells are
    /// all blank are dropped, and every kept row is normalised to carry
    /// exactly the session's columns.
    pub fn create(&self, columns: Vec<String>, rows: Vec<Row>) -> Result<SessionSummary, SessionError> {
        // (name as reported, trimmed name)
        let names: Vec<(String, String)> = columns
            .into_iter()
            .map(|raw| {
                let trimmed = raw.trim().to_string();
                (raw, trimmed)
            })
            .collect();
        let mut seen = HashSet::new();
        for (_, column) in &names {
            if !seen.insert(column.as_str()) {
                return Err(SessionError::DuplicateColumn(column.clone()));
            }
        }

        let rows: Vec<Row> = rows
            .into_iter()
            .map(|mut row| {
                names
                    .iter()
                    .map(|(raw, column)| {
                        let value = row
                            .remove(raw)
                            .or_else(|| row.remove(column))
                            .unwrap_or_default();
                        (column.clone(), value)
                    })
                    .collect::<Row>()
            })
            .filter(|row| row.values().any(|value| !value.trim().is_empty()))
            .collect();
        let columns: Vec<String> = names.into_iter().map(|(_, column)| column).collect();

        if rows.is_empty() {
            return Err(SessionError::NoRecipients);
        }

        let session = RecipientSession {
            id: Uuid::new_v4().simple().to_string(),
            columns,
            rows,
            created_at: Utc::now(),
        };
        let summary = SessionSummary {
            session_id: session.id.clone(),
            columns: session.columns.clone(),
            total_rows: session.rows.len(),
        };

        info!(
            "Created session {} with {} rows and {} columns",
            summary.session_id,
            summary.total_rows,
            summary.columns.len()
        );
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id.clone(), Arc::new(session));
        Ok(summary)
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<RecipientSession>, SessionError> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(session_id.trim()) {
            Some(session) => Ok(Arc::clone(session)),
            None => {
                debug!("Unknown session id {}", session_id);
                Err(SessionError::NotFound(session_id.to_string()))
            }
        }
    }

    /// Drops a session. Returns whether it existed.
    pub fn remove(&self, session_id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id.trim())
            .is_some();
        if removed {
            info!("Removed session {}", session_id.trim());
        }
        removed
    }

    /// Drops every session created before `cutoff`. Returns how many went.
    pub fn evict_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, session| session.created_at >= cutoff);
        let evicted = before - sessions.len();
        if evicted > 0 {
            info!("Evicted {} sessions older than {}", evicted, cutoff);
        }
        evicted
    }

    /// Out-of-range indexes are an error here; wrapping is the caller's job.
    pub fn row_at(&self, session_id: &str, index: usize) -> Result<Row, SessionError> {
        let session = self.get(session_id)?;
        session.row_at(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn create_then_lookup_by_index() {
        let registry = SessionRegistry::new();
        let summary = registry
            .create(
                columns(&["Email", "Name"]),
                vec![
                    row(&[("Email", "a@example.com"), ("Name", "Ana")]),
                    row(&[("Email", "b@example.com"), ("Name", "Ben")]),
                ],
            )
            .unwrap();

        assert_eq!(summary.total_rows, 2);
        assert_eq!(summary.columns, columns(&["Email", "Name"]));
        let second = registry.row_at(&summary.session_id, 1).unwrap();
        assert_eq!(second["Name"], "Ben");
    }

    #[test]
    fn every_create_gets_a_new_id() {
        let registry = SessionRegistry::new();
        let rows = vec![row(&[("Email", "a@example.com")])];
        let first = registry.create(columns(&["Email"]), rows.clone()).unwrap();
        let second = registry.create(columns(&["Email"]), rows).unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert!(registry.get(&first.session_id).is_ok());
    }

    #[test]
    fn unknown_session_is_not_found() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.get("missing"),
            Err(SessionError::NotFound(id)) if id == "missing"
        ));
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let registry = SessionRegistry::new();
        let summary = registry
            .create(columns(&["Email"]), vec![row(&[("Email", "a@example.com")])])
            .unwrap();
        assert_eq!(
            registry.row_at(&summary.session_id, 1),
            Err(SessionError::IndexOutOfRange { index: 1, total: 1 })
        );
    }

    #[test]
    fn blank_rows_are_dropped_and_missing_cells_filled() {
        let registry = SessionRegistry::new();
        let summary = registry
            .create(
                columns(&[" Email ", "Name"]),
                vec![
                    row(&[("Email", "  "), ("Name", "")]),
                    row(&[("Email", "a@example.com")]),
                ],
            )
            .unwrap();
        let session = registry.get(&summary.session_id).unwrap();
        assert_eq!(session.total(), 1);
        assert_eq!(session.rows[0].len(), 2);
        assert_eq!(session.rows[0]["Name"], "");
    }

    #[test]
    fn empty_or_duplicate_sheets_are_rejected() {
        let registry = SessionRegistry::new();
        assert_eq!(
            registry.create(columns(&["Email"]), vec![]),
            Err(SessionError::NoRecipients)
        );
        assert_eq!(
            registry.create(columns(&["Email", "Email "]), vec![row(&[("Email", "x")])]),
            Err(SessionError::DuplicateColumn("Email".to_string()))
        );
    }

    #[test]
    fn rows_keyed_by_untrimmed_column_names_keep_their_cells() {
        let registry = SessionRegistry::new();
        let summary = registry
            .create(
                columns(&[" Email ", "Name"]),
                vec![row(&[(" Email ", "a@x.io"), ("Name", "Ana")])],
            )
            .unwrap();
        assert_eq!(summary.columns, columns(&["Email", "Name"]));
        let first = registry.row_at(&summary.session_id, 0).unwrap();
        assert_eq!(first["Email"], "a@x.io");
        assert_eq!(first["Name"], "Ana");
        assert!(!first.contains_key(" Email "));
    }

    #[test]
    fn removed_and_stale_sessions_are_gone() {
        let registry = SessionRegistry::new();
        let rows = vec![row(&[("Email", "a@example.com")])];
        let first = registry.create(columns(&["Email"]), rows.clone()).unwrap();
        let second = registry.create(columns(&["Email"]), rows).unwrap();

        assert!(registry.remove(&first.session_id));
        assert!(!registry.remove(&first.session_id));
        assert!(matches!(
            registry.get(&first.session_id),
            Err(SessionError::NotFound(_))
        ));

        assert_eq!(registry.evict_older_than(Utc::now() - chrono::Duration::hours(1)), 0);
        assert!(registry.get(&second.session_id).is_ok());
        assert_eq!(registry.evict_older_than(Utc::now() + chrono::Duration::seconds(1)), 1);
        assert!(registry.get(&second.session_id).is_err());
    }

    #[test]
    fn positional_rows_become_keyed_rows() {
        let sheet = ParsedSpreadsheet {
            columns: columns(&["Email", "Name", "Company"]),
            rows: vec![vec!["a@example.com".into(), "Ana".into()]],
        };
        let (cols, rows) = sheet.into_parts();
        assert_eq!(cols.len(), 3);
        assert_eq!(rows[0]["Name"], "Ana");
        assert_eq!(rows[0]["Company"], "");
    }
}
