use crate::session::{RecipientSession, SessionError};
use crate::template::{ColumnMapping, EmailTemplate, RenderedMessage};

/// Moves `index` by `direction` steps, wrapping around in both directions.
pub fn advance(index: usize, direction: i64, total: usize) -> Result<usize, SessionError> {
    if total == 0 {
        return Err(SessionError::NoRecipients);
    }
    let total = total as i64;
    let moved = (index as i64 % total) + (direction % total) + total;
    Ok((moved % total) as usize)
}

/// Maps whatever index the client sent onto `0..total`.
pub fn normalize_index(index: i64, total: usize) -> Result<usize, SessionError> {
    if total == 0 {
        return Err(SessionError::NoRecipients);
    }
    Ok(index.rem_euclid(total as i64) as usize)
}

/// Renders the recipient under the cursor.
pub fn current(
    session: &RecipientSession,
    index: usize,
    template: &EmailTemplate,
    mapping: &ColumnMapping,
) -> Result<RenderedMessage, SessionError> {
    let row = session.row_at(index)?;
    Ok(template.render(index, row, mapping))
}
