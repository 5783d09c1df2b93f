//! SQL generation helpers shared by the store.

use crate::store::StoreError;

/// The database driver flavor an identifier is quoted for.
///
/// Only SQLite is wired up today; the quoting rules for the others are kept
/// so generated SQL stays portable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Driver {
    #[default]
    Sqlite,
    MySql,
    Mssql,
}

/// Quote an identifier for the given driver.
///
/// Identifiers must match `[A-Za-z_][A-Za-z0-9_]*`; anything else is
/// rejected rather than escaped.
pub fn quote_identifier(driver: Driver, name: &str) -> Result<String, StoreError> {
    if !is_valid_identifier(name) {
        return Err(StoreError::InvalidIdentifier(name.to_string()));
    }
    Ok(match driver {
        Driver::Sqlite => format!("\"{name}\""),
        Driver::MySql => format!("`{name}`"),
        Driver::Mssql => format!("[{name}]"),
    })
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
