// sqlx::Error -> PublishError
// Orphan rules keep From<sqlx::Error> out of core, so adapters map explicitly

use contentmap_core::error::PublishError;

pub(crate) fn map_sqlx_error(err: sqlx::Error) -> PublishError {
    match &err {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: https://www.sqlite.org/rescode.html
            match db_err.code().as_deref() {
                Some(code @ ("2067" | "1555")) => PublishError::Store(format!(
                    "Unique constraint violation: {} ({})",
                    db_err.message(),
                    code
                )),
                Some("5") => PublishError::Store(format!(
                    "Database locked (SQLITE_BUSY): {}",
                    db_err.message()
                )),
                Some("13") => {
                    PublishError::Store(format!("Database full: {}", db_err.message()))
                }
                Some(code) => PublishError::Store(format!(
                    "Database error [{}]: {}",
                    code,
                    db_err.message()
                )),
                None => PublishError::Store(format!("Database error: {}", db_err.message())),
            }
        }
        sqlx::Error::RowNotFound => PublishError::Store("Row not found".to_string()),
        sqlx::Error::ColumnNotFound(col) => {
            PublishError::Store(format!("Column not found: {}", col))
        }
        sqlx::Error::PoolTimedOut => {
            PublishError::Store("Timed out waiting for a database connection".to_string())
        }
        // Connection, pool, protocol errors
        _ => PublishError::Store(err.to_string()),
    }
}
