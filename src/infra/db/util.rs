use crate::application::repos::StoreError;

const STORE: &str = "ledger";

pub fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed => StoreError::unavailable(STORE, err),
        sqlx::Error::Database(db)
            if db
                .message()
                .contains("canceling statement due to statement timeout") =>
        {
            StoreError::unavailable(STORE, db.message())
        }
        sqlx::Error::Database(db) => StoreError::write_failure(STORE, db.message()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::TypeNotFound { .. } => {
            StoreError::corrupt(STORE, err)
        }
        other => StoreError::write_failure(STORE, other),
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= 63
        && (first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(is_valid_identifier("pages_meta"));
        assert!(is_valid_identifier("_ledger2"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("2pages"));
        assert!(!is_valid_identifier("pages; DROP TABLE x"));
        assert!(!is_valid_identifier("Pages"));
        assert!(!is_valid_identifier(&"a".repeat(64)));
    }

    #[test]
    fn pool_errors_are_unavailable() {
        assert!(map_sqlx_error(sqlx::Error::PoolTimedOut).is_unavailable());
        assert!(map_sqlx_error(sqlx::Error::PoolClosed).is_unavailable());
        assert!(!map_sqlx_error(sqlx::Error::RowNotFound).is_unavailable());
    }
}
