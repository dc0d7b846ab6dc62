use sqlx::error::ErrorKind;

use crate::application::repos::RepoError;

/// SQLSTATE raised when a statement is cancelled (for example by `statement_timeout`).
const QUERY_CANCELED: &str = "57014";

pub fn map_sqlx_error(err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::PoolTimedOut => RepoError::Timeout,
        sqlx::Error::Database(db) => match db.kind() {
            ErrorKind::CheckViolation | ErrorKind::ForeignKeyViolation => {
                RepoError::invalid_input(db.message())
            }
            ErrorKind::UniqueViolation | ErrorKind::NotNullViolation => RepoError::Integrity {
                message: db.message().to_string(),
            },
            _ if db.code().as_deref() == Some(QUERY_CANCELED) => RepoError::Timeout,
            _ => RepoError::from_persistence(db.message()),
        },
        other => RepoError::from_persistence(other),
    }
}

/// Convert a row count reported by PostgreSQL into `u64`.
pub(crate) fn convert_count(value: i64) -> Result<u64, RepoError> {
    value
        .try_into()
        .map_err(|_| RepoError::from_persistence("count exceeds supported range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_is_a_timeout() {
        assert!(matches!(
            map_sqlx_error(sqlx::Error::PoolTimedOut),
            RepoError::Timeout
        ));
        assert!(matches!(
            map_sqlx_error(sqlx::Error::RowNotFound),
            RepoError::NotFound
        ));
    }

    #[test]
    fn negative_counts_are_rejected() {
        assert_eq!(convert_count(3).expect("count"), 3);
        assert!(convert_count(-1).is_err());
    }
}
