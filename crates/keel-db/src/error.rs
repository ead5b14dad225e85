use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type DbResult<T> = Result<T, DbError>;

impl From<DbError> for keel_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => keel_core::Error::NotFound(msg),
            DbError::Conflict(msg) => keel_core::Error::Conflict(msg),
            other => keel_core::Error::State(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_maps_to_core_conflict() {
        let err: keel_core::Error = DbError::Conflict("stack 'db' is locked".into()).into();
        assert!(matches!(err, keel_core::Error::Conflict(_)));

        let err: keel_core::Error = DbError::InvalidData("bad json".into()).into();
        assert_eq!(err.to_string(), "state error: invalid data: bad json");
    }
}
