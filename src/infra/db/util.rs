use crate::cache::CacheError;

pub fn map_sqlx_error(err: sqlx::Error) -> CacheError {
    match err {
        sqlx::Error::PoolTimedOut => CacheError::backend("database connection pool timed out"),
        sqlx::Error::Database(db)
            if db
                .message()
                .contains("canceling statement due to user request") =>
        {
            CacheError::backend("database statement timed out")
        }
        sqlx::Error::Database(db) if db.message().contains("does not exist") => {
            CacheError::record(db.message())
        }
        other => CacheError::backend(other),
    }
}
