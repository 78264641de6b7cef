use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;

use crate::cache::{CacheError, ExpiryColumns, RecordSource, RecordTimes};
use crate::config::is_identifier;

use super::map_sqlx_error;

const UID_COLUMN: &str = "uid";

/// Reads record visibility windows straight from content tables.
///
/// Time columns hold unix timestamps; `0` means unset.
#[derive(Clone)]
pub struct PostgresRecordSource {
    pool: Arc<PgPool>,
}

#[derive(sqlx::FromRow)]
struct TimesRow {
    starttime: i64,
    endtime: i64,
}

impl PostgresRecordSource {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    fn push_column(qb: &mut QueryBuilder<'_, Postgres>, column: Option<&str>, alias: &str) {
        match column {
            Some(column) => {
                qb.push(format!("COALESCE(\"{column}\", 0)::BIGINT AS {alias}"));
            }
            None => {
                qb.push(format!("0::BIGINT AS {alias}"));
            }
        }
    }
}

fn timestamp(value: i64) -> Option<OffsetDateTime> {
    (value > 0)
        .then(|| OffsetDateTime::from_unix_timestamp(value).ok())
        .flatten()
}

#[async_trait]
impl RecordSource for PostgresRecordSource {
    async fn record_times(
        &self,
        table: &str,
        uid: u64,
        columns: &ExpiryColumns,
    ) -> Result<Option<RecordTimes>, CacheError> {
        let start = columns.start.as_deref();
        let end = columns.end.as_deref();
        let names = [Some(table), start, end];
        if let Some(name) = names.into_iter().flatten().find(|name| !is_identifier(name)) {
            return Err(CacheError::record(format!(
                "`{name}` is not a valid table or column name"
            )));
        }
        let uid = i64::try_from(uid)
            .map_err(|_| CacheError::record(format!("uid {uid} exceeds supported range")))?;

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT ");
        Self::push_column(&mut qb, start, "starttime");
        qb.push(", ");
        Self::push_column(&mut qb, end, "endtime");
        qb.push(format!(" FROM \"{table}\" WHERE \"{UID_COLUMN}\" = "));
        qb.push_bind(uid);

        let row = qb
            .build_query_as::<TimesRow>()
            .fetch_optional(&*self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.map(|row| RecordTimes {
            starttime: timestamp(row.starttime),
            endtime: timestamp(row.endtime),
        }))
    }
}
