//! Connection pool and statement execution.
//!
//! Thin wrapper over a sqlx `PgPool`: acquire a connection for the
//! duration of one statement (or an explicit transaction), bind
//! positional parameters, and translate driver errors into the crate's
//! error kinds with the offending SQL attached.

use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Postgres;
use tracing::{debug, info};

use crate::config::{mask_connection_url, OrmConfig};
use crate::error::{Error, Result};
use crate::value::SqlValue;

/// Handle to the relational backend.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
    default_branch: String,
}

impl Db {
    /// Connect and build the bounded pool. Each pooled connection gets
    /// the configured statement timeout applied on checkout.
    pub async fn connect(config: &OrmConfig) -> Result<Self> {
        info!(
            url = %mask_connection_url(&config.connection_url),
            pool_min = config.pool_min,
            pool_max = config.pool_max,
            "connecting to database"
        );

        let timeout_ms = config.statement_timeout_ms;
        let pool = PgPoolOptions::new()
            .min_connections(config.pool_min)
            .max_connections(config.pool_max)
            .acquire_timeout(config.statement_timeout())
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    let set_timeout = format!("SET statement_timeout = {timeout_ms}");
                    sqlx::Executor::execute(&mut *conn, set_timeout.as_str()).await?;
                    Ok(())
                })
            })
            .connect(&config.connection_url)
            .await
            .map_err(|e| map_sqlx_error(e, "<connect>", "[]"))?;

        Ok(Self {
            pool,
            default_branch: config.default_branch_name.clone(),
        })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            default_branch: OrmConfig::default().default_branch_name,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Name given to the root branch on first `create_all`.
    pub fn default_branch_name(&self) -> &str {
        &self.default_branch
    }

    /// Run a statement, returning the affected row count.
    pub async fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<u64> {
        debug!(sql, params = params.len(), "execute");
        let rendered = format!("{params:?}");
        let result = bind_all(sqlx::query(sql), params)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, sql, &rendered))?;
        Ok(result.rows_affected())
    }

    /// Run multi-statement SQL with no parameters. DDL only.
    pub async fn execute_batch(&self, sql: &str) -> Result<()> {
        debug!(sql, "execute batch");
        sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, sql, "[]"))?;
        Ok(())
    }

    pub async fn fetch_all(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<PgRow>> {
        debug!(sql, params = params.len(), "fetch all");
        let rendered = format!("{params:?}");
        bind_all(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, sql, &rendered))
    }

    pub async fn fetch_optional(&self, sql: &str, params: Vec<SqlValue>) -> Result<Option<PgRow>> {
        debug!(sql, params = params.len(), "fetch optional");
        let rendered = format!("{params:?}");
        bind_all(sqlx::query(sql), params)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, sql, &rendered))
    }

    pub async fn fetch_one(&self, sql: &str, params: Vec<SqlValue>) -> Result<PgRow> {
        self.fetch_optional(sql, params)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no row returned by: {sql}")))
    }

    /// Open a transaction. The caller must `commit`; dropping the guard
    /// rolls back.
    pub async fn begin(&self) -> Result<DbTransaction<'_>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(e, "<begin>", "[]"))?;
        Ok(DbTransaction { tx })
    }
}

/// A scoped connection with an open transaction.
pub struct DbTransaction<'a> {
    tx: sqlx::Transaction<'a, Postgres>,
}

impl DbTransaction<'_> {
    pub async fn execute(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<u64> {
        debug!(sql, params = params.len(), "tx execute");
        let rendered = format!("{params:?}");
        let result = bind_all(sqlx::query(sql), params)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(e, sql, &rendered))?;
        Ok(result.rows_affected())
    }

    pub async fn fetch_optional(
        &mut self,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<Option<PgRow>> {
        debug!(sql, params = params.len(), "tx fetch optional");
        let rendered = format!("{params:?}");
        bind_all(sqlx::query(sql), params)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(e, sql, &rendered))
    }

    pub async fn fetch_one(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<PgRow> {
        self.fetch_optional(sql, params)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no row returned by: {sql}")))
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(|e| map_sqlx_error(e, "<commit>", "[]"))
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error(e, "<rollback>", "[]"))
    }
}

fn bind_all(
    query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    params: Vec<SqlValue>,
) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    params.into_iter().fold(query, |q, p| p.bind_to(q))
}

/// Translate a driver error, attaching the statement and its rendered
/// parameter list for diagnostics.
fn map_sqlx_error(err: sqlx::Error, sql: &str, params: &str) -> Error {
    match err {
        sqlx::Error::RowNotFound => Error::NotFound(format!("no row returned by: {sql}")),
        sqlx::Error::PoolTimedOut => Error::Timeout,
        sqlx::Error::PoolClosed => Error::ConnectionLost("pool closed".to_string()),
        sqlx::Error::WorkerCrashed => Error::Cancelled,
        sqlx::Error::Io(e) => Error::ConnectionLost(e.to_string()),
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            match code.as_str() {
                // unique_violation
                "23505" => Error::DuplicateKey {
                    constraint: db.constraint().unwrap_or("<unknown>").to_string(),
                },
                // query_canceled: statement_timeout fired
                "57014" => Error::Timeout,
                _ => Error::Database {
                    message: db.to_string(),
                    sql: sql.to_string(),
                    params: params.to_string(),
                },
            }
        }
        other => Error::Database {
            message: other.to_string(),
            sql: sql.to_string(),
            params: params.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = map_sqlx_error(sqlx::Error::RowNotFound, "SELECT 1", "[]");
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn pool_timeout_maps_to_timeout() {
        let err = map_sqlx_error(sqlx::Error::PoolTimedOut, "SELECT 1", "[]");
        assert!(matches!(err, Error::Timeout));
    }

    #[test]
    fn unknown_errors_carry_the_sql() {
        let err = map_sqlx_error(sqlx::Error::PoolClosed, "SELECT 1", "[]");
        assert!(matches!(err, Error::ConnectionLost(_)));
    }
}
