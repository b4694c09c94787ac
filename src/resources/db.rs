// src/resources/db.rs — Session-scoped database access and transactions
//
// Every statement goes through `run_logged`, which checks the session is
// still open, runs the work on the blocking pool, and records the query
// against the session.

use std::time::Instant;

use futures::future::BoxFuture;
use rusqlite::{params_from_iter, Connection, Row};
use tracing::warn;

use crate::db::{ConnectionPool, PooledConnection, SqlParams, SqlValue};
use crate::infra::errors::{Result, WharfError};
use crate::session::Session;

/// Table and column names are interpolated into SQL, so only plain
/// identifiers are accepted.
fn check_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(WharfError::Database(rusqlite::Error::InvalidParameterName(
            name.to_string(),
        )))
    }
}

fn insert_sql(table: &str, columns: &[&str]) -> Result<String> {
    check_identifier(table)?;
    for c in columns {
        check_identifier(c)?;
    }
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    Ok(format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        columns.join(", "),
        placeholders.join(", ")
    ))
}

fn update_sql(table: &str, columns: &[&str], where_clause: &str) -> Result<String> {
    check_identifier(table)?;
    for c in columns {
        check_identifier(c)?;
    }
    let assignments: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{c} = ?{}", i + 1))
        .collect();
    Ok(format!(
        "UPDATE {table} SET {} WHERE {where_clause}",
        assignments.join(", ")
    ))
}

async fn run_logged<T, F>(
    session: &Session,
    conn: &mut PooledConnection,
    sql: &str,
    f: F,
) -> Result<T>
where
    F: FnOnce(&mut Connection) -> rusqlite::Result<(T, Option<i64>)> + Send + 'static,
    T: Send + 'static,
{
    session.ensure_open()?;
    let started = Instant::now();
    let result = conn.run(f).await;
    let elapsed = started.elapsed();
    match result {
        Ok((value, rows)) => {
            session.record_query(sql, elapsed, rows, None);
            Ok(value)
        }
        Err(e) => {
            session.record_query(sql, elapsed, None, Some(e.to_string()));
            Err(e)
        }
    }
}

async fn execute_on(
    session: &Session,
    conn: &mut PooledConnection,
    sql: &str,
    params: SqlParams,
) -> Result<usize> {
    let owned = sql.to_string();
    run_logged(session, conn, sql, move |c| {
        let n = c.execute(&owned, params_from_iter(params.iter()))?;
        Ok((n, Some(n as i64)))
    })
    .await
}

async fn query_on<T, F>(
    session: &Session,
    conn: &mut PooledConnection,
    sql: &str,
    params: SqlParams,
    map: F,
) -> Result<Vec<T>>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let owned = sql.to_string();
    run_logged(session, conn, sql, move |c| {
        let mut stmt = c.prepare(&owned)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), map)?;
        let values = rows.collect::<rusqlite::Result<Vec<T>>>()?;
        let count = values.len() as i64;
        Ok((values, Some(count)))
    })
    .await
}

async fn insert_on(
    session: &Session,
    conn: &mut PooledConnection,
    table: &str,
    values: Vec<(&str, SqlValue)>,
) -> Result<i64> {
    let columns: Vec<&str> = values.iter().map(|(c, _)| *c).collect();
    let sql = insert_sql(table, &columns)?;
    let params: SqlParams = values.into_iter().map(|(_, v)| v).collect();
    let owned = sql.clone();
    run_logged(session, conn, &sql, move |c| {
        c.execute(&owned, params_from_iter(params.iter()))?;
        Ok((c.last_insert_rowid(), Some(1)))
    })
    .await
}

/// Session-scoped handle to the process connection pool.
pub struct Database<'s> {
    session: &'s Session,
    pool: Option<&'s ConnectionPool>,
}

impl<'s> Database<'s> {
    pub(crate) fn new(session: &'s Session, pool: Option<&'s ConnectionPool>) -> Self {
        Self { session, pool }
    }

    fn pool(&self) -> Result<&'s ConnectionPool> {
        self.session.ensure_open()?;
        self.pool
            .ok_or_else(|| WharfError::config("no database is configured"))
    }

    /// A second connection would wait on the transaction's write lock, so
    /// statements outside the `Transaction` handle are refused while one runs.
    async fn checkout(&self) -> Result<PooledConnection> {
        let pool = self.pool()?;
        if self.session.in_transaction() {
            return Err(WharfError::NestedTransaction {
                session_id: self.session.id(),
            });
        }
        pool.acquire().await
    }

    /// Run a statement. Returns the number of rows changed.
    pub async fn execute(&self, sql: &str, params: SqlParams) -> Result<usize> {
        let mut conn = self.checkout().await?;
        execute_on(self.session, &mut conn, sql, params).await
    }

    pub async fn query<T, F>(&self, sql: &str, params: SqlParams, map: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut conn = self.checkout().await?;
        query_on(self.session, &mut conn, sql, params, map).await
    }

    pub async fn query_one<T, F>(&self, sql: &str, params: SqlParams, map: F) -> Result<Option<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        Ok(self.query(sql, params, map).await?.into_iter().next())
    }

    /// Insert one row from column/value pairs. Returns the new rowid.
    pub async fn insert(&self, table: &str, values: Vec<(&str, SqlValue)>) -> Result<i64> {
        let mut conn = self.checkout().await?;
        insert_on(self.session, &mut conn, table, values).await
    }

    /// Update rows matching `where_clause`. Its placeholders are numbered
    /// after the assigned values.
    pub async fn update(
        &self,
        table: &str,
        values: Vec<(&str, SqlValue)>,
        where_clause: &str,
        where_params: SqlParams,
    ) -> Result<usize> {
        self.session.ensure_open()?;
        let columns: Vec<&str> = values.iter().map(|(c, _)| *c).collect();
        let sql = update_sql(table, &columns, where_clause)?;
        let mut params: SqlParams = values.into_iter().map(|(_, v)| v).collect();
        params.extend(where_params);
        self.execute(&sql, params).await
    }

    pub async fn delete(&self, table: &str, where_clause: &str, params: SqlParams) -> Result<usize> {
        self.session.ensure_open()?;
        check_identifier(table)?;
        self.execute(&format!("DELETE FROM {table} WHERE {where_clause}"), params)
            .await
    }

    /// Run `body` inside one transaction on one connection. Commits when the
    /// body returns `Ok`, rolls back on `Err` or if the future is dropped.
    /// The body's error is returned unchanged.
    pub async fn transaction<T, E, F>(&self, body: F) -> std::result::Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut Transaction<'s>) -> BoxFuture<'t, std::result::Result<T, E>>,
        E: From<WharfError>,
    {
        let pool = self.pool()?;
        let _scope = self.session.enter_transaction()?;
        let mut conn = pool.acquire().await?;
        conn.run(|c| c.execute_batch("BEGIN IMMEDIATE")).await?;

        let mut tx = Transaction {
            session: self.session,
            conn,
        };
        match body(&mut tx).await {
            Ok(value) => {
                tx.conn.run(|c| c.execute_batch("COMMIT")).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.conn.run(|c| c.execute_batch("ROLLBACK")).await {
                    warn!(
                        "Rollback failed in session {}: {}",
                        self.session.id(),
                        rollback
                    );
                }
                Err(e)
            }
        }
    }
}

/// An open transaction. Statements run on the connection held for the
/// whole transaction.
pub struct Transaction<'s> {
    session: &'s Session,
    conn: PooledConnection,
}

impl<'s> Transaction<'s> {
    pub fn session(&self) -> &'s Session {
        self.session
    }

    pub async fn execute(&mut self, sql: &str, params: SqlParams) -> Result<usize> {
        execute_on(self.session, &mut self.conn, sql, params).await
    }

    pub async fn query<T, F>(&mut self, sql: &str, params: SqlParams, map: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        query_on(self.session, &mut self.conn, sql, params, map).await
    }

    pub async fn query_one<T, F>(&mut self, sql: &str, params: SqlParams, map: F) -> Result<Option<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        Ok(self.query(sql, params, map).await?.into_iter().next())
    }

    pub async fn insert(&mut self, table: &str, values: Vec<(&str, SqlValue)>) -> Result<i64> {
        insert_on(self.session, &mut self.conn, table, values).await
    }
}
