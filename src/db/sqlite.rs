//! SQLite backend (rusqlite, bundled)
//!
//! rusqlite is synchronous; every call hops onto the blocking pool. The
//! connection sits behind a mutex, its interrupt handle does not, so a
//! timed-out statement can be cancelled from the async side.

use super::{quote_ident, Database, DryRun, QueryLimits, ResultSet, SqlDialect};
use crate::catalog::{Column, ForeignKey, Table};
use crate::error::{Result, Text2SqlError};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

/// Sample values longer than this are not useful as prompt examples
const MAX_SAMPLE_LEN: usize = 50;

pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

impl SqliteDatabase {
    /// Open an existing database file read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| Text2SqlError::Connection(format!("Failed to open {}: {}", path.display(), e)))?;
        Ok(Self::from_connection(conn))
    }

    /// Wrap an already-open connection (tests seed an in-memory one).
    pub fn from_connection(conn: Connection) -> Self {
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
        }
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| Text2SqlError::Connection("SQLite connection mutex poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| Text2SqlError::Database(format!("Blocking task failed: {}", e)))?
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    async fn introspect(&self, sample_values: usize) -> Result<Vec<Table>> {
        self.with_connection(move |conn| {
            load_tables(conn, sample_values)
                .map_err(|e| Text2SqlError::Connection(format!("Failed to read SQLite metadata: {}", e)))
        })
        .await
    }

    async fn dry_run(&self, sql: &str) -> Result<DryRun> {
        let explain = format!("EXPLAIN QUERY PLAN {}", strip_terminator(sql));
        self.with_connection(move |conn| {
            let outcome = conn.prepare(&explain).and_then(|mut stmt| {
                let mut rows = stmt.query([])?;
                while rows.next()?.is_some() {}
                Ok(())
            });
            match outcome {
                Ok(()) => Ok(DryRun::Accepted),
                Err(e) => {
                    debug!("SQLite rejected plan: {}", e);
                    Ok(DryRun::Rejected(e.to_string()))
                }
            }
        })
        .await
    }

    async fn query(&self, sql: &str, limits: &QueryLimits) -> Result<ResultSet> {
        let sql = strip_terminator(sql).to_string();
        let limits = *limits;
        let run = self.with_connection(move |conn| run_bounded(conn, &sql, &limits));

        match tokio::time::timeout(limits.timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Query exceeded {:?}, interrupting SQLite", limits.timeout);
                self.interrupt.interrupt();
                Err(Text2SqlError::Execution(format!(
                    "Query timed out after {:?}",
                    limits.timeout
                )))
            }
        }
    }
}

fn strip_terminator(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

fn run_bounded(conn: &Connection, sql: &str, limits: &QueryLimits) -> Result<ResultSet> {
    let started = Instant::now();
    let exec = |e: rusqlite::Error| Text2SqlError::Execution(e.to_string());

    let mut stmt = conn.prepare(sql).map_err(exec)?;
    if !stmt.readonly() {
        return Err(Text2SqlError::Execution(
            "Refusing to run a statement that writes to the database".to_string(),
        ));
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let column_count = columns.len();
    let mut rows = stmt.query([]).map_err(exec)?;
    let mut out: Vec<Vec<serde_json::Value>> = Vec::new();
    let mut truncated = false;

    while let Some(row) = rows.next().map_err(exec)? {
        if out.len() >= limits.max_rows {
            truncated = true;
            break;
        }
        if started.elapsed() > limits.timeout {
            return Err(Text2SqlError::Execution(format!(
                "Query exceeded time limit of {:?}",
                limits.timeout
            )));
        }
        let mut values = Vec::with_capacity(column_count);
        for idx in 0..column_count {
            values.push(value_to_json(row.get_ref(idx).map_err(exec)?));
        }
        out.push(values);
    }

    Ok(ResultSet {
        columns,
        rows: out,
        truncated,
    })
}

fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => serde_json::Value::String(format!("<{} bytes>", bytes.len())),
    }
}

fn value_to_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
    }
}

fn load_tables(conn: &Connection, sample_values: usize) -> rusqlite::Result<Vec<Table>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master \
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
         ORDER BY rowid",
    )?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<_>>()?;

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let mut columns = load_columns(conn, &name)?;
        if sample_values > 0 {
            for column in &mut columns {
                column.sample_values = load_samples(conn, &name, &column.name, sample_values);
            }
        }
        let foreign_keys = load_foreign_keys(conn, &name)?;
        let row_count = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", quote_ident(&name)), [], |row| {
                row.get::<_, i64>(0)
            })
            .ok()
            .map(|n| n.max(0) as u64);

        tables.push(Table {
            name,
            columns,
            foreign_keys,
            row_count,
            description: None,
        });
    }

    resolve_implicit_fk_targets(&mut tables);
    Ok(tables)
}

fn load_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<Column>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let columns = stmt
        .query_map([], |row| {
            let name: String = row.get(1)?;
            let data_type: String = row.get::<_, Option<String>>(2)?.unwrap_or_default();
            let not_null: i64 = row.get(3)?;
            let pk: i64 = row.get(5)?;
            Ok(Column {
                name,
                data_type: if data_type.is_empty() { "ANY".to_string() } else { data_type },
                nullable: not_null == 0 && pk == 0,
                is_primary_key: pk > 0,
                description: None,
                sample_values: Vec::new(),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

fn load_foreign_keys(conn: &Connection, table: &str) -> rusqlite::Result<Vec<ForeignKey>> {
    let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_list({})", quote_ident(table)))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ForeignKey {
                references_table: row.get(2)?,
                column: row.get(3)?,
                references_column: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut fks: Vec<ForeignKey> = Vec::with_capacity(rows.len());
    for fk in rows {
        if !fks.contains(&fk) {
            fks.push(fk);
        }
    }
    Ok(fks)
}

fn load_samples(conn: &Connection, table: &str, column: &str, limit: usize) -> Vec<String> {
    let sql = format!(
        "SELECT DISTINCT {col} FROM {table} WHERE {col} IS NOT NULL LIMIT {limit}",
        col = quote_ident(column),
        table = quote_ident(table),
        limit = limit
    );
    let sampled = conn.prepare(&sql).and_then(|mut stmt| {
        let mut rows = stmt.query([])?;
        let mut values = Vec::new();
        while let Some(row) = rows.next()? {
            if let Some(text) = value_to_text(row.get_ref(0)?) {
                if text.chars().count() < MAX_SAMPLE_LEN {
                    values.push(text);
                }
            }
        }
        Ok(values)
    });
    match sampled {
        Ok(values) => values,
        Err(e) => {
            debug!("Skipping samples for {}.{}: {}", table, column, e);
            Vec::new()
        }
    }
}

/// `REFERENCES t` without a column list points at t's primary key.
fn resolve_implicit_fk_targets(tables: &mut [Table]) {
    let pk_by_table: Vec<(String, String)> = tables
        .iter()
        .filter_map(|t| {
            t.columns
                .iter()
                .find(|c| c.is_primary_key)
                .map(|c| (t.name.to_lowercase(), c.name.clone()))
        })
        .collect();

    for table in tables.iter_mut() {
        for fk in &mut table.foreign_keys {
            if fk.references_column.is_empty() {
                fk.references_column = pk_by_table
                    .iter()
                    .find(|(t, _)| *t == fk.references_table.to_lowercase())
                    .map(|(_, c)| c.clone())
                    .unwrap_or_else(|| "rowid".to_string());
            }
        }
    }
}
