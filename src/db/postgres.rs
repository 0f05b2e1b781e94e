//! PostgreSQL backend (sqlx)
//!
//! Metadata comes from information_schema, dry-runs are `EXPLAIN`, and the
//! final statement runs inside a READ ONLY transaction that is always
//! rolled back.

use super::{quote_ident, Database, DryRun, QueryLimits, ResultSet, SqlDialect};
use crate::catalog::{Column, ForeignKey, Table};
use crate::error::{Result, Text2SqlError};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column as _, Row, TypeInfo};
use tracing::{debug, info};

pub struct PostgresDatabase {
    pool: PgPool,
    schema: String,
}

impl PostgresDatabase {
    pub async fn connect(database_url: &str, schema: impl Into<String>) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(|e| Text2SqlError::Connection(e.to_string()))?;
        let schema = schema.into();
        info!("Connected to PostgreSQL (schema {})", schema);
        Ok(Self { pool, schema })
    }

    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    async fn load_table(&self, name: String, sample_values: usize) -> std::result::Result<Table, sqlx::Error> {
        let column_rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT column_name::text, data_type::text, is_nullable::text
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(&self.schema)
        .bind(&name)
        .fetch_all(&self.pool)
        .await?;

        let pk_columns: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT kcu.column_name::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON tc.constraint_name = kcu.constraint_name
             AND tc.table_schema = kcu.table_schema
            WHERE tc.constraint_type = 'PRIMARY KEY'
              AND tc.table_schema = $1 AND tc.table_name = $2
            "#,
        )
        .bind(&self.schema)
        .bind(&name)
        .fetch_all(&self.pool)
        .await?;

        let fk_rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT kcu.column_name::text, ccu.table_name::text, ccu.column_name::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON tc.constraint_name = kcu.constraint_name
             AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
              ON ccu.constraint_name = tc.constraint_name
             AND ccu.table_schema = tc.table_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
              AND tc.table_schema = $1 AND tc.table_name = $2
            ORDER BY kcu.ordinal_position
            "#,
        )
        .bind(&self.schema)
        .bind(&name)
        .fetch_all(&self.pool)
        .await?;

        let estimate: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT c.reltuples::bigint
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1 AND c.relname = $2
            "#,
        )
        .bind(&self.schema)
        .bind(&name)
        .fetch_optional(&self.pool)
        .await?;

        let mut columns = Vec::with_capacity(column_rows.len());
        for (column_name, data_type, is_nullable) in column_rows {
            let is_pk = pk_columns.iter().any(|(pk,)| *pk == column_name);
            let sample_values = if sample_values > 0 {
                self.load_samples(&name, &column_name, sample_values).await
            } else {
                Vec::new()
            };
            columns.push(Column {
                nullable: is_nullable.eq_ignore_ascii_case("YES") && !is_pk,
                is_primary_key: is_pk,
                name: column_name,
                data_type: data_type.to_uppercase(),
                description: None,
                sample_values,
            });
        }

        let mut foreign_keys: Vec<ForeignKey> = Vec::with_capacity(fk_rows.len());
        for (column, references_table, references_column) in fk_rows {
            let fk = ForeignKey {
                column,
                references_table,
                references_column,
            };
            if !foreign_keys.contains(&fk) {
                foreign_keys.push(fk);
            }
        }

        Ok(Table {
            name,
            columns,
            foreign_keys,
            // reltuples is -1 for never-analyzed tables
            row_count: estimate.and_then(|(n,)| u64::try_from(n).ok()),
            description: None,
        })
    }

    async fn load_samples(&self, table: &str, column: &str, limit: usize) -> Vec<String> {
        let sql = format!(
            "SELECT DISTINCT {col}::text FROM {schema}.{table} WHERE {col} IS NOT NULL LIMIT {limit}",
            col = quote_ident(column),
            schema = quote_ident(&self.schema),
            table = quote_ident(table),
            limit = limit
        );
        match sqlx::query_as::<_, (Option<String>,)>(&sql).fetch_all(&self.pool).await {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|(v,)| v)
                .filter(|v| v.chars().count() < 50)
                .collect(),
            Err(e) => {
                debug!("Skipping samples for {}.{}: {}", table, column, e);
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }

    async fn introspect(&self, sample_values: usize) -> Result<Vec<Table>> {
        let connection_error = |e: sqlx::Error| Text2SqlError::Connection(format!("Failed to read metadata: {}", e));

        let names: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT table_name::text
            FROM information_schema.tables
            WHERE table_schema = $1 AND table_type IN ('BASE TABLE', 'VIEW')
            ORDER BY table_name
            "#,
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await
        .map_err(connection_error)?;

        let mut tables = Vec::with_capacity(names.len());
        for (name,) in names {
            tables.push(self.load_table(name, sample_values).await.map_err(connection_error)?);
        }
        Ok(tables)
    }

    async fn dry_run(&self, sql: &str) -> Result<DryRun> {
        let explain = format!("EXPLAIN {}", sql.trim().trim_end_matches(';'));
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Text2SqlError::Database(e.to_string()))?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| Text2SqlError::Database(e.to_string()))?;

        let outcome = sqlx::query(&explain).fetch_all(&mut *tx).await;
        let _ = tx.rollback().await;

        match outcome {
            Ok(_) => Ok(DryRun::Accepted),
            Err(sqlx::Error::Database(db_err)) => {
                debug!("PostgreSQL rejected plan: {}", db_err.message());
                Ok(DryRun::Rejected(db_err.message().to_string()))
            }
            Err(e) => Err(Text2SqlError::Database(e.to_string())),
        }
    }

    async fn query(&self, sql: &str, limits: &QueryLimits) -> Result<ResultSet> {
        let exec = |e: sqlx::Error| Text2SqlError::Execution(e.to_string());
        let wrapped = format!(
            "SELECT * FROM ({}) AS limited_result LIMIT {}",
            sql.trim().trim_end_matches(';'),
            limits.max_rows + 1
        );

        let mut tx = self.pool.begin().await.map_err(exec)?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(exec)?;
        sqlx::query(&format!("SET LOCAL statement_timeout = {}", limits.timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(exec)?;

        let fetched = tokio::time::timeout(limits.timeout, sqlx::query(&wrapped).fetch_all(&mut *tx)).await;
        let _ = tx.rollback().await;

        let rows = match fetched {
            Ok(rows) => rows.map_err(exec)?,
            Err(_) => {
                return Err(Text2SqlError::Execution(format!(
                    "Query timed out after {:?}",
                    limits.timeout
                )))
            }
        };

        let columns: Vec<String> = rows
            .first()
            .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let truncated = rows.len() > limits.max_rows;
        let rows = rows
            .iter()
            .take(limits.max_rows)
            .map(decode_row)
            .collect::<Vec<_>>();

        Ok(ResultSet {
            columns,
            rows,
            truncated,
        })
    }
}

fn decode_row(row: &PgRow) -> Vec<serde_json::Value> {
    (0..row.columns().len()).map(|idx| decode_cell(row, idx)).collect()
}

fn decode_cell(row: &PgRow, idx: usize) -> serde_json::Value {
    use serde_json::Value;

    let type_name = row.columns()[idx].type_info().name().to_uppercase();
    let decoded = match type_name.as_str() {
        "INT2" => row.try_get::<Option<i16>, _>(idx).map(|v| v.map(Value::from)),
        "INT4" => row.try_get::<Option<i32>, _>(idx).map(|v| v.map(Value::from)),
        "INT8" => row.try_get::<Option<i64>, _>(idx).map(|v| v.map(Value::from)),
        "FLOAT4" => row.try_get::<Option<f32>, _>(idx).map(|v| v.map(|f| Value::from(f as f64))),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx).map(|v| v.map(Value::from)),
        "BOOL" => row.try_get::<Option<bool>, _>(idx).map(|v| v.map(Value::from)),
        "NUMERIC" => row
            .try_get::<Option<Decimal>, _>(idx)
            .map(|v| v.map(|d| Value::String(d.normalize().to_string()))),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
            .map(|v| v.map(|t| Value::String(t.to_rfc3339()))),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
            .map(|v| v.map(|t| Value::String(t.to_string()))),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(idx)
            .map(|v| v.map(|d| Value::String(d.to_string()))),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(idx)
            .map(|v| v.map(|u| Value::String(u.to_string()))),
        "JSON" | "JSONB" => row.try_get::<Option<serde_json::Value>, _>(idx),
        _ => row.try_get::<Option<String>, _>(idx).map(|v| v.map(Value::String)),
    };

    match decoded {
        Ok(Some(value)) => value,
        Ok(None) => Value::Null,
        Err(e) => {
            debug!("Undecodable {} value in column {}: {}", type_name, idx, e);
            Value::String(format!("<{}>", type_name.to_lowercase()))
        }
    }
}
