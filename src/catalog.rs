//! Schema Catalog
//!
//! Static structural description of the target database: tables, columns,
//! types, foreign keys, row-count hints. Extracted once per connection and
//! shared read-only (`Arc<Catalog>`) by every question of the session.

use crate::db::{Database, SqlDialect};
use crate::error::{Result, Text2SqlError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
    /// Natural-language description, inferred from the name when not stored
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sample_values: Vec<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            is_primary_key: false,
            description: None,
            sample_values: Vec::new(),
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// `column -> references_table.references_column`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ForeignKey {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub row_count: Option<u64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
            foreign_keys: Vec::new(),
            row_count: None,
            description: None,
        }
    }

    pub fn with_foreign_key(
        mut self,
        column: impl Into<String>,
        references_table: impl Into<String>,
        references_column: impl Into<String>,
    ) -> Self {
        let fk = ForeignKey {
            column: column.into(),
            references_table: references_table.into(),
            references_column: references_column.into(),
        };
        if !self.foreign_keys.contains(&fk) {
            self.foreign_keys.push(fk);
        }
        self
    }

    /// Case-insensitive column lookup
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Tables this table points at through its foreign keys, in declaration order
    pub fn referenced_tables(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for fk in &self.foreign_keys {
            if !out.iter().any(|t| t.eq_ignore_ascii_case(&fk.references_table)) {
                out.push(fk.references_table.as_str());
            }
        }
        out
    }

    /// DDL-style rendering with descriptions and sample values as trailing
    /// comments. `keep_fk` decides which foreign-key clauses are emitted.
    pub fn to_ddl(&self, keep_fk: &dyn Fn(&ForeignKey) -> bool) -> String {
        let mut lines: Vec<String> = Vec::with_capacity(self.columns.len() + self.foreign_keys.len());
        let fks: Vec<&ForeignKey> = self.foreign_keys.iter().filter(|fk| keep_fk(fk)).collect();

        for (idx, col) in self.columns.iter().enumerate() {
            let mut def = format!("    {} {}", col.name, col.data_type);
            if col.is_primary_key {
                def.push_str(" PRIMARY KEY");
            }
            if !col.nullable && !col.is_primary_key {
                def.push_str(" NOT NULL");
            }
            if idx + 1 < self.columns.len() || !fks.is_empty() {
                def.push(',');
            }
            if let Some(ref desc) = col.description {
                def.push_str(&format!("  -- {}", desc));
                if !col.sample_values.is_empty() {
                    let samples: Vec<String> = col.sample_values.iter().map(|s| format!("\"{}\"", s)).collect();
                    def.push_str(&format!(" (e.g., {})", samples.join(", ")));
                }
            }
            lines.push(def);
        }

        for (idx, fk) in fks.iter().enumerate() {
            let mut def = format!(
                "    FOREIGN KEY ({}) REFERENCES {}({})",
                fk.column, fk.references_table, fk.references_column
            );
            if idx + 1 < fks.len() {
                def.push(',');
            }
            lines.push(def);
        }

        let mut ddl = format!("CREATE TABLE {} (\n{}\n);", self.name, lines.join("\n"));
        if let Some(rows) = self.row_count {
            ddl.push_str(&format!("  -- ~{} rows", rows));
        }
        ddl
    }
}

/// Immutable schema description of one database connection.
#[derive(Debug, Clone, Serialize)]
pub struct Catalog {
    tables: Vec<Table>,
    dialect: SqlDialect,
    extracted_at: DateTime<Utc>,
    #[serde(skip)]
    tables_by_name: HashMap<String, usize>,
}

impl Catalog {
    /// Introspect the database. Fails with `EmptySchema` when no tables exist.
    pub async fn extract(db: &dyn Database, sample_values: usize) -> Result<Self> {
        let tables = db.introspect(sample_values).await?;
        let catalog = Self::from_tables(tables, db.dialect())?;
        info!(
            "Extracted catalog: {} tables, {} columns",
            catalog.tables.len(),
            catalog.tables.iter().map(|t| t.columns.len()).sum::<usize>()
        );
        Ok(catalog)
    }

    /// Build a catalog from already-known tables (declaration order is kept).
    pub fn from_tables(mut tables: Vec<Table>, dialect: SqlDialect) -> Result<Self> {
        if tables.is_empty() {
            return Err(Text2SqlError::EmptySchema);
        }
        for table in &mut tables {
            annotate_table(table);
        }
        let tables_by_name = tables
            .iter()
            .enumerate()
            .map(|(idx, t)| (t.name.to_lowercase(), idx))
            .collect();
        Ok(Self {
            tables,
            dialect,
            extracted_at: Utc::now(),
            tables_by_name,
        })
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    pub fn extracted_at(&self) -> DateTime<Utc> {
        self.extracted_at
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Case-insensitive table lookup
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.position(name).map(|idx| &self.tables[idx])
    }

    /// Declaration index of a table
    pub fn position(&self, name: &str) -> Option<usize> {
        self.tables_by_name.get(&name.to_lowercase()).copied()
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.table(table).map(|t| t.has_column(column)).unwrap_or(false)
    }

    /// Every column name in the catalog, qualified by its table
    pub fn qualified_columns(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tables
            .iter()
            .flat_map(|t| t.columns.iter().map(move |c| (t.name.as_str(), c.name.as_str())))
    }

    /// Full DDL rendering, used for `--schema` and diagnostics
    pub fn render_ddl(&self) -> String {
        self.tables
            .iter()
            .map(|t| t.to_ddl(&|_| true))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn annotate_table(table: &mut Table) {
    let fk_by_column: HashMap<String, ForeignKey> = table
        .foreign_keys
        .iter()
        .map(|fk| (fk.column.to_lowercase(), fk.clone()))
        .collect();
    for column in &mut table.columns {
        if column.description.is_none() {
            let fk = fk_by_column.get(&column.name.to_lowercase());
            column.description = Some(describe_column(&column.name, &table.name, fk));
        }
    }
}

/// Name-based description of a column.
pub fn describe_column(column: &str, table: &str, fk: Option<&ForeignKey>) -> String {
    let lower = column.to_lowercase();
    let table_lower = table.to_lowercase();
    let words = lower.replace('_', " ");

    if let Some(fk) = fk {
        return format!("Foreign key referencing {}.{}", fk.references_table, fk.references_column);
    }

    if lower == "id" || lower.ends_with("_id") || column.ends_with("Id") || column.ends_with("ID") {
        let stem = lower.trim_end_matches("_id").trim_end_matches("id");
        if lower == "id" || table_lower == stem || table_lower.trim_end_matches('s') == stem {
            return format!("Unique identifier for {}", table);
        }
        return format!("Identifier referencing {}", stem.replace('_', " ").trim());
    }

    if lower.contains("name") || lower.contains("title") {
        return title_case(&words);
    }

    let tokens: Vec<&str> = words.split_whitespace().collect();
    if tokens.iter().any(|w| matches!(*w, "date" | "time" | "timestamp" | "at")) {
        let subject = tokens
            .iter()
            .filter(|w| !matches!(**w, "date" | "time" | "timestamp" | "at"))
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        if subject.is_empty() {
            return format!("Date recorded for {}", table);
        }
        return format!("Date of {}", subject);
    }

    if ["amount", "price", "cost", "total", "revenue", "salary"].iter().any(|k| lower.contains(k)) {
        return format!("Monetary value for {}", words);
    }

    if tokens.iter().any(|w| matches!(*w, "quantity" | "count" | "qty" | "number")) {
        let subject = tokens
            .iter()
            .filter(|w| !matches!(**w, "quantity" | "count" | "qty" | "number"))
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        if subject.is_empty() {
            return format!("Number of {}", table);
        }
        return format!("Number of {}", subject);
    }

    title_case(&words)
}

fn title_case(words: &str) -> String {
    words
        .split_whitespace()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
