//! Schema Linker
//!
//! Ranks catalog tables against a question and keeps the top-K plus every
//! table reachable from them through foreign keys.

use crate::catalog::{Catalog, Table};
use crate::schema_rag::vector_store::TfIdfVectorStore;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// A catalog table selected for one question
#[derive(Debug, Clone, Serialize)]
pub struct LinkedTable {
    pub table: Table,
    pub score: f64,
    /// Pulled in only to keep a selected table joinable
    pub via_foreign_key: bool,
}

/// Subset of the catalog relevant to one question, best first
#[derive(Debug, Clone, Serialize)]
pub struct LinkedSchema {
    pub tables: Vec<LinkedTable>,
    /// Nothing scored above the floor, so the whole catalog was returned
    pub fell_back: bool,
}

impl LinkedSchema {
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.table.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&LinkedTable> {
        self.tables.iter().find(|t| t.table.name.eq_ignore_ascii_case(name))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// TF-IDF linker, fitted once per catalog
pub struct SchemaLinker {
    catalog: Arc<Catalog>,
    store: TfIdfVectorStore,
    top_k: usize,
    min_similarity: f64,
}

impl SchemaLinker {
    pub fn new(catalog: Arc<Catalog>, top_k: usize, min_similarity: f64) -> Self {
        let corpus = catalog
            .tables()
            .iter()
            .enumerate()
            .map(|(idx, table)| (idx, table_document(table)))
            .collect();
        let store = TfIdfVectorStore::build(corpus);
        debug!(
            "Schema linker fitted: {} tables, {} terms",
            store.len(),
            store.vocabulary_len()
        );
        Self {
            catalog,
            store,
            top_k: top_k.max(1),
            min_similarity,
        }
    }

    pub fn link(&self, question: &str) -> LinkedSchema {
        let tables = self.catalog.tables();
        let mut scores = vec![0.0; tables.len()];
        let ranked = self.store.search(question);
        for result in &ranked {
            scores[result.id] = result.score;
        }

        let seeds: Vec<usize> = ranked
            .iter()
            .filter(|r| r.score > self.min_similarity)
            .take(self.top_k)
            .map(|r| r.id)
            .collect();

        if seeds.is_empty() {
            debug!("No table scored above {}, linking full catalog", self.min_similarity);
            let tables = ranked
                .iter()
                .map(|r| LinkedTable {
                    table: tables[r.id].clone(),
                    score: r.score,
                    via_foreign_key: false,
                })
                .collect();
            return LinkedSchema {
                tables,
                fell_back: true,
            };
        }

        let mut selected: Vec<(usize, bool)> = seeds.iter().map(|&idx| (idx, false)).collect();
        let mut seen: HashSet<usize> = seeds.iter().copied().collect();
        let mut queue: VecDeque<usize> = seeds.into_iter().collect();
        while let Some(idx) = queue.pop_front() {
            for referenced in tables[idx].referenced_tables() {
                if let Some(target) = self.catalog.position(referenced) {
                    if seen.insert(target) {
                        selected.push((target, true));
                        queue.push_back(target);
                    }
                }
            }
        }

        // catalog order first so the stable sort breaks ties by declaration
        selected.sort_by_key(|(idx, _)| *idx);
        selected.sort_by(|a, b| {
            scores[b.0]
                .partial_cmp(&scores[a.0])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let linked = LinkedSchema {
            tables: selected
                .into_iter()
                .map(|(idx, via_foreign_key)| LinkedTable {
                    table: tables[idx].clone(),
                    score: scores[idx],
                    via_foreign_key,
                })
                .collect(),
            fell_back: false,
        };
        debug!("Linked tables: {:?}", linked.table_names());
        linked
    }
}

/// Synthetic document: table name, column names and their descriptions
fn table_document(table: &Table) -> String {
    let mut parts: Vec<&str> = vec![table.name.as_str()];
    if let Some(ref desc) = table.description {
        parts.push(desc);
    }
    for column in &table.columns {
        parts.push(&column.name);
        if let Some(ref desc) = column.description {
            parts.push(desc);
        }
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Column;
    use crate::db::SqlDialect;

    fn shop() -> Arc<Catalog> {
        Arc::new(
            Catalog::from_tables(
                vec![
                    Table::new(
                        "customers",
                        vec![
                            Column::new("customer_id", "INTEGER").primary_key(),
                            Column::new("first_name", "TEXT"),
                            Column::new("city", "TEXT"),
                        ],
                    ),
                    Table::new(
                        "products",
                        vec![
                            Column::new("product_id", "INTEGER").primary_key(),
                            Column::new("name", "TEXT"),
                            Column::new("price", "REAL"),
                            Column::new("category", "TEXT"),
                        ],
                    ),
                    Table::new(
                        "orders",
                        vec![
                            Column::new("order_id", "INTEGER").primary_key(),
                            Column::new("customer_id", "INTEGER"),
                            Column::new("order_date", "DATE"),
                        ],
                    )
                    .with_foreign_key("customer_id", "customers", "customer_id"),
                    Table::new(
                        "order_items",
                        vec![
                            Column::new("order_item_id", "INTEGER").primary_key(),
                            Column::new("order_id", "INTEGER"),
                            Column::new("product_id", "INTEGER"),
                            Column::new("quantity", "INTEGER"),
                        ],
                    )
                    .with_foreign_key("order_id", "orders", "order_id")
                    .with_foreign_key("product_id", "products", "product_id"),
                ],
                SqlDialect::Sqlite,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_top_table_is_most_similar() {
        let linker = SchemaLinker::new(shop(), 1, 0.0);
        let linked = linker.link("What are the top 5 most expensive products by price?");
        assert!(!linked.fell_back);
        assert_eq!(linked.table_names(), vec!["products"]);
        assert!(!linked.tables[0].via_foreign_key);
    }

    #[test]
    fn test_foreign_keys_are_followed_transitively() {
        let linker = SchemaLinker::new(shop(), 1, 0.0);
        let linked = linker.link("total quantity per order item");
        assert_eq!(linked.tables[0].table.name, "order_items");
        for name in ["orders", "products", "customers"] {
            let table = linked.get(name).unwrap();
            assert!(table.via_foreign_key, "{} should come from the FK closure", name);
        }
        assert_eq!(linked.len(), 4);
    }

    #[test]
    fn test_unmatched_question_falls_back_to_full_catalog() {
        let linker = SchemaLinker::new(shop(), 2, 0.0);
        let linked = linker.link("xyzzy plugh");
        assert!(linked.fell_back);
        assert_eq!(linked.table_names(), vec!["customers", "products", "orders", "order_items"]);
    }

    #[test]
    fn test_floor_excludes_weak_matches() {
        let linker = SchemaLinker::new(shop(), 3, 0.99);
        let linked = linker.link("customers");
        assert!(linked.fell_back);
    }

    #[test]
    fn test_never_empty() {
        let linker = SchemaLinker::new(shop(), 3, 0.0);
        for question in ["", "?", "how many customers live in Chicago", "revenue by month"] {
            assert!(!linker.link(question).is_empty(), "empty link for {:?}", question);
        }
    }
}
