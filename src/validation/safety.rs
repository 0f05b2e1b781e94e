//! Read-only guard
//!
//! A statement passes only when its root is a query whose every branch is a
//! plain projection: no `SELECT ... INTO`, no row locks, no data-modifying
//! set expressions, nothing that is not `Statement::Query`.

use sqlparser::ast::{Query, SetExpr, Statement};

/// `None` for a pure read, otherwise the offending statement type
/// (e.g. `"DELETE"`, `"DROP"`, `"SELECT INTO"`).
pub fn write_statement_type(statement: &Statement) -> Option<String> {
    match statement {
        Statement::Query(query) => query_write_type(query),
        other => Some(leading_keyword(&other.to_string())),
    }
}

fn query_write_type(query: &Query) -> Option<String> {
    if let Some(ref with) = query.with {
        for cte in &with.cte_tables {
            if let Some(kind) = query_write_type(&cte.query) {
                return Some(kind);
            }
        }
    }
    if !query.locks.is_empty() {
        return Some("SELECT FOR UPDATE".to_string());
    }
    set_expr_write_type(&query.body)
}

fn set_expr_write_type(body: &SetExpr) -> Option<String> {
    match body {
        SetExpr::Select(select) => {
            if select.into.is_some() {
                Some("SELECT INTO".to_string())
            } else {
                None
            }
        }
        SetExpr::Query(query) => query_write_type(query),
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_write_type(left).or_else(|| set_expr_write_type(right))
        }
        SetExpr::Values(_) => None,
        SetExpr::Insert(_) => Some("INSERT".to_string()),
        SetExpr::Update(_) => Some("UPDATE".to_string()),
        // TABLE t and anything newer: refuse what we cannot classify
        #[allow(unreachable_patterns)]
        _ => Some("UNKNOWN".to_string()),
    }
}

/// First keyword of the rendered statement, upper-cased
fn leading_keyword(rendered: &str) -> String {
    rendered
        .split_whitespace()
        .next()
        .map(|w| w.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_uppercase())
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::{PostgreSqlDialect, SQLiteDialect};
    use sqlparser::parser::Parser;

    fn sqlite(sql: &str) -> Option<String> {
        let statements = Parser::parse_sql(&SQLiteDialect {}, sql).unwrap();
        write_statement_type(&statements[0])
    }

    #[test]
    fn test_reads_pass() {
        assert_eq!(sqlite("SELECT * FROM customers"), None);
        assert_eq!(
            sqlite("WITH t AS (SELECT 1 AS x) SELECT x FROM t UNION SELECT 2"),
            None
        );
        assert_eq!(sqlite("VALUES (1, 2)"), None);
    }

    #[test]
    fn test_writes_are_named() {
        assert_eq!(sqlite("DELETE FROM customers").as_deref(), Some("DELETE"));
        assert_eq!(sqlite("DROP TABLE customers").as_deref(), Some("DROP"));
        assert_eq!(
            sqlite("INSERT INTO customers (first_name) VALUES ('x')").as_deref(),
            Some("INSERT")
        );
        assert_eq!(
            sqlite("UPDATE customers SET city = 'Austin'").as_deref(),
            Some("UPDATE")
        );
        assert_eq!(
            sqlite("CREATE TABLE t (id INTEGER)").as_deref(),
            Some("CREATE")
        );
    }

    #[test]
    fn test_select_into_and_locks() {
        let statements =
            Parser::parse_sql(&PostgreSqlDialect {}, "SELECT * INTO backup FROM customers").unwrap();
        assert_eq!(write_statement_type(&statements[0]).as_deref(), Some("SELECT INTO"));

        let statements =
            Parser::parse_sql(&PostgreSqlDialect {}, "SELECT * FROM customers FOR UPDATE").unwrap();
        assert_eq!(
            write_statement_type(&statements[0]).as_deref(),
            Some("SELECT FOR UPDATE")
        );
    }
}
