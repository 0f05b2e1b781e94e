//! Name resolver - resolves table and column references against the catalog
//!
//! Scopes nest per SELECT. CTEs and derived tables become relations whose
//! columns are known when the projection names them and opaque otherwise;
//! an opaque relation accepts any column.

use crate::catalog::Catalog;
use crate::db::SqlDialect;
use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, GroupByExpr, Ident, JoinConstraint, JoinOperator, ObjectName,
    OrderByExpr, Query, Select, SelectItem, SetExpr, TableAlias, TableFactor, TableWithJoins, WindowType,
};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone)]
enum RelationKind {
    /// Catalog table, by its catalog name
    Table(String),
    /// CTE or derived table with known output columns
    Derived(Vec<String>),
    Opaque,
}

#[derive(Debug, Clone)]
struct Relation {
    /// Alias, or the table name when unaliased (lower-cased)
    lookup: String,
    kind: RelationKind,
}

#[derive(Debug, Default)]
struct Scope {
    relations: Vec<Relation>,
    /// Projection aliases of this SELECT
    aliases: Vec<String>,
}

const SQLITE_ROWID_ALIASES: [&str; 3] = ["rowid", "oid", "_rowid_"];

/// Name resolver for one statement
pub struct NameResolver<'a> {
    catalog: &'a Catalog,
    dialect: SqlDialect,
    scopes: Vec<Scope>,
    /// CTE frames, innermost last: lower-cased name -> output columns
    ctes: Vec<HashMap<String, Option<Vec<String>>>>,
    unresolved: BTreeSet<String>,
}

impl<'a> NameResolver<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self {
            catalog,
            dialect: catalog.dialect(),
            scopes: Vec::new(),
            ctes: Vec::new(),
            unresolved: BTreeSet::new(),
        }
    }

    /// Resolve every reference in `query`; returns the names that did not resolve.
    pub fn resolve(mut self, query: &Query) -> BTreeSet<String> {
        self.resolve_query(query);
        self.unresolved
    }

    /// Returns the output column names when they can be named
    fn resolve_query(&mut self, query: &Query) -> Option<Vec<String>> {
        self.ctes.push(HashMap::new());
        if let Some(ref with) = query.with {
            for cte in &with.cte_tables {
                let inferred = self.resolve_query(&cte.query);
                let columns = alias_columns(&cte.alias).or(inferred);
                // visible to the CTEs declared after it
                if let Some(frame) = self.ctes.last_mut() {
                    frame.insert(cte.alias.name.value.to_lowercase(), columns);
                }
            }
        }

        let outputs = self.resolve_set_expr(&query.body, &query.order_by);
        self.ctes.pop();
        outputs
    }

    fn resolve_set_expr(&mut self, body: &SetExpr, order_by: &[OrderByExpr]) -> Option<Vec<String>> {
        match body {
            SetExpr::Select(select) => self.resolve_select(select, order_by),
            SetExpr::Query(query) => {
                let outputs = self.resolve_query(query);
                self.resolve_output_order(order_by, outputs.as_deref());
                outputs
            }
            SetExpr::SetOperation { left, right, .. } => {
                let outputs = self.resolve_set_expr(left, &[]);
                self.resolve_set_expr(right, &[]);
                self.resolve_output_order(order_by, outputs.as_deref());
                outputs
            }
            SetExpr::Values(values) => {
                self.scopes.push(Scope::default());
                for row in &values.rows {
                    for expr in row {
                        self.resolve_expr(expr);
                    }
                }
                self.scopes.pop();
                None
            }
            _ => None,
        }
    }

    /// ORDER BY of a compound query sees only the output columns
    fn resolve_output_order(&mut self, order_by: &[OrderByExpr], outputs: Option<&[String]>) {
        if order_by.is_empty() {
            return;
        }
        self.scopes.push(Scope {
            relations: vec![Relation {
                lookup: String::new(),
                kind: match outputs {
                    Some(cols) => RelationKind::Derived(cols.to_vec()),
                    None => RelationKind::Opaque,
                },
            }],
            aliases: Vec::new(),
        });
        for item in order_by {
            self.resolve_expr(&item.expr);
        }
        self.scopes.pop();
    }

    fn resolve_select(&mut self, select: &Select, order_by: &[OrderByExpr]) -> Option<Vec<String>> {
        self.scopes.push(Scope::default());

        for table_with_joins in &select.from {
            self.resolve_table_with_joins(table_with_joins);
        }

        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) => self.resolve_expr(expr),
                SelectItem::ExprWithAlias { expr, alias } => {
                    self.resolve_expr(expr);
                    if let Some(scope) = self.scopes.last_mut() {
                        scope.aliases.push(alias.value.to_lowercase());
                    }
                }
                SelectItem::QualifiedWildcard(name, _) => {
                    if let Some(qualifier) = name.0.last() {
                        if self.find_relation(&qualifier.value).is_none() {
                            self.unresolved.insert(qualifier.value.clone());
                        }
                    }
                }
                SelectItem::Wildcard(_) => {}
            }
        }

        if let Some(ref selection) = select.selection {
            self.resolve_expr(selection);
        }
        if let GroupByExpr::Expressions(ref exprs) = select.group_by {
            for expr in exprs {
                self.resolve_expr(expr);
            }
        }
        if let Some(ref having) = select.having {
            self.resolve_expr(having);
        }
        for item in order_by {
            self.resolve_expr(&item.expr);
        }

        self.scopes.pop();
        projection_names(&select.projection)
    }

    fn resolve_table_with_joins(&mut self, table: &TableWithJoins) {
        self.resolve_table_factor(&table.relation);
        for join in &table.joins {
            self.resolve_table_factor(&join.relation);
            match join_constraint(&join.join_operator) {
                Some(JoinConstraint::On(expr)) => self.resolve_expr(expr),
                Some(JoinConstraint::Using(columns)) => {
                    for column in columns {
                        self.resolve_column(None, column);
                    }
                }
                _ => {}
            }
        }
    }

    fn resolve_table_factor(&mut self, factor: &TableFactor) {
        match factor {
            TableFactor::Table { name, alias, args, .. } => {
                let table_name = last_ident(name);
                let kind = if args.is_some() {
                    // table-valued function
                    RelationKind::Opaque
                } else if let Some(columns) = self.find_cte(&table_name) {
                    columns.map(RelationKind::Derived).unwrap_or(RelationKind::Opaque)
                } else if let Some(table) = self.catalog.table(&table_name) {
                    RelationKind::Table(table.name.clone())
                } else {
                    self.unresolved.insert(table_name.clone());
                    RelationKind::Opaque
                };
                let lookup = alias
                    .as_ref()
                    .map(|a| a.name.value.to_lowercase())
                    .unwrap_or_else(|| table_name.to_lowercase());
                self.register(Relation { lookup, kind });
            }
            TableFactor::Derived { subquery, alias, .. } => {
                let inferred = self.resolve_query(subquery);
                let columns = alias.as_ref().and_then(alias_columns).or(inferred);
                let lookup = alias.as_ref().map(|a| a.name.value.to_lowercase()).unwrap_or_default();
                self.register(Relation {
                    lookup,
                    kind: columns.map(RelationKind::Derived).unwrap_or(RelationKind::Opaque),
                });
            }
            TableFactor::NestedJoin { table_with_joins, .. } => {
                self.resolve_table_with_joins(table_with_joins);
            }
            _ => self.register(Relation {
                lookup: String::new(),
                kind: RelationKind::Opaque,
            }),
        }
    }

    fn register(&mut self, relation: Relation) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.relations.push(relation);
        }
    }

    fn resolve_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Identifier(ident) => self.resolve_column(None, ident),
            Expr::CompoundIdentifier(idents) => match idents.as_slice() {
                [table, column] | [_, table, column] => self.resolve_column(Some(table), column),
                _ => {}
            },
            Expr::BinaryOp { left, right, .. } => {
                self.resolve_expr(left);
                self.resolve_expr(right);
            }
            Expr::UnaryOp { expr, .. }
            | Expr::Nested(expr)
            | Expr::IsNull(expr)
            | Expr::IsNotNull(expr)
            | Expr::IsTrue(expr)
            | Expr::IsFalse(expr)
            | Expr::IsNotTrue(expr)
            | Expr::IsNotFalse(expr)
            | Expr::Cast { expr, .. }
            | Expr::TryCast { expr, .. }
            | Expr::Extract { expr, .. }
            | Expr::Collate { expr, .. } => self.resolve_expr(expr),
            Expr::IsDistinctFrom(left, right) | Expr::IsNotDistinctFrom(left, right) => {
                self.resolve_expr(left);
                self.resolve_expr(right);
            }
            Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
                self.resolve_expr(expr);
                self.resolve_expr(pattern);
            }
            Expr::InList { expr, list, .. } => {
                self.resolve_expr(expr);
                for item in list {
                    self.resolve_expr(item);
                }
            }
            Expr::InSubquery { expr, subquery, .. } => {
                self.resolve_expr(expr);
                self.resolve_query(subquery);
            }
            Expr::Between { expr, low, high, .. } => {
                self.resolve_expr(expr);
                self.resolve_expr(low);
                self.resolve_expr(high);
            }
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                if let Some(operand) = operand {
                    self.resolve_expr(operand);
                }
                for e in conditions.iter().chain(results.iter()) {
                    self.resolve_expr(e);
                }
                if let Some(else_result) = else_result {
                    self.resolve_expr(else_result);
                }
            }
            Expr::Function(func) => {
                for arg in &func.args {
                    let arg_expr = match arg {
                        FunctionArg::Unnamed(a) => a,
                        FunctionArg::Named { arg, .. } => arg,
                    };
                    if let FunctionArgExpr::Expr(e) = arg_expr {
                        self.resolve_expr(e);
                    }
                }
                if let Some(WindowType::WindowSpec(ref spec)) = func.over {
                    for e in &spec.partition_by {
                        self.resolve_expr(e);
                    }
                    for item in &spec.order_by {
                        self.resolve_expr(&item.expr);
                    }
                }
            }
            Expr::Exists { subquery, .. } | Expr::Subquery(subquery) => {
                self.resolve_query(subquery);
            }
            Expr::Tuple(items) => {
                for item in items {
                    self.resolve_expr(item);
                }
            }
            // literals and constructs without column references
            _ => {}
        }
    }

    fn resolve_column(&mut self, qualifier: Option<&Ident>, column: &Ident) {
        match qualifier {
            Some(q) => {
                let found = match self.find_relation(&q.value) {
                    Some(RelationKind::Table(table)) => self.table_has_column(&table, &column.value),
                    Some(RelationKind::Derived(columns)) => contains_ci(&columns, &column.value),
                    Some(RelationKind::Opaque) => true,
                    None => false,
                };
                if !found {
                    self.unresolved.insert(format!("{}.{}", q.value, column.value));
                }
            }
            None => {
                if !self.column_in_scope(&column.value) && !self.is_bare_string_literal(column) {
                    self.unresolved.insert(column.value.clone());
                }
            }
        }
    }

    fn column_in_scope(&self, column: &str) -> bool {
        let lower = column.to_lowercase();
        for (depth, scope) in self.scopes.iter().rev().enumerate() {
            let hit = scope.relations.iter().any(|r| match r.kind {
                RelationKind::Table(ref table) => self.table_has_column(table, column),
                RelationKind::Derived(ref columns) => contains_ci(columns, column),
                RelationKind::Opaque => true,
            });
            if hit || (depth == 0 && scope.aliases.contains(&lower)) {
                return true;
            }
        }
        false
    }

    /// Declared columns, plus the implicit row id aliases of SQLite tables
    fn table_has_column(&self, table: &str, column: &str) -> bool {
        self.catalog.has_column(table, column)
            || (self.dialect == SqlDialect::Sqlite
                && SQLITE_ROWID_ALIASES.iter().any(|a| a.eq_ignore_ascii_case(column)))
    }

    /// SQLite reads an unresolvable double-quoted identifier as a string
    fn is_bare_string_literal(&self, ident: &Ident) -> bool {
        self.dialect == SqlDialect::Sqlite && ident.quote_style == Some('"')
    }

    fn find_relation(&self, name: &str) -> Option<RelationKind> {
        let lower = name.to_lowercase();
        self.scopes
            .iter()
            .rev()
            .flat_map(|s| s.relations.iter())
            .find(|r| r.lookup == lower)
            .map(|r| r.kind.clone())
    }

    fn find_cte(&self, name: &str) -> Option<Option<Vec<String>>> {
        let lower = name.to_lowercase();
        self.ctes.iter().rev().find_map(|frame| frame.get(&lower).cloned())
    }
}

fn join_constraint(op: &JoinOperator) -> Option<&JoinConstraint> {
    match op {
        JoinOperator::Inner(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c)
        | JoinOperator::LeftSemi(c)
        | JoinOperator::RightSemi(c)
        | JoinOperator::LeftAnti(c)
        | JoinOperator::RightAnti(c) => Some(c),
        _ => None,
    }
}

fn alias_columns(alias: &TableAlias) -> Option<Vec<String>> {
    if alias.columns.is_empty() {
        None
    } else {
        Some(alias.columns.iter().map(|c| c.value.clone()).collect())
    }
}

/// Output names of a projection; `None` once any item cannot be named
fn projection_names(items: &[SelectItem]) -> Option<Vec<String>> {
    items
        .iter()
        .map(|item| match item {
            SelectItem::UnnamedExpr(Expr::Identifier(ident)) => Some(ident.value.clone()),
            SelectItem::UnnamedExpr(Expr::CompoundIdentifier(idents)) => idents.last().map(|i| i.value.clone()),
            SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.clone()),
            _ => None,
        })
        .collect()
}

fn last_ident(name: &ObjectName) -> String {
    name.0.last().map(|i| i.value.clone()).unwrap_or_default()
}

fn contains_ci(columns: &[String], column: &str) -> bool {
    columns.iter().any(|c| c.eq_ignore_ascii_case(column))
}
