//! SQL analysis: FROM bindings, predicate ownership, pushdown classification.
//!
//! A predicate atom is pushed to a source only when its qualifier names that
//! source's binding, the column is declared pushable by the table descriptor,
//! and the literal's type matches the column. Everything else stays residual
//! and is re-evaluated by the analytical runtime after the join, so pushdown
//! is strictly an optimization and never changes results.

use std::collections::{BTreeSet, HashMap};

use sqlparser::ast::{
    BinaryOperator, Expr, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr,
    ObjectNamePart, OrderByKind, Query, Select, SelectItem, SetExpr, Statement, TableFactor,
    TableWithJoins,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use weir_common::model::{Catalog, Predicate, PredicateOp, SemanticType};
use weir_error::{Result, WeirError};

/// One FROM-clause binding: `qualifier -> source.table`.
///
/// The qualifier is the alias when one was written, otherwise the bare table
/// name.
#[derive(Debug, Clone)]
pub struct TableBinding {
    pub qualifier: String,
    pub source: String,
    pub table: String,
    pub explicit_alias: bool,
}

/// A WHERE atom resolved to the binding its qualifier names.
#[derive(Debug, Clone)]
pub struct ClassifiedPredicate {
    pub binding: usize,
    pub predicate: Predicate,
    pub pushable: bool,
}

/// Result of analysis, consumed by the planner and the rewriter.
#[derive(Debug)]
pub struct AnalyzedQuery {
    pub statement: Statement,
    pub bindings: Vec<TableBinding>,
    pub predicates: Vec<ClassifiedPredicate>,
    /// Columns referenced per binding, across projections, residual
    /// predicates, join conditions, GROUP BY and ORDER BY.
    pub referenced_columns: HashMap<usize, BTreeSet<String>>,
    /// Bindings whose full column set is required (wildcard projection).
    pub wildcard_bindings: BTreeSet<usize>,
}

/// A qualified or bare column reference found in an expression.
#[derive(Debug, Clone)]
struct ColumnRef {
    qualifier: Option<String>,
    column: String,
}

pub fn analyze(sql: &str, catalog: &Catalog) -> Result<AnalyzedQuery> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql.trim())
        .map_err(|e| WeirError::plan_failed(format!("SQL parse error: {e}")))?;

    if statements.len() != 1 {
        return Err(WeirError::plan_failed(
            "exactly one SQL statement expected",
        ));
    }
    let Some(statement) = statements.into_iter().next() else {
        return Err(WeirError::plan_failed("empty SQL statement"));
    };

    let query = match &statement {
        Statement::Query(q) => q,
        other => {
            return Err(WeirError::plan_failed(format!(
                "only SELECT queries are supported, got: {}",
                statement_kind(other)
            )))
        }
    };

    let select = only_select(query)?;

    // FROM bindings with alias resolution
    let mut bindings = Vec::new();
    collect_bindings(select, catalog, &mut bindings)?;
    if bindings.is_empty() {
        return Err(WeirError::plan_failed(format!(
            "no recognized source tables in query; available sources: {}",
            catalog.source_names().join(", ")
        )));
    }
    tracing::debug!(
        bindings = bindings.len(),
        "resolved FROM bindings: {:?}",
        bindings
            .iter()
            .map(|b| format!("{} -> {}.{}", b.qualifier, b.source, b.table))
            .collect::<Vec<_>>()
    );

    // Unsupported-construct checks that need the binding set
    reject_multi_source_windows(select, &bindings)?;
    if let Some(where_clause) = &select.selection {
        reject_correlated_subqueries(where_clause, &bindings)?;
    }

    // Top-level AND atoms
    let mut predicates = Vec::new();
    if let Some(where_clause) = &select.selection {
        let mut conjuncts = Vec::new();
        split_conjunction(where_clause, &mut conjuncts);
        for conjunct in conjuncts {
            if let Some((col_ref, op, value)) = extract_atom(conjunct) {
                if let Some(binding) = resolve_owner(&col_ref, &bindings)? {
                    let pushable = classify(&bindings[binding], &col_ref.column, op, &value, catalog);
                    predicates.push(ClassifiedPredicate {
                        binding,
                        predicate: Predicate {
                            qualifier: col_ref.qualifier.clone(),
                            column: col_ref.column.clone(),
                            op,
                            value,
                        },
                        pushable,
                    });
                }
            }
            // OR trees, function calls, subqueries: residual, evaluated
            // against the registered views by the analytical runtime.
        }
    }

    // Column references across the whole statement, for projection pruning
    let mut referenced = Vec::new();
    let mut wildcard_bindings = BTreeSet::new();
    collect_select_refs(select, &mut referenced, &mut wildcard_bindings, &bindings)?;
    if let Some(order_by) = &query.order_by {
        if let OrderByKind::Expressions(exprs) = &order_by.kind {
            for obe in exprs {
                collect_column_refs(&obe.expr, &mut referenced);
            }
        }
    }

    let mut referenced_columns: HashMap<usize, BTreeSet<String>> = HashMap::new();
    for col_ref in &referenced {
        match &col_ref.qualifier {
            Some(q) => {
                if let Some(idx) = resolve_qualifier(q, &bindings) {
                    referenced_columns
                        .entry(idx)
                        .or_default()
                        .insert(col_ref.column.clone());
                }
                // Unknown qualifiers inside expressions surface later as an
                // analytical-runtime resolution error; ownership of WHERE
                // atoms is checked strictly above.
            }
            None => {
                // A bare column belongs to every binding that declares it.
                for (idx, binding) in bindings.iter().enumerate() {
                    let declares = catalog
                        .resolve(&binding.source, &binding.table)
                        .map(|(_, t)| t.has_column(&col_ref.column))
                        .unwrap_or(false);
                    if declares {
                        referenced_columns
                            .entry(idx)
                            .or_default()
                            .insert(col_ref.column.clone());
                    }
                }
            }
        }
    }

    Ok(AnalyzedQuery {
        statement,
        bindings,
        predicates,
        referenced_columns,
        wildcard_bindings,
    })
}

fn statement_kind(statement: &Statement) -> &'static str {
    match statement {
        Statement::Insert { .. } => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete { .. } => "DELETE",
        Statement::CreateTable { .. } => "CREATE TABLE",
        Statement::Drop { .. } => "DROP",
        Statement::AlterTable { .. } => "ALTER TABLE",
        _ => "non-SELECT statement",
    }
}

/// The single SELECT body of the query. Set operations are rejected: UNION
/// and friends across sources are out of contract.
fn only_select(query: &Query) -> Result<&Select> {
    match query.body.as_ref() {
        SetExpr::Select(select) => Ok(select),
        SetExpr::SetOperation { .. } => Err(WeirError::plan_failed(
            "set operations (UNION/INTERSECT/EXCEPT) are not supported across sources",
        )),
        _ => Err(WeirError::plan_failed("unsupported query body")),
    }
}

fn part_value(part: &ObjectNamePart) -> String {
    match part {
        ObjectNamePart::Identifier(ident) => ident.value.clone(),
        _ => String::new(),
    }
}

fn collect_bindings(
    select: &Select,
    catalog: &Catalog,
    bindings: &mut Vec<TableBinding>,
) -> Result<()> {
    for twj in &select.from {
        collect_factor_bindings(&twj.relation, catalog, bindings)?;
        for join in &twj.joins {
            collect_factor_bindings(&join.relation, catalog, bindings)?;
        }
    }
    Ok(())
}

fn collect_factor_bindings(
    factor: &TableFactor,
    catalog: &Catalog,
    bindings: &mut Vec<TableBinding>,
) -> Result<()> {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            let parts: Vec<String> = name.0.iter().map(part_value).collect();
            if parts.len() != 2 {
                return Err(WeirError::plan_failed(format!(
                    "tables must be named source.table, got '{}'",
                    parts.join(".")
                )));
            }
            let (source, table) = (parts[0].to_lowercase(), parts[1].to_lowercase());
            if catalog.resolve(&source, &table).is_none() {
                return Err(WeirError::plan_failed(format!(
                    "unknown table '{source}.{table}'"
                )));
            }
            let (qualifier, explicit_alias) = match alias {
                Some(a) => (a.name.value.to_lowercase(), true),
                None => (table.clone(), false),
            };
            if bindings.iter().any(|b| b.qualifier == qualifier) {
                return Err(WeirError::plan_failed(format!(
                    "duplicate table alias '{qualifier}'"
                )));
            }
            bindings.push(TableBinding {
                qualifier,
                source,
                table,
                explicit_alias,
            });
            Ok(())
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            collect_factor_bindings(&table_with_joins.relation, catalog, bindings)?;
            for join in &table_with_joins.joins {
                collect_factor_bindings(&join.relation, catalog, bindings)?;
            }
            Ok(())
        }
        TableFactor::Derived { .. } => Err(WeirError::plan_failed(
            "derived tables (subqueries in FROM) are not supported",
        )),
        _ => Err(WeirError::plan_failed("unsupported FROM clause element")),
    }
}

fn find_binding(qualifier: &str, bindings: &[TableBinding]) -> Option<usize> {
    let q = qualifier.to_lowercase();
    bindings.iter().position(|b| b.qualifier == q)
}

/// Resolve an alias-or-dotted qualifier (`gh` / `github.pull_requests`) to
/// its binding index.
fn resolve_qualifier(qualifier: &str, bindings: &[TableBinding]) -> Option<usize> {
    if let Some((source, table)) = qualifier.split_once('.') {
        return bindings
            .iter()
            .position(|b| b.source == source && b.table == table && !b.explicit_alias);
    }
    find_binding(qualifier, bindings)
}

/// Split a WHERE tree into its top-level AND conjuncts.
fn split_conjunction<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            split_conjunction(left, out);
            split_conjunction(right, out);
        }
        Expr::Nested(inner) => split_conjunction(inner, out),
        other => out.push(other),
    }
}

/// Try to read one conjunct as a pushdown-shaped atom:
/// `column OP literal`, `literal OP column` (flipped), or `column IN (literals)`.
fn extract_atom(expr: &Expr) -> Option<(ColumnRef, PredicateOp, serde_json::Value)> {
    match expr {
        Expr::BinaryOp { left, op, right } => {
            let op = binary_predicate_op(op)?;
            if let (Some(col), Some(value)) = (column_ref(left), literal_value(right)) {
                return Some((col, op, value));
            }
            // literal on the left: flip the comparison
            if let (Some(value), Some(col)) = (literal_value(left), column_ref(right)) {
                return Some((col, flip(op), value));
            }
            None
        }
        Expr::InList {
            expr: target,
            list,
            negated: false,
        } => {
            let col = column_ref(target)?;
            let values: Option<Vec<serde_json::Value>> =
                list.iter().map(literal_value).collect();
            Some((col, PredicateOp::In, serde_json::Value::Array(values?)))
        }
        Expr::Nested(inner) => extract_atom(inner),
        _ => None,
    }
}

fn binary_predicate_op(op: &BinaryOperator) -> Option<PredicateOp> {
    match op {
        BinaryOperator::Eq => Some(PredicateOp::Eq),
        BinaryOperator::NotEq => Some(PredicateOp::NotEq),
        BinaryOperator::Gt => Some(PredicateOp::Gt),
        BinaryOperator::Lt => Some(PredicateOp::Lt),
        BinaryOperator::GtEq => Some(PredicateOp::GtEq),
        BinaryOperator::LtEq => Some(PredicateOp::LtEq),
        _ => None,
    }
}

fn flip(op: PredicateOp) -> PredicateOp {
    match op {
        PredicateOp::Gt => PredicateOp::Lt,
        PredicateOp::Lt => PredicateOp::Gt,
        PredicateOp::GtEq => PredicateOp::LtEq,
        PredicateOp::LtEq => PredicateOp::GtEq,
        other => other,
    }
}

fn column_ref(expr: &Expr) -> Option<ColumnRef> {
    match expr {
        Expr::Identifier(ident) => Some(ColumnRef {
            qualifier: None,
            column: ident.value.to_lowercase(),
        }),
        Expr::CompoundIdentifier(parts) if parts.len() == 2 => Some(ColumnRef {
            qualifier: Some(parts[0].value.to_lowercase()),
            column: parts[1].value.to_lowercase(),
        }),
        // source.table.column
        Expr::CompoundIdentifier(parts) if parts.len() == 3 => Some(ColumnRef {
            qualifier: Some(format!(
                "{}.{}",
                parts[0].value.to_lowercase(),
                parts[1].value.to_lowercase()
            )),
            column: parts[2].value.to_lowercase(),
        }),
        Expr::Nested(inner) => column_ref(inner),
        _ => None,
    }
}

fn literal_value(expr: &Expr) -> Option<serde_json::Value> {
    use sqlparser::ast::Value as SqlValue;
    match expr {
        Expr::Value(v) => match &v.value {
            SqlValue::Number(n, _) => {
                if let Ok(i) = n.parse::<i64>() {
                    Some(serde_json::Value::from(i))
                } else {
                    n.parse::<f64>().ok().map(serde_json::Value::from)
                }
            }
            SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => {
                Some(serde_json::Value::String(s.clone()))
            }
            SqlValue::Boolean(b) => Some(serde_json::Value::Bool(*b)),
            SqlValue::Null => Some(serde_json::Value::Null),
            _ => None,
        },
        Expr::Nested(inner) => literal_value(inner),
        _ => None,
    }
}

/// Resolve which binding owns a WHERE atom.
///
/// A qualified atom must name exactly one binding — anything else is a plan
/// error; pushing a predicate to a source whose alias it does not name would
/// silently return wrong data. A bare atom is owned only when the query has a
/// single binding; with several, it stays residual (returns `None`).
fn resolve_owner(col_ref: &ColumnRef, bindings: &[TableBinding]) -> Result<Option<usize>> {
    match &col_ref.qualifier {
        Some(q) => {
            // 'source.table' qualifiers resolve against the binding pair
            if let Some((source, table)) = q.split_once('.') {
                let idx = bindings
                    .iter()
                    .position(|b| b.source == source && b.table == table && !b.explicit_alias);
                return match idx {
                    Some(i) => Ok(Some(i)),
                    None => Err(WeirError::plan_failed(format!(
                        "predicate qualifier '{q}' does not match any FROM table"
                    ))),
                };
            }
            match find_binding(q, bindings) {
                Some(i) => Ok(Some(i)),
                None => Err(WeirError::plan_failed(format!(
                    "predicate qualifier '{q}' does not match any FROM binding"
                ))),
            }
        }
        None => {
            if bindings.len() == 1 {
                Ok(Some(0))
            } else {
                Ok(None)
            }
        }
    }
}

/// Pushdown classification per the table descriptor's capabilities.
fn classify(
    binding: &TableBinding,
    column: &str,
    op: PredicateOp,
    value: &serde_json::Value,
    catalog: &Catalog,
) -> bool {
    let Some((_, table)) = catalog.resolve(&binding.source, &binding.table) else {
        return false;
    };
    if !table.is_pushable(column) {
        return false;
    }
    if !op.is_equality() && !(table.range_pushdown && op != PredicateOp::NotEq) {
        return false;
    }
    let Some(semantic) = table.semantic_type_of(column) else {
        return false;
    };
    type_accepts(semantic, op, value)
}

fn type_accepts(semantic: SemanticType, op: PredicateOp, value: &serde_json::Value) -> bool {
    match op {
        PredicateOp::In => match value {
            serde_json::Value::Array(options) => {
                options.iter().all(|v| semantic.accepts(v))
            }
            _ => false,
        },
        _ => semantic.accepts(value),
    }
}

// ---------------------------------------------------------------------------
// Column reference collection (projection pruning input)
// ---------------------------------------------------------------------------

fn collect_select_refs(
    select: &Select,
    refs: &mut Vec<ColumnRef>,
    wildcard_bindings: &mut BTreeSet<usize>,
    bindings: &[TableBinding],
) -> Result<()> {
    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                collect_column_refs(expr, refs)
            }
            SelectItem::Wildcard(_) => {
                for idx in 0..bindings.len() {
                    wildcard_bindings.insert(idx);
                }
            }
            SelectItem::QualifiedWildcard(kind, _) => {
                let name = kind.to_string().to_lowercase();
                match find_binding(&name, bindings) {
                    Some(idx) => {
                        wildcard_bindings.insert(idx);
                    }
                    None => {
                        return Err(WeirError::plan_failed(format!(
                            "wildcard qualifier '{name}' does not match any FROM binding"
                        )))
                    }
                }
            }
        }
    }

    for twj in &select.from {
        collect_join_condition_refs(twj, refs);
    }

    if let Some(where_clause) = &select.selection {
        collect_column_refs(where_clause, refs);
    }
    if let GroupByExpr::Expressions(exprs, _) = &select.group_by {
        for expr in exprs {
            collect_column_refs(expr, refs);
        }
    }
    if let Some(having) = &select.having {
        collect_column_refs(having, refs);
    }
    Ok(())
}

fn collect_join_condition_refs(twj: &TableWithJoins, refs: &mut Vec<ColumnRef>) {
    use sqlparser::ast::{JoinConstraint, JoinOperator};
    for join in &twj.joins {
        let constraint = match &join.join_operator {
            JoinOperator::Join(c)
            | JoinOperator::Inner(c)
            | JoinOperator::LeftOuter(c)
            | JoinOperator::RightOuter(c)
            | JoinOperator::FullOuter(c) => Some(c),
            _ => None,
        };
        if let Some(JoinConstraint::On(expr)) = constraint {
            collect_column_refs(expr, refs);
        }
    }
}

fn collect_column_refs(expr: &Expr, refs: &mut Vec<ColumnRef>) {
    match expr {
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
            if let Some(col) = column_ref(expr) {
                refs.push(col);
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_column_refs(left, refs);
            collect_column_refs(right, refs);
        }
        Expr::UnaryOp { expr: inner, .. } | Expr::Nested(inner) | Expr::Cast { expr: inner, .. } => {
            collect_column_refs(inner, refs)
        }
        Expr::IsNull(inner)
        | Expr::IsNotNull(inner)
        | Expr::IsTrue(inner)
        | Expr::IsFalse(inner) => collect_column_refs(inner, refs),
        Expr::Between {
            expr: inner,
            low,
            high,
            ..
        } => {
            collect_column_refs(inner, refs);
            collect_column_refs(low, refs);
            collect_column_refs(high, refs);
        }
        Expr::InList {
            expr: inner, list, ..
        } => {
            collect_column_refs(inner, refs);
            for item in list {
                collect_column_refs(item, refs);
            }
        }
        Expr::Like {
            expr: inner,
            pattern,
            ..
        }
        | Expr::ILike {
            expr: inner,
            pattern,
            ..
        } => {
            collect_column_refs(inner, refs);
            collect_column_refs(pattern, refs);
        }
        Expr::Function(func) => {
            if let FunctionArguments::List(arg_list) = &func.args {
                for arg in &arg_list.args {
                    match arg {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => {
                            collect_column_refs(e, refs)
                        }
                        FunctionArg::Named {
                            arg: FunctionArgExpr::Expr(e),
                            ..
                        } => collect_column_refs(e, refs),
                        _ => {}
                    }
                }
            }
        }
        Expr::Case {
            operand,
            conditions,
            else_result,
            ..
        } => {
            if let Some(op) = operand {
                collect_column_refs(op, refs);
            }
            for case_when in conditions {
                collect_column_refs(&case_when.condition, refs);
                collect_column_refs(&case_when.result, refs);
            }
            if let Some(else_r) = else_result {
                collect_column_refs(else_r, refs);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Unsupported-construct rejection
// ---------------------------------------------------------------------------

/// A window function may not reference columns of more than one source;
/// partitioned analytics over a cross-source frame are out of contract.
fn reject_multi_source_windows(select: &Select, bindings: &[TableBinding]) -> Result<()> {
    for item in &select.projection {
        let expr = match item {
            SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => e,
            _ => continue,
        };
        if let Expr::Function(func) = expr {
            if func.over.is_some() {
                let mut refs = Vec::new();
                collect_column_refs(expr, &mut refs);
                let mut touched = BTreeSet::new();
                for r in &refs {
                    if let Some(q) = &r.qualifier {
                        if let Some(idx) = find_binding(q, bindings) {
                            touched.insert(idx);
                        }
                    }
                }
                if touched.len() > 1 {
                    return Err(WeirError::plan_failed(
                        "window functions may not reference more than one source",
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Correlated subqueries in WHERE are rejected; uncorrelated ones would need
/// their own fetch nodes and are not in contract either, but they fail later
/// with an unknown-table error rather than silently mis-fetching.
fn reject_correlated_subqueries(where_clause: &Expr, bindings: &[TableBinding]) -> Result<()> {
    let mut subqueries = Vec::new();
    collect_subqueries(where_clause, &mut subqueries);

    for subquery in subqueries {
        let mut inner_aliases = BTreeSet::new();
        collect_query_aliases(subquery, &mut inner_aliases);

        let mut refs = Vec::new();
        if let SetExpr::Select(inner_select) = subquery.body.as_ref() {
            if let Some(inner_where) = &inner_select.selection {
                collect_column_refs(inner_where, &mut refs);
            }
            for item in &inner_select.projection {
                if let SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } =
                    item
                {
                    collect_column_refs(e, &mut refs);
                }
            }
        }

        for r in refs {
            if let Some(q) = r.qualifier {
                if !inner_aliases.contains(&q) && find_binding(&q, bindings).is_some() {
                    return Err(WeirError::plan_failed(
                        "correlated subqueries in WHERE are not supported",
                    ));
                }
            }
        }
    }
    Ok(())
}

fn collect_subqueries<'a>(expr: &'a Expr, out: &mut Vec<&'a Query>) {
    match expr {
        Expr::Subquery(q) => out.push(q),
        Expr::InSubquery { subquery, expr, .. } => {
            out.push(subquery);
            collect_subqueries(expr, out);
        }
        Expr::Exists { subquery, .. } => out.push(subquery),
        Expr::BinaryOp { left, right, .. } => {
            collect_subqueries(left, out);
            collect_subqueries(right, out);
        }
        Expr::UnaryOp { expr: inner, .. } | Expr::Nested(inner) => collect_subqueries(inner, out),
        _ => {}
    }
}

fn collect_query_aliases(query: &Query, aliases: &mut BTreeSet<String>) {
    if let SetExpr::Select(select) = query.body.as_ref() {
        for twj in &select.from {
            collect_factor_aliases(&twj.relation, aliases);
            for join in &twj.joins {
                collect_factor_aliases(&join.relation, aliases);
            }
        }
    }
}

fn collect_factor_aliases(factor: &TableFactor, aliases: &mut BTreeSet<String>) {
    if let TableFactor::Table { name, alias, .. } = factor {
        if let Some(a) = alias {
            aliases.insert(a.name.value.to_lowercase());
        }
        if let Some(last) = name.0.last() {
            aliases.insert(part_value(last).to_lowercase());
        }
    }
}
