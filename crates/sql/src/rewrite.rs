//! Rewrites the analyzed statement for the analytical runtime.
//!
//! Each `source.table` FROM reference becomes the registered view name
//! (`source_table`). When the user wrote no alias, the bare table name is
//! attached as one, so column qualifiers like `pull_requests.id` keep
//! resolving after the rename. Three-part column references
//! (`source.table.column`) are collapsed to `table.column` to match.

use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr, Ident, ObjectNamePart,
    OrderByKind, Query, Select, SelectItem, SetExpr, Statement, TableAlias, TableFactor,
    TableWithJoins,
};

use crate::analyzer::TableBinding;

pub fn rewrite_for_runtime(statement: &Statement, bindings: &[TableBinding]) -> String {
    let mut statement = statement.clone();
    if let Statement::Query(query) = &mut statement {
        rewrite_query(query, bindings);
    }
    statement.to_string()
}

fn view_name(source: &str, table: &str) -> String {
    format!("{}_{}", source, table)
}

fn rewrite_query(query: &mut Query, bindings: &[TableBinding]) {
    rewrite_set_expr(&mut query.body, bindings);
    if let Some(order_by) = &mut query.order_by {
        if let OrderByKind::Expressions(exprs) = &mut order_by.kind {
            for obe in exprs {
                rewrite_expr(&mut obe.expr, bindings);
            }
        }
    }
}

fn rewrite_set_expr(set_expr: &mut SetExpr, bindings: &[TableBinding]) {
    match set_expr {
        SetExpr::Select(select) => rewrite_select(select, bindings),
        SetExpr::Query(query) => rewrite_query(query, bindings),
        SetExpr::SetOperation { left, right, .. } => {
            rewrite_set_expr(left, bindings);
            rewrite_set_expr(right, bindings);
        }
        _ => {}
    }
}

fn rewrite_select(select: &mut Select, bindings: &[TableBinding]) {
    for twj in &mut select.from {
        rewrite_table_with_joins(twj, bindings);
    }
    for item in &mut select.projection {
        if let SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } = item {
            rewrite_expr(expr, bindings);
        }
    }
    if let Some(selection) = &mut select.selection {
        rewrite_expr(selection, bindings);
    }
    if let GroupByExpr::Expressions(exprs, _) = &mut select.group_by {
        for expr in exprs {
            rewrite_expr(expr, bindings);
        }
    }
    if let Some(having) = &mut select.having {
        rewrite_expr(having, bindings);
    }
}

fn rewrite_table_with_joins(twj: &mut TableWithJoins, bindings: &[TableBinding]) {
    use sqlparser::ast::{JoinConstraint, JoinOperator};
    rewrite_table_factor(&mut twj.relation, bindings);
    for join in &mut twj.joins {
        rewrite_table_factor(&mut join.relation, bindings);
        match &mut join.join_operator {
            JoinOperator::Join(constraint)
            | JoinOperator::Inner(constraint)
            | JoinOperator::LeftOuter(constraint)
            | JoinOperator::RightOuter(constraint)
            | JoinOperator::FullOuter(constraint) => {
                if let JoinConstraint::On(expr) = constraint {
                    rewrite_expr(expr, bindings);
                }
            }
            _ => {}
        }
    }
}

fn rewrite_table_factor(factor: &mut TableFactor, bindings: &[TableBinding]) {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            let parts: Vec<String> = name
                .0
                .iter()
                .map(|p| match p {
                    ObjectNamePart::Identifier(ident) => ident.value.to_lowercase(),
                    _ => String::new(),
                })
                .collect();
            if parts.len() != 2 {
                return;
            }
            let matched = bindings
                .iter()
                .any(|b| b.source == parts[0] && b.table == parts[1]);
            if !matched {
                return;
            }
            name.0 = vec![ObjectNamePart::Identifier(Ident::new(view_name(
                &parts[0], &parts[1],
            )))];
            if alias.is_none() {
                // Keep bare-table-name qualifiers resolvable post-rename.
                *alias = Some(TableAlias {
                    name: Ident::new(parts[1].clone()),
                    columns: vec![],
                });
            }
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            rewrite_table_with_joins(table_with_joins, bindings);
        }
        TableFactor::Derived { subquery, .. } => {
            rewrite_query(subquery, bindings);
        }
        _ => {}
    }
}

fn rewrite_expr(expr: &mut Expr, bindings: &[TableBinding]) {
    match expr {
        Expr::CompoundIdentifier(idents) => {
            // source.table.column -> table.column
            if idents.len() == 3 {
                let source = idents[0].value.to_lowercase();
                let table = idents[1].value.to_lowercase();
                if bindings
                    .iter()
                    .any(|b| b.source == source && b.table == table && !b.explicit_alias)
                {
                    *idents = vec![idents[1].clone(), idents[2].clone()];
                }
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            rewrite_expr(left, bindings);
            rewrite_expr(right, bindings);
        }
        Expr::UnaryOp { expr: inner, .. }
        | Expr::Nested(inner)
        | Expr::Cast { expr: inner, .. } => rewrite_expr(inner, bindings),
        Expr::IsNull(inner)
        | Expr::IsNotNull(inner)
        | Expr::IsTrue(inner)
        | Expr::IsFalse(inner) => rewrite_expr(inner, bindings),
        Expr::Between {
            expr: inner,
            low,
            high,
            ..
        } => {
            rewrite_expr(inner, bindings);
            rewrite_expr(low, bindings);
            rewrite_expr(high, bindings);
        }
        Expr::InList {
            expr: inner, list, ..
        } => {
            rewrite_expr(inner, bindings);
            for item in list {
                rewrite_expr(item, bindings);
            }
        }
        Expr::InSubquery {
            expr: inner,
            subquery,
            ..
        } => {
            rewrite_expr(inner, bindings);
            rewrite_query(subquery, bindings);
        }
        Expr::Subquery(subquery) => rewrite_query(subquery, bindings),
        Expr::Exists { subquery, .. } => rewrite_query(subquery, bindings),
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
            rewrite_expr(inner, bindings);
            rewrite_expr(pattern, bindings);
        }
        Expr::Function(func) => {
            if let FunctionArguments::List(arg_list) = &mut func.args {
                for arg in &mut arg_list.args {
                    match arg {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => {
                            rewrite_expr(e, bindings)
                        }
                        FunctionArg::Named {
                            arg: FunctionArgExpr::Expr(e),
                            ..
                        } => rewrite_expr(e, bindings),
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
                rewrite_expr(op, bindings);
            }
            for case_when in conditions {
                rewrite_expr(&mut case_when.condition, bindings);
                rewrite_expr(&mut case_when.result, bindings);
            }
            if let Some(else_r) = else_result {
                rewrite_expr(else_r, bindings);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze;
    use weir_common::model::{Catalog, ColumnDef, SemanticType, SourceDescriptor, TableDescriptor};

    fn catalog() -> Catalog {
        Catalog::new(vec![
            SourceDescriptor {
                name: "github".into(),
                rate_capacity: 50,
                refill_per_second: 10.0,
                hard_staleness_cap_ms: 300_000,
                tables: vec![TableDescriptor {
                    name: "pull_requests".into(),
                    columns: vec![
                        ColumnDef::new("id", SemanticType::Int),
                        ColumnDef::new("branch", SemanticType::Text),
                        ColumnDef::new("status", SemanticType::Text),
                    ],
                    pushable_filters: vec!["status".into()],
                    range_pushdown: false,
                    supports_projection: true,
                    conditional_fetch: false,
                }],
            },
            SourceDescriptor {
                name: "jira".into(),
                rate_capacity: 30,
                refill_per_second: 5.0,
                hard_staleness_cap_ms: 300_000,
                tables: vec![TableDescriptor {
                    name: "issues".into(),
                    columns: vec![
                        ColumnDef::new("issue_key", SemanticType::Text),
                        ColumnDef::new("branch_name", SemanticType::Text),
                    ],
                    pushable_filters: vec![],
                    range_pushdown: false,
                    supports_projection: true,
                    conditional_fetch: false,
                }],
            },
        ])
    }

    fn rewrite(sql: &str) -> String {
        let c = catalog();
        let analyzed = analyze(sql, &c).unwrap();
        rewrite_for_runtime(&analyzed.statement, &analyzed.bindings)
    }

    #[test]
    fn aliased_tables_keep_their_alias() {
        let out = rewrite(
            "SELECT gh.id FROM github.pull_requests gh \
             JOIN jira.issues ji ON gh.branch = ji.branch_name",
        );
        assert!(out.contains("github_pull_requests AS gh"));
        assert!(out.contains("jira_issues AS ji"));
        assert!(out.contains("gh.branch = ji.branch_name"));
        assert!(!out.contains("github.pull_requests"));
    }

    #[test]
    fn unaliased_table_gets_its_bare_name_as_alias() {
        let out = rewrite("SELECT pull_requests.id FROM github.pull_requests");
        assert!(out.contains("github_pull_requests AS pull_requests"));
        assert!(out.contains("pull_requests.id"));
    }

    #[test]
    fn three_part_column_references_collapse() {
        let out = rewrite(
            "SELECT github.pull_requests.id FROM github.pull_requests \
             WHERE github.pull_requests.status = 'open'",
        );
        assert!(out.contains("pull_requests.id"));
        assert!(!out.contains("github.pull_requests.id"));
        assert!(out.contains("pull_requests.status = 'open'"));
    }
}
