//! Fetch planning: one fetch node per FROM binding, pruned projections, and
//! topological wave assignment.
//!
//! Waves exist so a future semi-join extension (fetch A, then fetch B
//! filtered by A's keys) slots in without rearchitecting the executor; today
//! every node has no dependencies and lands in a single wave.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::analyzer::AnalyzedQuery;
use crate::rewrite;
use weir_common::model::{Catalog, PredicateOp};
use weir_error::{Result, WeirError};

/// One unit of fetch work against a single source table.
#[derive(Debug, Clone)]
pub struct FetchNode {
    pub binding: usize,
    pub source: String,
    pub table: String,
    /// View name the filtered rowset is registered under.
    pub view_name: String,
    /// Column -> (op, literal), server-side filters for the source API.
    pub pushed_filters: BTreeMap<String, (PredicateOp, Value)>,
    /// Columns the query needs from this table; `None` means all of them.
    pub projected_columns: Option<Vec<String>>,
    /// Node indices that must complete first. Always empty today; reserved
    /// for semi-join pushdown.
    pub depends_on: Vec<usize>,
}

#[derive(Debug)]
pub struct FetchPlan {
    pub nodes: Vec<FetchNode>,
    /// Wave -> node indices; nodes within a wave run concurrently.
    pub waves: Vec<Vec<usize>>,
    /// The original SQL with `source.table` references replaced by view
    /// names, ready for the analytical runtime.
    pub rewritten_sql: String,
}

pub fn build_plan(analyzed: &AnalyzedQuery, catalog: &Catalog) -> Result<FetchPlan> {
    let mut nodes = Vec::with_capacity(analyzed.bindings.len());

    for (idx, binding) in analyzed.bindings.iter().enumerate() {
        let (_, table) = catalog
            .resolve(&binding.source, &binding.table)
            .ok_or_else(|| {
                WeirError::plan_failed(format!(
                    "unknown table '{}.{}'",
                    binding.source, binding.table
                ))
            })?;

        let mut pushed_filters = BTreeMap::new();
        for classified in analyzed.predicates.iter().filter(|p| p.binding == idx) {
            if !classified.pushable {
                continue;
            }
            let pred = &classified.predicate;
            // First filter per column wins; duplicates stay in the residual
            // SQL, which re-evaluates every predicate anyway.
            pushed_filters
                .entry(pred.column.clone())
                .or_insert_with(|| (pred.op, pred.value.clone()));
        }

        let projected_columns = if analyzed.wildcard_bindings.contains(&idx) {
            None
        } else {
            let referenced = analyzed
                .referenced_columns
                .get(&idx)
                .cloned()
                .unwrap_or_default();
            // Prune to columns the table actually declares.
            let mut columns: Vec<String> = referenced
                .into_iter()
                .filter(|c| table.has_column(c))
                .collect();
            // Pushed-filter columns ride along so residual re-evaluation
            // always has its inputs.
            for col in pushed_filters.keys() {
                if !columns.contains(col) {
                    columns.push(col.clone());
                }
            }
            columns.sort();
            Some(columns)
        };

        nodes.push(FetchNode {
            binding: idx,
            source: binding.source.clone(),
            table: binding.table.clone(),
            view_name: format!("{}_{}", binding.source, binding.table),
            pushed_filters,
            projected_columns,
            depends_on: Vec::new(),
        });
    }

    let waves = assign_waves(&nodes)?;
    let rewritten_sql = rewrite::rewrite_for_runtime(&analyzed.statement, &analyzed.bindings);

    Ok(FetchPlan {
        nodes,
        waves,
        rewritten_sql,
    })
}

/// Group nodes into topological waves: a node joins the first wave after all
/// of its dependencies have been placed.
fn assign_waves(nodes: &[FetchNode]) -> Result<Vec<Vec<usize>>> {
    let mut wave_of: Vec<Option<usize>> = vec![None; nodes.len()];
    let mut placed = 0;

    while placed < nodes.len() {
        let mut progressed = false;
        for (idx, node) in nodes.iter().enumerate() {
            if wave_of[idx].is_some() {
                continue;
            }
            let ready = node.depends_on.iter().all(|&dep| wave_of[dep].is_some());
            if ready {
                let wave = node
                    .depends_on
                    .iter()
                    .filter_map(|&dep| wave_of[dep])
                    .map(|dep_wave| dep_wave + 1)
                    .max()
                    .unwrap_or(0);
                wave_of[idx] = Some(wave);
                placed += 1;
                progressed = true;
            }
        }
        if !progressed {
            return Err(WeirError::internal(
                "cycle detected in fetch node dependencies",
            ));
        }
    }

    let max_wave = wave_of.iter().filter_map(|w| *w).max().unwrap_or(0);
    let mut waves = vec![Vec::new(); max_wave + 1];
    for (idx, wave) in wave_of.iter().enumerate() {
        waves[wave.unwrap_or(0)].push(idx);
    }
    Ok(waves)
}
