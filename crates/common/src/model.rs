//! Core data model: semantic types, rowsets, predicates, and the source
//! catalog.
//!
//! A [`Rowset`] carries one [`RowsetSchema`] shared by all of its rows; the
//! schema is the source of truth for column order and types. Cells are JSON
//! values as returned by SaaS APIs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

/// Semantic column types understood by the pipeline.
///
/// Timestamps travel as RFC 3339 text end to end, which keeps lexicographic
/// and chronological ordering aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    Int,
    Float,
    Text,
    Bool,
    Timestamp,
}

impl SemanticType {
    /// Whether a literal value is acceptable for a column of this type.
    /// NULL is acceptable for every type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (Self::Int, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Self::Float, Value::Number(_)) => true,
            (Self::Text, Value::String(_)) => true,
            (Self::Bool, Value::Bool(_)) => true,
            (Self::Timestamp, Value::String(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub semantic_type: SemanticType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            semantic_type,
        }
    }
}

/// Ordered column descriptor shared by every row of a rowset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowsetSchema {
    pub columns: Vec<ColumnDef>,
}

impl RowsetSchema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// An ordered list of records for one fetch node.
///
/// `age_ms` is the time since the data was materialized at the source
/// adapter (0 for a live fetch) or cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rowset {
    pub schema: RowsetSchema,
    pub rows: Vec<Vec<Value>>,
    pub age_ms: u64,
}

impl Rowset {
    pub fn new(schema: RowsetSchema, rows: Vec<Vec<Value>>) -> Self {
        Self {
            schema,
            rows,
            age_ms: 0,
        }
    }

    pub fn empty(schema: RowsetSchema) -> Self {
        Self::new(schema, Vec::new())
    }

    /// Build a rowset from map-shaped records, taking cell order from the
    /// schema. Missing keys become NULL.
    pub fn from_maps(schema: RowsetSchema, records: &[serde_json::Map<String, Value>]) -> Self {
        let rows = records
            .iter()
            .map(|rec| {
                schema
                    .columns
                    .iter()
                    .map(|c| rec.get(&c.name).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Self::new(schema, rows)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Narrow the rowset to the named columns, preserving row order.
    /// Unknown names are ignored (the source may have blocked them).
    pub fn project(&self, columns: &[String]) -> Rowset {
        let keep: Vec<usize> = columns
            .iter()
            .filter_map(|name| self.schema.column_index(name))
            .collect();
        let schema = RowsetSchema::new(
            keep.iter()
                .map(|&i| self.schema.columns[i].clone())
                .collect(),
        );
        let rows = self
            .rows
            .iter()
            .map(|row| keep.iter().map(|&i| row[i].clone()).collect())
            .collect();
        Rowset {
            schema,
            rows,
            age_ms: self.age_ms,
        }
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.schema.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }
}

/// Comparison operators that may appear in a predicate atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
    Eq,
    NotEq,
    Gt,
    Lt,
    GtEq,
    LtEq,
    In,
}

impl PredicateOp {
    /// Equality-shaped operators are pushable to every source; ordered
    /// operators only where the table descriptor opts in.
    pub fn is_equality(&self) -> bool {
        matches!(self, Self::Eq | Self::In)
    }

    pub fn as_sql_str(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::GtEq => ">=",
            Self::LtEq => "<=",
            Self::In => "IN",
        }
    }
}

impl fmt::Display for PredicateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_sql_str())
    }
}

/// One WHERE atom: `qualifier.column OP literal`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predicate {
    /// Table qualifier as written in the SQL (alias or table name).
    /// Absent for bare column references.
    pub qualifier: Option<String>,
    pub column: String,
    pub op: PredicateOp,
    /// Literal operand. For `IN`, a JSON array of literals.
    pub value: Value,
}

/// Total-enough ordering over JSON scalars for predicate evaluation.
/// Numbers compare numerically, strings and booleans by natural order.
/// Values of unlike types (and NULLs) do not compare.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64()?, y.as_f64()?);
            x.partial_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Evaluate `cell OP literal` with SQL-ish semantics: any comparison
/// involving NULL or unlike types is false.
pub fn op_matches(op: PredicateOp, cell: &Value, literal: &Value) -> bool {
    match op {
        PredicateOp::In => match literal {
            Value::Array(options) => options
                .iter()
                .any(|opt| compare_values(cell, opt) == Some(Ordering::Equal)),
            _ => false,
        },
        _ => {
            let Some(ord) = compare_values(cell, literal) else {
                return false;
            };
            match op {
                PredicateOp::Eq => ord == Ordering::Equal,
                PredicateOp::NotEq => ord != Ordering::Equal,
                PredicateOp::Gt => ord == Ordering::Greater,
                PredicateOp::Lt => ord == Ordering::Less,
                PredicateOp::GtEq => ord != Ordering::Less,
                PredicateOp::LtEq => ord != Ordering::Greater,
                PredicateOp::In => unreachable!(),
            }
        }
    }
}

/// Per-table capabilities a source declares about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Columns the source API can filter by server-side.
    #[serde(default)]
    pub pushable_filters: Vec<String>,
    /// Whether ordered operators (`> < >= <=`) may be pushed too.
    #[serde(default)]
    pub range_pushdown: bool,
    /// Whether the source can omit unrequested columns.
    #[serde(default = "default_true")]
    pub supports_projection: bool,
    /// Whether the source supports etag-style conditional fetch.
    #[serde(default)]
    pub conditional_fetch: bool,
}

fn default_true() -> bool {
    true
}

impl TableDescriptor {
    pub fn schema(&self) -> RowsetSchema {
        RowsetSchema::new(self.columns.clone())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn semantic_type_of(&self, name: &str) -> Option<SemanticType> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.semantic_type)
    }

    pub fn is_pushable(&self, column: &str) -> bool {
        self.pushable_filters.iter().any(|c| c == column)
    }
}

/// Everything the planner and governor need to know about one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: String,
    /// Nominal token-bucket capacity for this source.
    pub rate_capacity: u32,
    /// Bucket refill rate in tokens per second.
    pub refill_per_second: f64,
    /// Maximum age at which a cached rowset may ever be served.
    pub hard_staleness_cap_ms: u64,
    pub tables: Vec<TableDescriptor>,
}

impl SourceDescriptor {
    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// All sources visible to the planner, keyed by source name.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    sources: HashMap<String, SourceDescriptor>,
}

impl Catalog {
    pub fn new(descriptors: Vec<SourceDescriptor>) -> Self {
        Self {
            sources: descriptors
                .into_iter()
                .map(|d| (d.name.clone(), d))
                .collect(),
        }
    }

    pub fn source(&self, name: &str) -> Option<&SourceDescriptor> {
        self.sources.get(name)
    }

    pub fn resolve(&self, source: &str, table: &str) -> Option<(&SourceDescriptor, &TableDescriptor)> {
        let src = self.sources.get(source)?;
        let tbl = src.table(table)?;
        Some((src, tbl))
    }

    pub fn source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.keys().cloned().collect();
        names.sort();
        names
    }
}
