//! Ephemeral analytical runtime.
//!
//! Each query gets a fresh DataFusion session: filtered rowsets are
//! registered as in-memory record batches under `<source>_<table>` view
//! names, the rewritten SQL runs against them (joins, residual predicates,
//! ORDER BY, GROUP BY, LIMIT), and the session is dropped before the
//! response is built. No state survives a query.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use datafusion::error::DataFusionError;
use datafusion::prelude::SessionContext;
use serde_json::{Map, Value};
use tracing::debug;

use weir_common::model::{Rowset, SemanticType};
use weir_error::{Result, WeirError};

pub struct AnalyticalSession {
    ctx: SessionContext,
}

impl Default for AnalyticalSession {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalyticalSession {
    pub fn new() -> Self {
        Self {
            ctx: SessionContext::new(),
        }
    }

    /// Register one filtered rowset as a temporary view. An empty rowset
    /// still registers with its schema so joins resolve instead of failing
    /// with "table not found".
    pub fn register(&self, view_name: &str, rowset: &Rowset) -> Result<()> {
        let batch = rowset_to_batch(rowset)?;
        debug!(
            target: "runtime",
            view = %view_name,
            rows = rowset.len(),
            "registered rowset"
        );
        self.ctx
            .register_batch(view_name, batch)
            .map_err(map_df_err)?;
        Ok(())
    }

    /// Execute the rewritten SQL and shape the result as JSON rows.
    pub async fn run(&self, sql: &str) -> Result<(Vec<String>, Vec<Map<String, Value>>)> {
        let df = self.ctx.sql(sql).await.map_err(map_df_err)?;
        let columns: Vec<String> = df
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        let batches = df.collect().await.map_err(map_df_err)?;

        let mut rows = Vec::new();
        for batch in &batches {
            for row_idx in 0..batch.num_rows() {
                let mut row = Map::new();
                for (col_idx, field) in batch.schema().fields().iter().enumerate() {
                    let value = cell_to_json(batch.column(col_idx), row_idx)?;
                    row.insert(field.name().clone(), value);
                }
                rows.push(row);
            }
        }
        Ok((columns, rows))
    }
}

/// Planning-level failures (unknown column in a residual expression, type
/// errors) are the caller's SQL being wrong; everything else is ours.
fn map_df_err(err: DataFusionError) -> WeirError {
    match err {
        DataFusionError::Plan(msg) => {
            WeirError::plan_failed(format!("analytical planning failed: {msg}"))
        }
        err @ DataFusionError::SchemaError(_, _) => {
            WeirError::plan_failed(format!("analytical planning failed: {err}"))
        }
        DataFusionError::Diagnostic(_, inner) => map_df_err(*inner),
        other => WeirError::internal(format!("analytical runtime failure: {other}")),
    }
}

fn arrow_type(semantic: SemanticType) -> DataType {
    match semantic {
        SemanticType::Int => DataType::Int64,
        SemanticType::Float => DataType::Float64,
        SemanticType::Bool => DataType::Boolean,
        SemanticType::Text | SemanticType::Timestamp => DataType::Utf8,
    }
}

fn rowset_to_batch(rowset: &Rowset) -> Result<RecordBatch> {
    let fields: Vec<Field> = rowset
        .schema
        .columns
        .iter()
        .map(|c| Field::new(&c.name, arrow_type(c.semantic_type), true))
        .collect();
    let schema = Arc::new(Schema::new(fields));

    if rowset.rows.is_empty() {
        return Ok(RecordBatch::new_empty(schema));
    }

    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(rowset.schema.columns.len());
    for (idx, column) in rowset.schema.columns.iter().enumerate() {
        let array: ArrayRef = match column.semantic_type {
            SemanticType::Int => {
                let mut builder = Int64Builder::with_capacity(rowset.rows.len());
                for row in &rowset.rows {
                    builder.append_option(row[idx].as_i64());
                }
                Arc::new(builder.finish())
            }
            SemanticType::Float => {
                let mut builder = Float64Builder::with_capacity(rowset.rows.len());
                for row in &rowset.rows {
                    builder.append_option(row[idx].as_f64());
                }
                Arc::new(builder.finish())
            }
            SemanticType::Bool => {
                let mut builder = BooleanBuilder::with_capacity(rowset.rows.len());
                for row in &rowset.rows {
                    builder.append_option(row[idx].as_bool());
                }
                Arc::new(builder.finish())
            }
            SemanticType::Text | SemanticType::Timestamp => {
                let mut builder = StringBuilder::new();
                for row in &rowset.rows {
                    match &row[idx] {
                        Value::Null => builder.append_null(),
                        Value::String(s) => builder.append_value(s),
                        other => builder.append_value(other.to_string()),
                    }
                }
                Arc::new(builder.finish())
            }
        };
        arrays.push(array);
    }

    RecordBatch::try_new(schema, arrays)
        .map_err(|e| WeirError::internal(format!("rowset to batch conversion failed: {e}")))
}

fn cell_to_json(array: &ArrayRef, row: usize) -> Result<Value> {
    use arrow::array::{
        BooleanArray, Float32Array, Float64Array, Int32Array, Int64Array, LargeStringArray,
        StringArray, UInt64Array,
    };

    if array.is_null(row) {
        return Ok(Value::Null);
    }

    let value = match array.data_type() {
        DataType::Int64 => {
            let a = array.as_any().downcast_ref::<Int64Array>().unwrap();
            Value::from(a.value(row))
        }
        DataType::Int32 => {
            let a = array.as_any().downcast_ref::<Int32Array>().unwrap();
            Value::from(a.value(row))
        }
        DataType::UInt64 => {
            let a = array.as_any().downcast_ref::<UInt64Array>().unwrap();
            Value::from(a.value(row))
        }
        DataType::Float64 => {
            let a = array.as_any().downcast_ref::<Float64Array>().unwrap();
            serde_json::Number::from_f64(a.value(row))
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        DataType::Float32 => {
            let a = array.as_any().downcast_ref::<Float32Array>().unwrap();
            serde_json::Number::from_f64(a.value(row) as f64)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        DataType::Boolean => {
            let a = array.as_any().downcast_ref::<BooleanArray>().unwrap();
            Value::Bool(a.value(row))
        }
        DataType::Utf8 => {
            let a = array.as_any().downcast_ref::<StringArray>().unwrap();
            Value::String(a.value(row).to_string())
        }
        DataType::LargeUtf8 => {
            let a = array.as_any().downcast_ref::<LargeStringArray>().unwrap();
            Value::String(a.value(row).to_string())
        }
        _ => {
            let text = array_value_to_string(array, row)
                .map_err(|e| WeirError::internal(format!("result serialization failed: {e}")))?;
            Value::String(text)
        }
    };
    Ok(value)
}
