//! Source adapter contract for the Weir gateway.
//!
//! A connector is any value with two operations: describe the tables it
//! serves, and fetch rows for one table under a filter, projection and
//! deadline. Adapters own pagination and auth-token refresh; they must
//! return within the deadline and must NOT retry internally on throttling —
//! backing off on a rate limit is the governor's job.

pub mod manifest;
pub mod testing;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use weir_common::model::{Catalog, PredicateOp, Rowset, SourceDescriptor};
use weir_error::Result;

/// Arguments for one fetch against one source table.
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    pub table: &'a str,
    /// Column -> (op, literal) filters the source evaluates server-side.
    pub pushed_filters: &'a BTreeMap<String, (PredicateOp, Value)>,
    /// Columns to return; `None` means the full row.
    pub projected_columns: Option<&'a [String]>,
    /// Remaining time budget. The adapter must return (or fail with
    /// `SOURCE_TIMEOUT`) within it.
    pub deadline: Duration,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Stable source name (`github`, `jira`, ...).
    fn name(&self) -> &str;

    /// Capability descriptor: tables, pushable filters, rate capacity.
    fn describe(&self) -> SourceDescriptor;

    /// Fetch rows for one table. Row order is preserved as returned by the
    /// source. Errors are mapped to the standard wire kinds.
    async fn fetch(&self, request: FetchRequest<'_>) -> Result<Rowset>;
}

/// All registered source adapters, keyed by source name.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors
            .insert(connector.name().to_string(), connector);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(name).cloned()
    }

    /// The planner-facing catalog assembled from every adapter's descriptor.
    pub fn catalog(&self) -> Catalog {
        Catalog::new(self.connectors.values().map(|c| c.describe()).collect())
    }

    pub fn source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connectors.keys().cloned().collect();
        names.sort();
        names
    }
}
