//! The declarative connector: one adapter parameterized by a YAML manifest.
//!
//! Standard REST/GraphQL SaaS sources are onboarded by describing their
//! tables, pushdown capabilities and rate budget in a manifest — no adapter
//! code. The manifest also carries fixture rows (demo/test mode) and fault
//! hooks so the pipeline can be exercised without network access; a real
//! transport drops in behind the same manifest shape.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::{Connector, FetchRequest};
use weir_common::config::RetrySettings;
use weir_common::model::{op_matches, ColumnDef, Rowset, RowsetSchema, SourceDescriptor, TableDescriptor};
use weir_common::retry::retry_transient;
use weir_error::{ErrorCode, Result, WeirError};

const DEFAULT_RATE_CAPACITY: u32 = 50;
const DEFAULT_REFILL_PER_SECOND: f64 = 10.0;
const DEFAULT_HARD_STALENESS_CAP_MS: u64 = 300_000;

#[derive(Debug, Deserialize)]
pub struct ConnectorManifest {
    pub name: String,
    #[serde(default)]
    pub rate_limit: RateLimitManifest,
    #[serde(default = "default_hard_cap")]
    pub hard_staleness_cap_ms: u64,
    /// `env://VAR` style credential pointer; never logged.
    #[serde(default)]
    pub credential_ref: Option<SecretString>,
    /// Simulated source latency per fetch (fixture mode).
    #[serde(default)]
    pub latency_ms: u64,
    /// Inject a transient failure on the first N transport attempts.
    #[serde(default)]
    pub fail_first: u32,
    #[serde(default)]
    pub retry: RetrySettings,
    pub tables: Vec<TableManifest>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RateLimitManifest {
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default = "default_refill")]
    pub refill_per_second: f64,
}

impl Default for RateLimitManifest {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_per_second: default_refill(),
        }
    }
}

fn default_capacity() -> u32 {
    DEFAULT_RATE_CAPACITY
}
fn default_refill() -> f64 {
    DEFAULT_REFILL_PER_SECOND
}
fn default_hard_cap() -> u64 {
    DEFAULT_HARD_STALENESS_CAP_MS
}

#[derive(Debug, Deserialize)]
pub struct TableManifest {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub pushable_filters: Vec<String>,
    #[serde(default)]
    pub range_pushdown: bool,
    #[serde(default = "default_true")]
    pub supports_projection: bool,
    #[serde(default)]
    pub conditional_fetch: bool,
    #[serde(default)]
    pub fixtures: Vec<serde_json::Map<String, Value>>,
}

fn default_true() -> bool {
    true
}

impl ConnectorManifest {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            WeirError::new(
                ErrorCode::SourceError,
                format!("invalid connector manifest: {e}"),
            )
        })
    }

    pub fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor {
            name: self.name.clone(),
            rate_capacity: self.rate_limit.capacity,
            refill_per_second: self.rate_limit.refill_per_second,
            hard_staleness_cap_ms: self.hard_staleness_cap_ms,
            tables: self
                .tables
                .iter()
                .map(|t| TableDescriptor {
                    name: t.name.clone(),
                    columns: t.columns.clone(),
                    pushable_filters: t.pushable_filters.clone(),
                    range_pushdown: t.range_pushdown,
                    supports_projection: t.supports_projection,
                    conditional_fetch: t.conditional_fetch,
                })
                .collect(),
        }
    }

    fn table(&self, name: &str) -> Option<&TableManifest> {
        self.tables.iter().find(|t| t.name == name)
    }
}

pub struct ManifestConnector {
    manifest: ConnectorManifest,
    fetches: AtomicUsize,
    failures_remaining: AtomicU32,
}

impl ManifestConnector {
    pub fn new(manifest: ConnectorManifest) -> Self {
        let failures = manifest.fail_first;
        Self {
            manifest,
            fetches: AtomicUsize::new(0),
            failures_remaining: AtomicU32::new(failures),
        }
    }

    /// Number of fetch calls this adapter has served. Used by admission and
    /// single-flight assertions.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn read_fixtures(&self, table: &TableManifest) -> Result<Vec<serde_json::Map<String, Value>>> {
        if self.failures_remaining.load(Ordering::SeqCst) > 0 {
            self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(WeirError::new(
                ErrorCode::SourceError,
                format!("injected transient failure from '{}'", self.manifest.name),
            )
            .with_source(self.manifest.name.clone()));
        }
        Ok(table.fixtures.clone())
    }
}

#[async_trait]
impl Connector for ManifestConnector {
    fn name(&self) -> &str {
        &self.manifest.name
    }

    fn describe(&self) -> SourceDescriptor {
        self.manifest.descriptor()
    }

    async fn fetch(&self, request: FetchRequest<'_>) -> Result<Rowset> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let table = self.manifest.table(request.table).ok_or_else(|| {
            WeirError::new(
                ErrorCode::SourceError,
                format!("source '{}' has no table '{}'", self.manifest.name, request.table),
            )
            .with_source(self.manifest.name.clone())
        })?;

        // Honor the deadline: a source slower than the budget times out
        // instead of overrunning it.
        if self.manifest.latency_ms > 0 {
            let latency = Duration::from_millis(self.manifest.latency_ms);
            if latency >= request.deadline {
                tokio::time::sleep(request.deadline).await;
                return Err(WeirError::new(
                    ErrorCode::SourceTimeout,
                    format!("source '{}' exceeded its deadline", self.manifest.name),
                )
                .with_source(self.manifest.name.clone()));
            }
            tokio::time::sleep(latency).await;
        }

        // Transient transport faults are retried with backoff; throttling
        // never is (the governor owns that budget).
        let records = retry_transient(
            &format!("{}.{}", self.manifest.name, request.table),
            self.manifest.retry,
            |e: &WeirError| e.code == ErrorCode::SourceError,
            || async { self.read_fixtures(table) },
        )
        .await?;

        // Server-side filter evaluation: a row survives iff every pushed
        // filter matches. Missing columns never match.
        let filtered: Vec<serde_json::Map<String, Value>> = records
            .into_iter()
            .filter(|row| {
                request.pushed_filters.iter().all(|(column, (op, literal))| {
                    row.get(column)
                        .map(|cell| op_matches(*op, cell, literal))
                        .unwrap_or(false)
                })
            })
            .collect();

        let schema = match request.projected_columns {
            Some(projection) if table.supports_projection => RowsetSchema::new(
                table
                    .columns
                    .iter()
                    .filter(|c| projection.contains(&c.name))
                    .cloned()
                    .collect(),
            ),
            _ => RowsetSchema::new(table.columns.clone()),
        };

        debug!(
            target: "connector",
            source = %self.manifest.name,
            table = %request.table,
            rows = filtered.len(),
            filters = request.pushed_filters.len(),
            "fetched fixture rows"
        );

        Ok(Rowset::from_maps(schema, &filtered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use weir_common::model::PredicateOp;

    const MANIFEST: &str = r#"
name: github
rate_limit: { capacity: 50, refill_per_second: 10.0 }
hard_staleness_cap_ms: 60000
tables:
  - name: pull_requests
    columns:
      - { name: pr_id, type: int }
      - { name: author, type: text }
      - { name: status, type: text }
      - { name: team_id, type: text }
    pushable_filters: [status, team_id]
    fixtures:
      - { pr_id: 1, author: dev_a, status: merged, team_id: mobile }
      - { pr_id: 2, author: dev_b, status: open, team_id: web }
      - { pr_id: 3, author: dev_c, status: merged, team_id: web }
"#;

    fn connector() -> ManifestConnector {
        ManifestConnector::new(ConnectorManifest::from_yaml(MANIFEST).unwrap())
    }

    fn request<'a>(
        filters: &'a BTreeMap<String, (PredicateOp, Value)>,
        projection: Option<&'a [String]>,
    ) -> FetchRequest<'a> {
        FetchRequest {
            table: "pull_requests",
            pushed_filters: filters,
            projected_columns: projection,
            deadline: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn pushed_filters_narrow_rows() {
        let c = connector();
        let mut filters = BTreeMap::new();
        filters.insert(
            "status".to_string(),
            (PredicateOp::Eq, Value::String("merged".into())),
        );
        let rowset = c.fetch(request(&filters, None)).await.unwrap();
        assert_eq!(rowset.len(), 2);
        for row in 0..rowset.len() {
            assert_eq!(rowset.cell(row, "status"), Some(&Value::String("merged".into())));
        }
        assert_eq!(c.fetch_count(), 1);
    }

    #[tokio::test]
    async fn empty_filter_returns_everything() {
        let c = connector();
        let filters = BTreeMap::new();
        let rowset = c.fetch(request(&filters, None)).await.unwrap();
        assert_eq!(rowset.len(), 3);
        // Fixture order is preserved
        assert_eq!(rowset.cell(0, "pr_id"), Some(&Value::from(1)));
        assert_eq!(rowset.cell(2, "pr_id"), Some(&Value::from(3)));
    }

    #[tokio::test]
    async fn projection_narrows_schema() {
        let c = connector();
        let filters = BTreeMap::new();
        let projection = vec!["pr_id".to_string(), "status".to_string()];
        let rowset = c.fetch(request(&filters, Some(&projection))).await.unwrap();
        assert_eq!(rowset.schema.column_names(), vec!["pr_id", "status"]);
    }

    #[tokio::test]
    async fn unknown_table_is_a_source_error() {
        let c = connector();
        let filters = BTreeMap::new();
        let err = c
            .fetch(FetchRequest {
                table: "deployments",
                pushed_filters: &filters,
                projected_columns: None,
                deadline: Duration::from_secs(1),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SourceError);
    }

    #[tokio::test]
    async fn transient_faults_are_retried_through() {
        let mut manifest = ConnectorManifest::from_yaml(MANIFEST).unwrap();
        manifest.fail_first = 1;
        manifest.retry = RetrySettings {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        };
        let c = ManifestConnector::new(manifest);
        let filters = BTreeMap::new();
        let rowset = c.fetch(request(&filters, None)).await.unwrap();
        assert_eq!(rowset.len(), 3);
    }

    #[tokio::test]
    async fn slow_source_times_out_within_deadline() {
        let mut manifest = ConnectorManifest::from_yaml(MANIFEST).unwrap();
        manifest.latency_ms = 200;
        let c = ManifestConnector::new(manifest);
        let filters = BTreeMap::new();
        let err = c
            .fetch(FetchRequest {
                table: "pull_requests",
                pushed_filters: &filters,
                projected_columns: None,
                deadline: Duration::from_millis(20),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SourceTimeout);
    }
}
