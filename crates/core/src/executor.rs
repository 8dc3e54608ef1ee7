//! Parallel fetch execution.
//!
//! Runs a plan wave by wave. Within a wave every node's pipeline —
//! cache lookup, single-flight guard, governor admission, connector fetch,
//! cache write-back, security filter — runs as its own task under a
//! per-query semaphore. One cancellation token is shared by all tasks: the
//! query deadline, a fatal node error, or the caller dropping the request
//! cancels every outstanding sibling, and tasks check the token between
//! stages so no new connector call starts after cancellation.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{CacheKey, FreshnessCache};
use crate::governor::RateGovernor;
use crate::policy::PolicySet;
use crate::security::{self, RuleSet};
use weir_common::config::QueryLimits;
use weir_common::model::{Catalog, Rowset, SourceDescriptor, TableDescriptor};
use weir_common::principal::Principal;
use weir_connectors::{Connector, ConnectorRegistry, FetchRequest};
use weir_error::{ErrorCode, Result, WeirError};
use weir_sql::{FetchNode, FetchPlan};

const CANCELLED_MSG: &str = "query cancelled";

/// Process-wide services the executor runs against.
#[derive(Clone)]
pub struct FetchEnv {
    pub cache: Arc<FreshnessCache>,
    pub governor: Arc<RateGovernor>,
    pub connectors: ConnectorRegistry,
    pub limits: QueryLimits,
}

/// Per-query execution context. Principal and tenant are fixed for the
/// query's life.
#[derive(Clone)]
pub struct QueryContext {
    pub principal: Principal,
    pub policies: PolicySet,
    pub max_staleness_ms: u64,
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

/// Result of one node's pipeline, post-security.
#[derive(Debug)]
pub struct NodeOutcome {
    pub node_index: usize,
    pub source: String,
    pub view_name: String,
    pub rowset: Rowset,
    /// Row count before security filtering (entitlement accounting).
    pub raw_rows: usize,
    pub from_cache: bool,
    pub freshness_ms: u64,
    pub stale: bool,
    pub fetch_ms: u64,
    pub security_ms: u64,
}

pub async fn run_plan(
    env: &FetchEnv,
    plan: &FetchPlan,
    catalog: &Catalog,
    ctx: &QueryContext,
) -> Result<Vec<NodeOutcome>> {
    let parallelism = env
        .limits
        .max_parallel_fetches
        .min(plan.nodes.len().max(1));
    let semaphore = Arc::new(Semaphore::new(parallelism));

    // Deadline watchdog: fires the shared token so outstanding tasks stop
    // between stages instead of starting new connector calls.
    let watchdog = {
        let cancel = ctx.cancel.clone();
        let deadline = ctx.deadline;
        tokio::spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            cancel.cancel();
        })
    };

    let mut outcomes: Vec<NodeOutcome> = Vec::with_capacity(plan.nodes.len());
    let mut errors: Vec<WeirError> = Vec::new();

    'waves: for wave in &plan.waves {
        let mut handles = Vec::with_capacity(wave.len());
        for &node_index in wave {
            let node = plan.nodes[node_index].clone();
            let Some((source, table)) = catalog.resolve(&node.source, &node.table) else {
                errors.push(
                    WeirError::plan_failed(format!(
                        "unknown table '{}.{}'",
                        node.source, node.table
                    ))
                    .with_source(node.source.clone()),
                );
                break 'waves;
            };
            let Some(connector) = env.connectors.get(&node.source) else {
                errors.push(
                    WeirError::new(
                        ErrorCode::SourceError,
                        format!("no connector registered for '{}'", node.source),
                    )
                    .with_source(node.source.clone()),
                );
                break 'waves;
            };

            let task = NodeTask {
                node,
                node_index,
                source: source.clone(),
                table: table.clone(),
                connector,
                rules: ctx
                    .policies
                    .get(&plan.nodes[node_index].source)
                    .cloned()
                    .unwrap_or_default(),
                env: env.clone(),
                principal: ctx.principal.clone(),
                max_staleness_ms: ctx.max_staleness_ms,
                deadline: ctx.deadline,
                cancel: ctx.cancel.clone(),
            };
            let semaphore = semaphore.clone();
            let cancel = ctx.cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = task.run().await;
                if result.is_err() {
                    // Fatal node error: stop the siblings early.
                    cancel.cancel();
                }
                result
            }));
        }

        for result in futures::future::join_all(handles).await {
            match result {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(err)) => errors.push(err),
                Err(join_err) => {
                    errors.push(WeirError::internal(format!("fetch task panicked: {join_err}")))
                }
            }
        }

        if !errors.is_empty() {
            break;
        }
    }

    watchdog.abort();

    if errors.is_empty() {
        outcomes.sort_by_key(|o| o.node_index);
        return Ok(outcomes);
    }
    Err(aggregate_errors(errors))
}

/// Error aggregation policy: every node is required, so any fatal error
/// fails the query. When every failure shares a kind (e.g. all throttled),
/// surface that kind with the largest backoff hint; otherwise prefer the
/// error that caused the cancellation over errors that merely observed it.
fn aggregate_errors(mut errors: Vec<WeirError>) -> WeirError {
    let Some(first_code) = errors.first().map(|e| e.code) else {
        return WeirError::internal("fetch failed without a recorded error");
    };

    if errors.iter().all(|e| e.code == first_code) {
        let best_hint = errors.iter().filter_map(|e| e.retry_after_ms).max();
        let mut representative = errors.swap_remove(0);
        if let Some(hint) = best_hint {
            representative.retry_after_ms = Some(hint);
        }
        return representative;
    }

    if let Some(primary) = errors.iter().find(|e| e.message != CANCELLED_MSG) {
        return primary.clone();
    }
    errors.swap_remove(0)
}

struct NodeTask {
    node: FetchNode,
    node_index: usize,
    source: SourceDescriptor,
    table: TableDescriptor,
    connector: Arc<dyn Connector>,
    rules: RuleSet,
    env: FetchEnv,
    principal: Principal,
    max_staleness_ms: u64,
    deadline: Instant,
    cancel: CancellationToken,
}

impl NodeTask {
    async fn run(self) -> Result<NodeOutcome> {
        let started = Instant::now();
        let key = CacheKey::new(
            &self.principal.tenant_id,
            &self.node.source,
            &self.node.table,
            &self.node.pushed_filters,
        );
        let fetch_projection = self.fetch_projection();

        if self.max_staleness_ms > 0 {
            // Fresh-enough cache entry wins outright.
            if let Some((cached, age)) = self.env.cache.lookup(&key, self.max_staleness_ms) {
                if self.covers(&cached, &fetch_projection) {
                    return self.finish(cached, true, age, false, started);
                }
            }

            // Single-flight: one upstream fetch per key; followers land
            // here after the leader and re-check the cache first.
            let _guard = self.env.cache.flight_guard(&key).await;
            if let Some((cached, age)) = self.env.cache.lookup(&key, self.max_staleness_ms) {
                if self.covers(&cached, &fetch_projection) {
                    return self.finish(cached, true, age, false, started);
                }
            }

            match self.admit_and_fetch(&fetch_projection).await {
                Ok(rowset) => {
                    self.env
                        .cache
                        .insert(&key, rowset.clone(), self.source.hard_staleness_cap_ms);
                    self.finish(Arc::new(rowset), false, 0, false, started)
                }
                Err(err) if err.code.allows_stale_fallback() => {
                    // Transient upstream failure: serve anything within the
                    // hard cap rather than failing, flagged STALE_DATA.
                    if let Some((cached, age)) = self.env.cache.lookup_any(&key) {
                        if self.covers(&cached, &fetch_projection) {
                            warn!(
                                target: "queries",
                                source = %self.node.source,
                                age_ms = age,
                                code = %err.code,
                                "upstream unavailable, serving stale cache entry"
                            );
                            return self.finish(cached, true, age, true, started);
                        }
                    }
                    Err(err)
                }
                Err(err) => Err(err),
            }
        } else {
            // Live-only: no cache read, not even as fallback. Write-back
            // still happens so later bounded-staleness callers benefit.
            let rowset = self.admit_and_fetch(&fetch_projection).await?;
            self.env
                .cache
                .insert(&key, rowset.clone(), self.source.hard_staleness_cap_ms);
            self.finish(Arc::new(rowset), false, 0, false, started)
        }
    }

    /// Columns the connector must return: the query's projection plus every
    /// column the security rules read, so row rules never fail closed
    /// against a pruned fetch.
    fn fetch_projection(&self) -> Option<Vec<String>> {
        let mut columns = self.node.projected_columns.clone()?;
        for column in self.rules.referenced_columns() {
            if self.table.has_column(&column) && !columns.contains(&column) {
                columns.push(column);
            }
        }
        columns.sort();
        Some(columns)
    }

    /// Whether a cached rowset carries every column this fetch needs.
    /// Cache keys ignore projection, so an entry written by a narrower
    /// query must not satisfy a wider one.
    fn covers(&self, rowset: &Rowset, projection: &Option<Vec<String>>) -> bool {
        match projection {
            Some(columns) => columns
                .iter()
                .all(|c| rowset.schema.column_index(c).is_some()),
            None => self
                .table
                .columns
                .iter()
                .all(|c| rowset.schema.column_index(&c.name).is_some()),
        }
    }

    async fn admit_and_fetch(&self, projection: &Option<Vec<String>>) -> Result<Rowset> {
        if self.cancel.is_cancelled() {
            return Err(self.cancelled_error());
        }

        self.env
            .governor
            .admit(
                &self.node.source,
                &self.principal.tenant_id,
                self.source.rate_capacity,
                self.source.refill_per_second,
            )
            .map_err(|retry_after_ms| {
                WeirError::new(
                    ErrorCode::RateLimitExhausted,
                    format!("rate budget exhausted for '{}'", self.node.source),
                )
                .with_source(self.node.source.clone())
                .with_retry_after_ms(retry_after_ms)
            })?;

        // Admission may have waited on the bucket mutex; re-check before IO.
        if self.cancel.is_cancelled() {
            return Err(self.cancelled_error());
        }

        let budget = self.deadline.saturating_duration_since(Instant::now());
        if budget.is_zero() {
            return Err(self.timeout_error());
        }

        let connector_projection = if self.table.supports_projection {
            projection.as_deref()
        } else {
            None
        };
        let request = FetchRequest {
            table: &self.node.table,
            pushed_filters: &self.node.pushed_filters,
            projected_columns: connector_projection,
            deadline: budget,
        };

        let rowset = tokio::select! {
            _ = self.cancel.cancelled() => return Err(self.cancelled_error()),
            result = tokio::time::timeout(budget, self.connector.fetch(request)) => {
                match result {
                    Err(_elapsed) => return Err(self.timeout_error()),
                    Ok(fetched) => fetched?,
                }
            }
        };

        if rowset.len() > self.env.limits.max_rows_per_fetch {
            return Err(WeirError::new(
                ErrorCode::SourceError,
                format!(
                    "source '{}' returned {} rows, exceeding the {} row cap",
                    self.node.source,
                    rowset.len(),
                    self.env.limits.max_rows_per_fetch
                ),
            )
            .with_source(self.node.source.clone()));
        }

        debug!(
            target: "queries",
            source = %self.node.source,
            table = %self.node.table,
            rows = rowset.len(),
            pushed_filters = self.node.pushed_filters.len(),
            "fetched live rowset"
        );
        Ok(rowset)
    }

    fn cancelled_error(&self) -> WeirError {
        WeirError::new(ErrorCode::SourceTimeout, CANCELLED_MSG)
            .with_source(self.node.source.clone())
    }

    fn timeout_error(&self) -> WeirError {
        WeirError::new(
            ErrorCode::SourceTimeout,
            format!("source '{}' exceeded the query deadline", self.node.source),
        )
        .with_source(self.node.source.clone())
    }

    /// Security filter, then narrow the runtime's view to the query's own
    /// projection (security columns fetched on the side drop out here).
    fn finish(
        &self,
        rowset: Arc<Rowset>,
        from_cache: bool,
        freshness_ms: u64,
        stale: bool,
        started: Instant,
    ) -> Result<NodeOutcome> {
        let fetch_ms = started.elapsed().as_millis() as u64;
        let security_started = Instant::now();

        let raw_rows = rowset.len();
        let mut secured = security::apply(&rowset, &self.principal, &self.rules);
        if let Some(projection) = &self.node.projected_columns {
            secured = secured.project(projection);
        }
        let security_ms = security_started.elapsed().as_millis() as u64;

        Ok(NodeOutcome {
            node_index: self.node_index,
            source: self.node.source.clone(),
            view_name: self.node.view_name.clone(),
            rowset: secured,
            raw_rows,
            from_cache,
            freshness_ms,
            stale,
            fetch_ms,
            security_ms,
        })
    }
}
