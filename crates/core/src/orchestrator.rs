//! Query orchestration: analyzer -> planner -> executor -> analytical
//! runtime -> response shaping.
//!
//! One [`Gateway`] instance owns the process-wide cache, governor and
//! connector registry; everything else is created per query and torn down
//! before the response is built.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::{CacheStats, FreshnessCache};
use crate::executor::{self, FetchEnv, NodeOutcome, QueryContext};
use crate::governor::{RateGovernor, RateLimitStatus};
use crate::policy::PolicySet;
use crate::runtime::AnalyticalSession;
use weir_common::config::{CacheSettings, QueryLimits};
use weir_common::model::Catalog;
use weir_common::principal::Principal;
use weir_connectors::ConnectorRegistry;
use weir_error::{ErrorCode, Result, WeirError};
use weir_sql::{analyze, build_plan};

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default)]
    pub metadata: QueryMetadata,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct QueryMetadata {
    /// 0 bypasses the cache entirely.
    #[serde(default)]
    pub max_staleness_ms: u64,
    /// Query deadline; the configured default applies when absent.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    /// Correlation ID, echoed back; generated when absent.
    #[serde(default)]
    pub trace_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Timing {
    pub total_ms: u64,
    pub planning_ms: u64,
    pub fetch_ms: u64,
    pub security_ms: u64,
    pub analytical_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct SourceTiming {
    pub fetch_ms: u64,
    pub from_cache: bool,
    pub rows: usize,
    pub stale: bool,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub rows: Vec<Map<String, Value>>,
    /// Final schema, after column-level BLOCK rules.
    pub columns: Vec<String>,
    /// Max age across the sources used.
    pub freshness_ms: u64,
    /// True iff every source was served from cache.
    pub from_cache: bool,
    pub rate_limit_status: BTreeMap<String, RateLimitStatus>,
    pub timing: Timing,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub per_source: BTreeMap<String, SourceTiming>,
    pub trace_id: String,
}

pub struct Gateway {
    env: FetchEnv,
    catalog: Catalog,
}

impl Gateway {
    pub fn new(
        connectors: ConnectorRegistry,
        limits: QueryLimits,
        cache_settings: CacheSettings,
    ) -> Self {
        let catalog = connectors.catalog();
        Self {
            env: FetchEnv {
                cache: Arc::new(FreshnessCache::new(cache_settings.soft_cap_per_tenant)),
                governor: Arc::new(RateGovernor::new()),
                connectors,
                limits,
            },
            catalog,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn cache(&self) -> &Arc<FreshnessCache> {
        &self.env.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.env.cache.stats()
    }

    /// Execute one federated query as `principal` under `policies`.
    pub async fn execute(
        &self,
        request: QueryRequest,
        principal: Principal,
        policies: &PolicySet,
    ) -> Result<QueryResponse> {
        let trace_id = request
            .metadata
            .trace_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        self.execute_inner(request, principal, policies, &trace_id)
            .await
            .map_err(|e| e.with_trace_id(trace_id.clone()))
    }

    async fn execute_inner(
        &self,
        request: QueryRequest,
        principal: Principal,
        policies: &PolicySet,
        trace_id: &str,
    ) -> Result<QueryResponse> {
        let started = Instant::now();
        let deadline_ms = request
            .metadata
            .deadline_ms
            .unwrap_or(self.env.limits.default_deadline_ms);

        // 1. Analyze + plan
        let analyzed = analyze(&request.sql, &self.catalog)?;
        let plan = build_plan(&analyzed, &self.catalog)?;
        self.check_blocked_projections(&analyzed, policies)?;
        let planning_ms = started.elapsed().as_millis() as u64;

        // 2. Parallel fetch (cache -> governor -> connector -> security)
        let fetch_started = Instant::now();
        let ctx = QueryContext {
            principal: principal.clone(),
            policies: policies.clone(),
            max_staleness_ms: request.metadata.max_staleness_ms,
            deadline: started + Duration::from_millis(deadline_ms),
            cancel: CancellationToken::new(),
        };
        let outcomes = executor::run_plan(&self.env, &plan, &self.catalog, &ctx).await?;
        let fetch_ms = fetch_started.elapsed().as_millis() as u64;

        // A required source whose rows were all filtered away starves any
        // multi-source join; surfacing that beats silently returning an
        // empty join the caller cannot distinguish from "no data".
        if plan.nodes.len() > 1 {
            if let Some(starved) = outcomes
                .iter()
                .find(|o| o.raw_rows > 0 && o.rowset.is_empty())
            {
                return Err(WeirError::new(
                    ErrorCode::EntitlementDenied,
                    format!(
                        "row security removed every '{}' row required by this query",
                        starved.source
                    ),
                )
                .with_source(starved.source.clone()));
            }
        }

        // 3. Ephemeral analytical session
        let analytical_started = Instant::now();
        let session = AnalyticalSession::new();
        for outcome in &outcomes {
            session.register(&outcome.view_name, &outcome.rowset)?;
        }
        let (columns, rows) = session.run(&plan.rewritten_sql).await?;
        drop(session);
        let analytical_ms = analytical_started.elapsed().as_millis() as u64;

        // 4. Response shaping
        let response = self.shape_response(
            &principal, &outcomes, columns, rows, started, planning_ms, fetch_ms, analytical_ms,
            trace_id,
        );

        info!(
            target: "queries",
            tenant = %principal.tenant_id,
            user_id = %principal.user_id,
            trace_id = %trace_id,
            sources = outcomes.len(),
            rows_returned = response.rows.len(),
            from_cache = response.from_cache,
            duration_ms = response.timing.total_ms,
            "query complete"
        );
        Ok(response)
    }

    /// A query that names a BLOCKed column cannot be answered; `SELECT *`
    /// simply omits blocked columns instead (block = absence).
    fn check_blocked_projections(
        &self,
        analyzed: &weir_sql::AnalyzedQuery,
        policies: &PolicySet,
    ) -> Result<()> {
        for (idx, binding) in analyzed.bindings.iter().enumerate() {
            let Some(rules) = policies.get(&binding.source) else {
                continue;
            };
            if let Some(columns) = analyzed.referenced_columns.get(&idx) {
                if let Some(blocked) = columns.iter().find(|c| rules.blocks(c)) {
                    return Err(WeirError::new(
                        ErrorCode::EntitlementDenied,
                        format!(
                            "column '{}.{}' is blocked for this principal",
                            binding.qualifier, blocked
                        ),
                    )
                    .with_source(binding.source.clone()));
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn shape_response(
        &self,
        principal: &Principal,
        outcomes: &[NodeOutcome],
        columns: Vec<String>,
        rows: Vec<Map<String, Value>>,
        started: Instant,
        planning_ms: u64,
        fetch_ms: u64,
        analytical_ms: u64,
        trace_id: &str,
    ) -> QueryResponse {
        let freshness_ms = outcomes.iter().map(|o| o.freshness_ms).max().unwrap_or(0);
        let from_cache = !outcomes.is_empty() && outcomes.iter().all(|o| o.from_cache);
        let security_ms = outcomes.iter().map(|o| o.security_ms).sum();

        let mut warnings = Vec::new();
        if outcomes.iter().any(|o| o.stale) {
            warnings.push(ErrorCode::StaleData.as_str().to_string());
        }

        let mut rate_limit_status = BTreeMap::new();
        let mut per_source = BTreeMap::new();
        for outcome in outcomes {
            let capacity = self
                .catalog
                .source(&outcome.source)
                .map(|s| s.rate_capacity)
                .unwrap_or(0);
            rate_limit_status.insert(
                outcome.source.clone(),
                self.env
                    .governor
                    .status(&outcome.source, &principal.tenant_id, capacity),
            );
            per_source.insert(
                outcome.source.clone(),
                SourceTiming {
                    fetch_ms: outcome.fetch_ms,
                    from_cache: outcome.from_cache,
                    rows: outcome.rowset.len(),
                    stale: outcome.stale,
                },
            );
        }

        QueryResponse {
            rows,
            columns,
            freshness_ms,
            from_cache,
            rate_limit_status,
            timing: Timing {
                total_ms: started.elapsed().as_millis() as u64,
                planning_ms,
                fetch_ms,
                security_ms,
                analytical_ms,
            },
            warnings,
            per_source,
            trace_id: trace_id.to_string(),
        }
    }
}
