//! End-to-end pipeline scenarios: pushdown routing, residual evaluation,
//! cache behavior, rate limiting, stale fallback, security enforcement,
//! single-flight coalescing and cancellation.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use weir_common::config::{CacheSettings, QueryLimits};
use weir_common::principal::Principal;
use weir_connectors::manifest::{ConnectorManifest, ManifestConnector};
use weir_connectors::testing::FlakyConnector;
use weir_connectors::ConnectorRegistry;
use weir_core::policy::PolicySet;
use weir_core::{Gateway, QueryMetadata, QueryRequest, TenantPolicyFile};
use weir_error::ErrorCode;

const GITHUB_MANIFEST: &str = r#"
name: github
rate_limit: { capacity: 50, refill_per_second: 10.0 }
hard_staleness_cap_ms: 300000
tables:
  - name: pull_requests
    columns:
      - { name: pr_id, type: int }
      - { name: author, type: text }
      - { name: author_email, type: text }
      - { name: branch, type: text }
      - { name: status, type: text }
      - { name: team_id, type: text }
    pushable_filters: [status, team_id]
    fixtures:
      - { pr_id: 1, author: dev_a, author_email: "alice@acme.com", branch: PRJ-001, status: merged, team_id: mobile }
      - { pr_id: 2, author: dev_b, author_email: "bob@acme.com", branch: PRJ-002, status: open, team_id: web }
      - { pr_id: 3, author: dev_c, author_email: "carol@acme.com", branch: PRJ-003, status: merged, team_id: mobile }
      - { pr_id: 4, author: dev_d, author_email: "dave@acme.com", branch: PRJ-004, status: closed, team_id: web }
"#;

const JIRA_MANIFEST: &str = r#"
name: jira
rate_limit: { capacity: 30, refill_per_second: 5.0 }
hard_staleness_cap_ms: 300000
tables:
  - name: issues
    columns:
      - { name: issue_key, type: text }
      - { name: project, type: text }
      - { name: status, type: text }
      - { name: branch_name, type: text }
    pushable_filters: [status, project]
    fixtures:
      - { issue_key: PRJ-1, project: mobile, status: In Progress, branch_name: PRJ-001 }
      - { issue_key: PRJ-2, project: web, status: Done, branch_name: PRJ-002 }
      - { issue_key: PRJ-3, project: mobile, status: In Progress, branch_name: PRJ-003 }
"#;

const POLICY: &str = r#"
tenant_id: acme
sources:
  github:
    row_rules:
      - { column: team_id, op: eq, principal_attr: team_id }
    column_rules:
      - column: author_email
        action: !hash { prefix_len: 8, suffix: "****@ema.co" }
        unless_capability: pii_access
  jira:
    row_rules:
      - { column: project, op: eq, principal_attr: team_id }
"#;

struct Fixture {
    gateway: Arc<Gateway>,
    github: Arc<ManifestConnector>,
    jira: Arc<ManifestConnector>,
}

fn fixture_with(limits: QueryLimits, github_yaml: &str, jira_yaml: &str) -> Fixture {
    let github = Arc::new(ManifestConnector::new(
        ConnectorManifest::from_yaml(github_yaml).unwrap(),
    ));
    let jira = Arc::new(ManifestConnector::new(
        ConnectorManifest::from_yaml(jira_yaml).unwrap(),
    ));
    let mut registry = ConnectorRegistry::new();
    registry.register(github.clone());
    registry.register(jira.clone());
    Fixture {
        gateway: Arc::new(Gateway::new(registry, limits, CacheSettings::default())),
        github,
        jira,
    }
}

fn fixture() -> Fixture {
    fixture_with(QueryLimits::default(), GITHUB_MANIFEST, JIRA_MANIFEST)
}

fn developer(team: &str) -> Principal {
    Principal {
        user_id: "u1".into(),
        tenant_id: "acme".into(),
        role: "developer".into(),
        team_id: team.into(),
        capabilities: vec!["pii_access".into()],
    }
}

fn no_pii_developer() -> Principal {
    Principal {
        capabilities: vec![],
        ..developer("mobile")
    }
}

fn policies(principal: &Principal) -> PolicySet {
    TenantPolicyFile::from_yaml(POLICY).unwrap().resolve(principal)
}

fn request(sql: &str, max_staleness_ms: u64) -> QueryRequest {
    QueryRequest {
        sql: sql.into(),
        metadata: QueryMetadata {
            max_staleness_ms,
            deadline_ms: None,
            trace_id: Some("test-trace".into()),
        },
    }
}

#[tokio::test]
async fn pushdown_routes_to_the_naming_alias_only() {
    let f = fixture();
    let principal = developer("mobile");
    // If `status = 'merged'` were mis-pushed to jira (whose statuses are
    // 'In Progress' / 'Done'), jira would return zero rows and the join
    // would silently come back empty.
    let response = f
        .gateway
        .execute(
            request(
                "SELECT gh.pr_id, ji.issue_key FROM github.pull_requests gh \
                 JOIN jira.issues ji ON gh.branch = ji.branch_name \
                 WHERE gh.status = 'merged'",
                0,
            ),
            principal.clone(),
            &policies(&principal),
        )
        .await
        .unwrap();

    assert_eq!(response.rows.len(), 2);
    assert_eq!(response.columns, vec!["pr_id", "issue_key"]);
    assert_eq!(f.github.fetch_count(), 1);
    assert_eq!(f.jira.fetch_count(), 1);
    assert_eq!(response.trace_id, "test-trace");
}

#[tokio::test]
async fn residual_function_predicate_fetches_unfiltered() {
    let f = fixture();
    let principal = developer("mobile");
    let response = f
        .gateway
        .execute(
            request(
                "SELECT pr_id FROM github.pull_requests \
                 WHERE LOWER(status) LIKE '%merge%' ORDER BY pr_id",
                0,
            ),
            principal.clone(),
            &policies(&principal),
        )
        .await
        .unwrap();

    // Both mobile merged PRs survive; the LIKE ran locally.
    assert_eq!(response.rows.len(), 2);
    assert_eq!(response.rows[0]["pr_id"], json!(1));
    assert_eq!(f.github.fetch_count(), 1);
}

#[tokio::test]
async fn second_query_within_staleness_budget_hits_cache() {
    let f = fixture();
    let principal = developer("mobile");
    let sql = "SELECT pr_id FROM github.pull_requests WHERE status = 'merged'";

    let first = f
        .gateway
        .execute(request(sql, 5000), principal.clone(), &policies(&principal))
        .await
        .unwrap();
    assert!(!first.from_cache);
    assert_eq!(f.github.fetch_count(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = f
        .gateway
        .execute(request(sql, 5000), principal.clone(), &policies(&principal))
        .await
        .unwrap();
    assert!(second.from_cache);
    assert!(second.freshness_ms <= 2000);
    assert!(second.freshness_ms >= 50);
    // No extra connector call for the cached source.
    assert_eq!(f.github.fetch_count(), 1);
    assert_eq!(first.rows, second.rows);
}

#[tokio::test]
async fn live_only_queries_never_read_the_cache() {
    let f = fixture();
    let principal = developer("mobile");
    let sql = "SELECT pr_id FROM github.pull_requests";

    let first = f
        .gateway
        .execute(request(sql, 0), principal.clone(), &policies(&principal))
        .await
        .unwrap();
    let second = f
        .gateway
        .execute(request(sql, 0), principal.clone(), &policies(&principal))
        .await
        .unwrap();

    assert_eq!(first.columns, second.columns);
    assert_eq!(first.rows, second.rows);
    assert!(!second.from_cache);
    // Two live runs, two connector calls.
    assert_eq!(f.github.fetch_count(), 2);
}

#[tokio::test]
async fn exhausted_bucket_fails_live_queries_with_retry_hint() {
    let tight_github = GITHUB_MANIFEST.replace(
        "rate_limit: { capacity: 50, refill_per_second: 10.0 }",
        "rate_limit: { capacity: 1, refill_per_second: 0.1 }",
    );
    let f = fixture_with(QueryLimits::default(), &tight_github, JIRA_MANIFEST);
    let principal = developer("mobile");
    let sql = "SELECT pr_id FROM github.pull_requests";

    let first = f
        .gateway
        .execute(request(sql, 0), principal.clone(), &policies(&principal))
        .await;
    assert!(first.is_ok());

    for _ in 0..2 {
        let err = f
            .gateway
            .execute(request(sql, 0), principal.clone(), &policies(&principal))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RateLimitExhausted);
        let hint = err.retry_after_ms.unwrap();
        assert!(hint > 0 && hint <= 10_000);
        assert_eq!(err.source_name.as_deref(), Some("github"));
    }
    // Live-only contract: the bucket being empty never falls back to cache.
    assert_eq!(f.github.fetch_count(), 1);
}

#[tokio::test]
async fn throttled_refresh_serves_stale_entry_with_warning() {
    let github = Arc::new(ManifestConnector::new(
        ConnectorManifest::from_yaml(GITHUB_MANIFEST).unwrap(),
    ));
    let flaky = Arc::new(FlakyConnector::new(github, ErrorCode::RateLimitExhausted));
    let mut registry = ConnectorRegistry::new();
    registry.register(flaky.clone());
    let gateway = Gateway::new(registry, QueryLimits::default(), CacheSettings::default());

    let principal = developer("mobile");
    let sql = "SELECT pr_id FROM github.pull_requests";

    // Populate the cache.
    let first = gateway
        .execute(request(sql, 60_000), principal.clone(), &policies(&principal))
        .await
        .unwrap();
    assert!(!first.from_cache);

    tokio::time::sleep(Duration::from_millis(60)).await;
    flaky.fail_next(1);

    // Entry is now older than the 20ms budget; the refresh throttles; the
    // stale entry is served under the hard cap with a warning.
    let second = gateway
        .execute(request(sql, 20), principal.clone(), &policies(&principal))
        .await
        .unwrap();
    assert!(second.from_cache);
    assert!(second.freshness_ms >= 60);
    assert!(second.warnings.contains(&"STALE_DATA".to_string()));
    assert_eq!(first.rows, second.rows);
}

#[tokio::test]
async fn row_security_keeps_only_the_principals_team() {
    let f = fixture();
    let principal = developer("mobile");
    let response = f
        .gateway
        .execute(
            request("SELECT * FROM github.pull_requests", 0),
            principal.clone(),
            &policies(&principal),
        )
        .await
        .unwrap();

    // Fixture teams are {mobile, web, mobile, web}: exactly the two mobile
    // rows survive.
    assert_eq!(response.rows.len(), 2);
    for row in &response.rows {
        assert_eq!(row["team_id"], json!("mobile"));
    }

    let web = developer("web");
    let web_rows = f
        .gateway
        .execute(
            request("SELECT * FROM github.pull_requests", 0),
            web.clone(),
            &policies(&web),
        )
        .await
        .unwrap();
    assert_eq!(web_rows.rows.len(), 2);
    for row in &web_rows.rows {
        assert_eq!(row["team_id"], json!("web"));
    }
}

#[tokio::test]
async fn column_hash_masks_pii_deterministically() {
    let f = fixture();
    let principal = no_pii_developer();
    let sql = "SELECT pr_id, author_email FROM github.pull_requests \
               WHERE status = 'merged' ORDER BY pr_id";

    let first = f
        .gateway
        .execute(request(sql, 0), principal.clone(), &policies(&principal))
        .await
        .unwrap();
    let masked = first.rows[0]["author_email"].as_str().unwrap().to_string();
    assert!(masked.ends_with("****@ema.co"));
    assert_eq!(masked.len(), 8 + "****@ema.co".len());
    assert!(masked[..8].chars().all(|c| c.is_ascii_hexdigit()));
    assert!(!masked.contains("acme.com"));

    // Identical across queries: masking is a pure function of the value.
    let second = f
        .gateway
        .execute(request(sql, 0), principal.clone(), &policies(&principal))
        .await
        .unwrap();
    assert_eq!(second.rows[0]["author_email"].as_str().unwrap(), masked);

    // Holders of pii_access see the raw value.
    let trusted = developer("mobile");
    let raw = f
        .gateway
        .execute(request(sql, 0), trusted.clone(), &policies(&trusted))
        .await
        .unwrap();
    assert_eq!(raw.rows[0]["author_email"], json!("alice@acme.com"));
}

#[tokio::test]
async fn selecting_a_blocked_column_is_denied() {
    let blocking_policy = r#"
tenant_id: acme
sources:
  github:
    column_rules:
      - column: author_email
        action: block
"#;
    let f = fixture();
    let principal = developer("mobile");
    let policies = TenantPolicyFile::from_yaml(blocking_policy)
        .unwrap()
        .resolve(&principal);

    let err = f
        .gateway
        .execute(
            request("SELECT author_email FROM github.pull_requests", 0),
            principal.clone(),
            &policies,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::EntitlementDenied);

    // SELECT * simply omits the blocked column: block = absence.
    let response = f
        .gateway
        .execute(
            request("SELECT * FROM github.pull_requests", 0),
            principal,
            &policies,
        )
        .await
        .unwrap();
    assert!(!response.columns.contains(&"author_email".to_string()));
    assert!(response.columns.contains(&"author".to_string()));
}

#[tokio::test]
async fn security_starving_a_joined_source_is_denied() {
    let f = fixture();
    // No github rows belong to team 'data', so RLS empties a source the
    // join requires.
    let principal = developer("data");
    let err = f
        .gateway
        .execute(
            request(
                "SELECT gh.pr_id, ji.issue_key FROM github.pull_requests gh \
                 JOIN jira.issues ji ON gh.branch = ji.branch_name",
                0,
            ),
            principal.clone(),
            &policies(&principal),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::EntitlementDenied);
}

#[tokio::test]
async fn concurrent_identical_misses_coalesce_to_one_fetch() {
    let f = fixture();
    let principal = developer("mobile");
    let sql = "SELECT pr_id FROM github.pull_requests WHERE status = 'merged'";

    let mut handles = Vec::new();
    for _ in 0..8 {
        let gateway = f.gateway.clone();
        let principal = principal.clone();
        let policies = policies(&principal);
        let sql = sql.to_string();
        handles.push(tokio::spawn(async move {
            gateway
                .execute(request(&sql, 60_000), principal, &policies)
                .await
        }));
    }
    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.rows.len(), 2);
    }
    // Single-flight: the burst of identical misses produced one upstream
    // call.
    assert_eq!(f.github.fetch_count(), 1);
}

#[tokio::test]
async fn deadline_cancels_pending_fetches_before_they_start() {
    // Both sources are slower than the deadline; with one fetch slot, the
    // first task times out and cancels the query before the queued task
    // reaches its connector.
    let slow_github = format!("{}\nlatency_ms: 300", GITHUB_MANIFEST.trim_end());
    let slow_jira = format!("{}\nlatency_ms: 300", JIRA_MANIFEST.trim_end());
    let limits = QueryLimits {
        max_parallel_fetches: 1,
        ..QueryLimits::default()
    };
    let f = fixture_with(limits, &slow_github, &slow_jira);
    let principal = developer("mobile");

    let err = f
        .gateway
        .execute(
            QueryRequest {
                sql: "SELECT gh.pr_id, ji.issue_key FROM github.pull_requests gh \
                      JOIN jira.issues ji ON gh.branch = ji.branch_name"
                    .into(),
                metadata: QueryMetadata {
                    max_staleness_ms: 0,
                    deadline_ms: Some(100),
                    trace_id: None,
                },
            },
            principal.clone(),
            &policies(&principal),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::SourceTimeout);
    // Exactly one fetch ever started; the other task observed the
    // cancellation between admission and IO.
    assert_eq!(f.github.fetch_count() + f.jira.fetch_count(), 1);
}

#[tokio::test]
async fn rate_limit_status_and_per_source_metadata_are_reported() {
    let f = fixture();
    let principal = developer("mobile");
    let response = f
        .gateway
        .execute(
            request(
                "SELECT gh.pr_id, ji.issue_key FROM github.pull_requests gh \
                 JOIN jira.issues ji ON gh.branch = ji.branch_name",
                0,
            ),
            principal.clone(),
            &policies(&principal),
        )
        .await
        .unwrap();

    let github = &response.rate_limit_status["github"];
    assert_eq!(github.capacity, 50);
    assert!(github.remaining < 50);
    let jira = &response.rate_limit_status["jira"];
    assert_eq!(jira.capacity, 30);

    assert!(!response.per_source["github"].from_cache);
    assert_eq!(response.per_source["jira"].rows, 2);
    assert!(response.timing.total_ms >= response.timing.analytical_ms);
}

#[tokio::test]
async fn unknown_predicate_qualifier_fails_planning() {
    let f = fixture();
    let principal = developer("mobile");
    let err = f
        .gateway
        .execute(
            request(
                "SELECT gh.pr_id FROM github.pull_requests gh WHERE zz.status = 'merged'",
                0,
            ),
            principal.clone(),
            &policies(&principal),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PlanFailed);
    assert_eq!(err.trace_id.as_deref(), Some("test-trace"));
}
