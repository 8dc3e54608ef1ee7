//! Tenant policy files and per-query resolution.
//!
//! A tenant's policy YAML declares row and column rules per source, with
//! optional guards (`unless_capability`, `when_role`). Guards are evaluated
//! once against the principal at query start, producing the flat [`RuleSet`]
//! the security filter consumes; nothing is re-resolved mid-query.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::security::{ColumnAction, RowRule, RuleSet};
use weir_common::principal::Principal;
use weir_error::{Result, WeirError};

/// The resolved rule sets a single query runs under: source -> rules.
pub type PolicySet = BTreeMap<String, RuleSet>;

#[derive(Debug, Clone, Deserialize)]
pub struct TenantPolicyFile {
    pub tenant_id: String,
    #[serde(default)]
    pub sources: BTreeMap<String, SourcePolicy>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SourcePolicy {
    #[serde(default)]
    pub row_rules: Vec<RowRule>,
    #[serde(default)]
    pub column_rules: Vec<ColumnRuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnRuleConfig {
    pub column: String,
    pub action: ColumnAction,
    /// Skip this rule for principals holding the capability.
    #[serde(default)]
    pub unless_capability: Option<String>,
    /// Apply this rule only to principals with the given role.
    #[serde(default)]
    pub when_role: Option<String>,
}

impl ColumnRuleConfig {
    fn applies_to(&self, principal: &Principal) -> bool {
        if let Some(capability) = &self.unless_capability {
            if principal.has_capability(capability) {
                return false;
            }
        }
        if let Some(role) = &self.when_role {
            if &principal.role != role {
                return false;
            }
        }
        true
    }
}

impl TenantPolicyFile {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| WeirError::internal(format!("invalid tenant policy: {e}")))
    }

    /// Resolve guards against the principal, producing the flat per-source
    /// rule sets for one query.
    pub fn resolve(&self, principal: &Principal) -> PolicySet {
        let mut resolved = PolicySet::new();
        for (source, policy) in &self.sources {
            let mut column_rules = BTreeMap::new();
            for rule in &policy.column_rules {
                if rule.applies_to(principal) {
                    column_rules.insert(rule.column.clone(), rule.action.clone());
                }
            }
            resolved.insert(
                source.clone(),
                RuleSet {
                    row_rules: policy.row_rules.clone(),
                    column_rules,
                },
            );
        }
        resolved
    }
}

/// All tenant policies known to this instance, loaded at startup.
#[derive(Debug, Default)]
pub struct PolicyStore {
    tenants: BTreeMap<String, TenantPolicyFile>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, policy: TenantPolicyFile) {
        self.tenants.insert(policy.tenant_id.clone(), policy);
    }

    /// Load every `*.yaml` in a directory; one file per tenant.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut store = Self::new();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| WeirError::internal(format!("cannot read policy dir {dir:?}: {e}")))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| WeirError::internal(format!("cannot read policy dir: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("yaml") {
                continue;
            }
            let yaml = std::fs::read_to_string(&path)
                .map_err(|e| WeirError::internal(format!("cannot read {path:?}: {e}")))?;
            let policy = TenantPolicyFile::from_yaml(&yaml)?;
            info!(tenant = %policy.tenant_id, file = ?path, "loaded tenant policy");
            store.insert(policy);
        }
        Ok(store)
    }

    /// Resolve the rule sets for one query. Unknown tenants get an empty
    /// policy set: no rules were provisioned, nothing is restricted.
    pub fn resolve(&self, principal: &Principal) -> PolicySet {
        self.tenants
            .get(&principal.tenant_id)
            .map(|p| p.resolve(principal))
            .unwrap_or_default()
    }
}
