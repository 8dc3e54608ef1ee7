//! Row- and column-level security enforcement.
//!
//! Applied strictly after fetch and strictly before a rowset reaches the
//! analytical runtime. Row rules run first and are fail-closed: a row whose
//! referenced column is missing is dropped. Column rules then transform the
//! survivors; `Block` removes the column from the schema entirely.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use weir_common::model::{op_matches, PredicateOp, Rowset, RowsetSchema};
use weir_common::principal::Principal;

#[derive(Debug, Clone, Deserialize)]
pub struct RowRule {
    pub column: String,
    pub op: PredicateOp,
    #[serde(flatten)]
    pub value: RuleValueSpec,
}

/// Serde-friendly rule RHS: exactly one of `value` / `principal_attr`.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleValueSpec {
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub principal_attr: Option<String>,
}

impl RowRule {
    fn resolve_rhs(&self, principal: &Principal) -> Option<Value> {
        if let Some(literal) = &self.value.value {
            return Some(literal.clone());
        }
        let attr = self.value.principal_attr.as_deref()?;
        principal
            .attribute(attr)
            .map(|v| Value::String(v.to_string()))
    }

    /// A row passes iff the rule evaluates true; anything unresolvable
    /// evaluates false.
    fn keeps(&self, rowset: &Rowset, row: &[Value], principal: &Principal) -> bool {
        let Some(idx) = rowset.schema.column_index(&self.column) else {
            return false;
        };
        let Some(rhs) = self.resolve_rhs(principal) else {
            return false;
        };
        op_matches(self.op, &row[idx], &rhs)
    }
}

/// Column transform actions.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnAction {
    /// Replace with a short hex prefix of SHA-256 plus a literal suffix.
    Hash { prefix_len: usize, suffix: String },
    /// Replace values with a fixed sentinel.
    Redact,
    /// Remove the column from the rowset schema entirely.
    Block,
}

pub const REDACTED_SENTINEL: &str = "[REDACTED]";

/// The resolved rule set for one source, as handed to the filter.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub row_rules: Vec<RowRule>,
    pub column_rules: BTreeMap<String, ColumnAction>,
}

impl RuleSet {
    pub fn is_empty(&self) -> bool {
        self.row_rules.is_empty() && self.column_rules.is_empty()
    }

    /// Columns the rules read or transform. Fetches must include these even
    /// when the query itself does not project them, or row rules would fail
    /// closed against pruned rows.
    pub fn referenced_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = self
            .row_rules
            .iter()
            .map(|r| r.column.clone())
            .chain(self.column_rules.keys().cloned())
            .collect();
        columns.sort();
        columns.dedup();
        columns
    }

    pub fn blocks(&self, column: &str) -> bool {
        matches!(self.column_rules.get(column), Some(ColumnAction::Block))
    }
}

/// Apply row rules then column rules to one rowset.
pub fn apply(rowset: &Rowset, principal: &Principal, rules: &RuleSet) -> Rowset {
    if rules.is_empty() {
        return rowset.clone();
    }

    // Row rules: a row is kept iff every rule evaluates true.
    let kept: Vec<Vec<Value>> = rowset
        .rows
        .iter()
        .filter(|row| {
            rules
                .row_rules
                .iter()
                .all(|rule| rule.keeps(rowset, row, principal))
        })
        .cloned()
        .collect();

    // Column rules: masks in place, blocks by schema surgery.
    let mut keep_indices = Vec::new();
    let mut columns = Vec::new();
    for (idx, col) in rowset.schema.columns.iter().enumerate() {
        if rules.blocks(&col.name) {
            continue;
        }
        keep_indices.push(idx);
        columns.push(col.clone());
    }

    let transformed: Vec<Vec<Value>> = kept
        .into_iter()
        .map(|row| {
            keep_indices
                .iter()
                .map(|&idx| {
                    let name = &rowset.schema.columns[idx].name;
                    match rules.column_rules.get(name) {
                        Some(ColumnAction::Hash { prefix_len, suffix }) => {
                            mask_hash(&row[idx], *prefix_len, suffix)
                        }
                        Some(ColumnAction::Redact) => match &row[idx] {
                            Value::Null => Value::Null,
                            _ => Value::String(REDACTED_SENTINEL.to_string()),
                        },
                        _ => row[idx].clone(),
                    }
                })
                .collect()
        })
        .collect();

    Rowset {
        schema: RowsetSchema::new(columns),
        rows: transformed,
        age_ms: rowset.age_ms,
    }
}

/// SHA-256 prefix masking. NULL stays NULL: masking never fabricates a
/// value.
fn mask_hash(value: &Value, prefix_len: usize, suffix: &str) -> Value {
    let text = match value {
        Value::Null => return Value::Null,
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let digest = format!("{:x}", Sha256::digest(text.as_bytes()));
    let prefix_len = prefix_len.min(digest.len());
    Value::String(format!("{}{}", &digest[..prefix_len], suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weir_common::model::{ColumnDef, SemanticType};

    fn principal(team: &str, capabilities: &[&str]) -> Principal {
        Principal {
            user_id: "u1".into(),
            tenant_id: "acme".into(),
            role: "developer".into(),
            team_id: team.into(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn rowset() -> Rowset {
        let schema = RowsetSchema::new(vec![
            ColumnDef::new("pr_id", SemanticType::Int),
            ColumnDef::new("team_id", SemanticType::Text),
            ColumnDef::new("author_email", SemanticType::Text),
        ]);
        Rowset::new(
            schema,
            vec![
                vec![json!(1), json!("mobile"), json!("alice@acme.com")],
                vec![json!(2), json!("web"), json!("bob@acme.com")],
                vec![json!(3), json!("mobile"), json!("carol@acme.com")],
            ],
        )
    }

    fn team_rule() -> RowRule {
        RowRule {
            column: "team_id".into(),
            op: PredicateOp::Eq,
            value: RuleValueSpec {
                value: None,
                principal_attr: Some("team_id".into()),
            },
        }
    }

    #[test]
    fn row_rule_keeps_only_matching_team() {
        let rules = RuleSet {
            row_rules: vec![team_rule()],
            column_rules: BTreeMap::new(),
        };
        let out = apply(&rowset(), &principal("mobile", &[]), &rules);
        assert_eq!(out.len(), 2);
        for row in 0..out.len() {
            assert_eq!(out.cell(row, "team_id"), Some(&json!("mobile")));
        }
    }

    #[test]
    fn missing_column_fails_closed() {
        let rules = RuleSet {
            row_rules: vec![RowRule {
                column: "clearance".into(),
                op: PredicateOp::Eq,
                value: RuleValueSpec {
                    value: Some(json!("high")),
                    principal_attr: None,
                },
            }],
            column_rules: BTreeMap::new(),
        };
        let out = apply(&rowset(), &principal("mobile", &[]), &rules);
        assert!(out.is_empty());
    }

    #[test]
    fn unknown_principal_attribute_fails_closed() {
        let rules = RuleSet {
            row_rules: vec![RowRule {
                column: "team_id".into(),
                op: PredicateOp::Eq,
                value: RuleValueSpec {
                    value: None,
                    principal_attr: Some("nonexistent".into()),
                },
            }],
            column_rules: BTreeMap::new(),
        };
        let out = apply(&rowset(), &principal("mobile", &[]), &rules);
        assert!(out.is_empty());
    }

    #[test]
    fn hash_masks_with_prefix_and_suffix() {
        let mut column_rules = BTreeMap::new();
        column_rules.insert(
            "author_email".to_string(),
            ColumnAction::Hash {
                prefix_len: 8,
                suffix: "****@ema.co".into(),
            },
        );
        let rules = RuleSet {
            row_rules: vec![],
            column_rules,
        };
        let out = apply(&rowset(), &principal("mobile", &[]), &rules);

        let masked = out.cell(0, "author_email").unwrap().as_str().unwrap();
        assert!(masked.ends_with("****@ema.co"));
        let prefix = &masked[..8];
        assert_eq!(prefix.len(), 8);
        assert!(prefix.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!masked.contains("alice"));

        // Deterministic: masking twice yields the same value.
        let again = apply(&rowset(), &principal("mobile", &[]), &rules);
        assert_eq!(out.cell(0, "author_email"), again.cell(0, "author_email"));
    }

    #[test]
    fn hash_of_null_stays_null() {
        let schema = RowsetSchema::new(vec![ColumnDef::new("email", SemanticType::Text)]);
        let rowset = Rowset::new(schema, vec![vec![Value::Null]]);
        let mut column_rules = BTreeMap::new();
        column_rules.insert(
            "email".to_string(),
            ColumnAction::Hash {
                prefix_len: 8,
                suffix: "****".into(),
            },
        );
        let rules = RuleSet {
            row_rules: vec![],
            column_rules,
        };
        let out = apply(&rowset, &principal("mobile", &[]), &rules);
        assert_eq!(out.cell(0, "email"), Some(&Value::Null));
    }

    #[test]
    fn block_removes_the_column_entirely() {
        let mut column_rules = BTreeMap::new();
        column_rules.insert("author_email".to_string(), ColumnAction::Block);
        let rules = RuleSet {
            row_rules: vec![],
            column_rules,
        };
        let out = apply(&rowset(), &principal("mobile", &[]), &rules);
        assert_eq!(out.schema.column_names(), vec!["pr_id", "team_id"]);
        assert_eq!(out.rows[0].len(), 2);
    }

    #[test]
    fn redact_replaces_values_with_sentinel() {
        let mut column_rules = BTreeMap::new();
        column_rules.insert("author_email".to_string(), ColumnAction::Redact);
        let rules = RuleSet {
            row_rules: vec![],
            column_rules,
        };
        let out = apply(&rowset(), &principal("mobile", &[]), &rules);
        assert_eq!(out.cell(0, "author_email"), Some(&json!(REDACTED_SENTINEL)));
    }

    #[test]
    fn row_rules_run_before_column_rules() {
        let mut column_rules = BTreeMap::new();
        column_rules.insert("team_id".to_string(), ColumnAction::Block);
        let rules = RuleSet {
            row_rules: vec![team_rule()],
            column_rules,
        };
        // team_id is both the row filter and blocked: the filter still sees
        // it, the output does not.
        let out = apply(&rowset(), &principal("web", &[]), &rules);
        assert_eq!(out.len(), 1);
        assert!(out.schema.column_index("team_id").is_none());
    }

    #[test]
    fn referenced_columns_cover_rules() {
        let mut column_rules = BTreeMap::new();
        column_rules.insert("author_email".to_string(), ColumnAction::Redact);
        let rules = RuleSet {
            row_rules: vec![team_rule()],
            column_rules,
        };
        assert_eq!(
            rules.referenced_columns(),
            vec!["author_email".to_string(), "team_id".to_string()]
        );
    }
}
