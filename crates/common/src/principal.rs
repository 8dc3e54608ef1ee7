//! The resolved caller identity a query runs as.
//!
//! Authentication happens upstream; the core receives a [`Principal`] by
//! value and treats it as immutable for the life of the query.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Principal {
    pub user_id: String,
    pub tenant_id: String,
    pub role: String,
    pub team_id: String,
    /// Capability tags such as `pii_access`.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Principal {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Look up a principal attribute by name, as referenced from security
    /// rules (`principal.team_id` etc.). Unknown names resolve to `None`,
    /// which makes the referencing rule fail closed.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        match name {
            "user_id" => Some(&self.user_id),
            "tenant_id" => Some(&self.tenant_id),
            "role" => Some(&self.role),
            "team_id" => Some(&self.team_id),
            _ => None,
        }
    }
}
