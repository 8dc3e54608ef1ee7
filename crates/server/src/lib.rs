//! Weir server: the HTTP API layer.
//!
//! Exposes the query pipeline over REST: `POST /api/v1/query` with a bearer
//! token, plus health and cache-statistics endpoints. Connectors are loaded
//! from manifest YAML files, tenant policies from a policy directory, and
//! principals from a token table — all at startup.

pub mod api;
pub mod auth;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use weir_connectors::manifest::{ConnectorManifest, ManifestConnector};
use weir_connectors::ConnectorRegistry;

/// Load every `*.yaml` connector manifest in a directory into a registry.
pub fn load_connectors(dir: &Path) -> Result<ConnectorRegistry> {
    let mut registry = ConnectorRegistry::new();
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("cannot read manifest dir {dir:?}"))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("yaml") {
            continue;
        }
        let yaml = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read manifest {path:?}"))?;
        let manifest = ConnectorManifest::from_yaml(&yaml)
            .with_context(|| format!("invalid manifest {path:?}"))?;
        info!(source = %manifest.name, file = ?path, "registered connector");
        registry.register(Arc::new(ManifestConnector::new(manifest)));
    }
    Ok(registry)
}
