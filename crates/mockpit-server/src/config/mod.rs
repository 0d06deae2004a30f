//! Environment file loading and server options.
//!
//! This module provides:
//! - [`Environment::from_file`] for JSON and YAML environment files
//! - [`Environment::validate`] for structural checks before serving
//! - [`ServerOptions`], the per-instance settings that are not part of the environment

use crate::environment::{Environment, TlsKind};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;

/// Instance settings supplied by the embedding program or the CLI.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerOptions {
    /// Base directory for relative file paths; defaults to the current directory
    #[serde(default)]
    pub environment_directory: Option<PathBuf>,

    /// Route ids or path substrings excluded from the route table
    #[serde(default)]
    pub disabled_routes: Vec<String>,

    #[serde(default)]
    pub hostname_override: Option<String>,

    #[serde(default)]
    pub port_override: Option<u16>,

    /// Upper bound for callback invocation latency
    #[serde(default)]
    pub max_callback_latency_ms: Option<u64>,
}

impl ServerOptions {
    /// Options for an environment loaded from `path`: relative files resolve
    /// next to the environment file.
    pub fn for_environment_file(path: impl AsRef<Path>) -> Self {
        Self {
            environment_directory: path.as_ref().parent().map(Path::to_path_buf),
            ..Default::default()
        }
    }

    pub fn environment_directory(&self) -> PathBuf {
        match &self.environment_directory {
            Some(dir) if !dir.as_os_str().is_empty() => dir.clone(),
            _ => PathBuf::from("."),
        }
    }
}

impl Environment {
    /// Load an environment from a JSON or YAML file (chosen by extension),
    /// repair orphaned routes and folders, and validate it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read environment file {}", path.display()))?;

        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));
        let mut environment: Environment = if is_yaml {
            serde_yaml::from_str(&contents)
                .with_context(|| format!("Invalid YAML environment {}", path.display()))?
        } else {
            serde_json::from_str(&contents)
                .with_context(|| format!("Invalid JSON environment {}", path.display()))?
        };

        let repaired = environment.repair_orphans();
        if repaired > 0 {
            info!("Re-attached {} orphaned entities in {}", repaired, path.display());
        }
        environment.validate()?;
        Ok(environment)
    }

    /// Reject environments that cannot be served.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let mut seen = HashSet::new();
        for route in &self.routes {
            if !seen.insert(route.uuid.as_str()) {
                anyhow::bail!("Duplicate route uuid '{}'", route.uuid);
            }
        }

        let tls = &self.tls_options;
        if tls.enabled {
            let has_material = match tls.kind {
                TlsKind::Cert => !tls.cert_path.trim().is_empty() && !tls.key_path.trim().is_empty(),
                TlsKind::Pfx => !tls.pfx_path.trim().is_empty(),
            };
            if !has_material {
                anyhow::bail!(
                    "TLS is enabled but no certificate material is configured. \
                     Please provide 'tlsOptions.certPath' and 'tlsOptions.keyPath'"
                );
            }
        }
        Ok(())
    }
}
