//! Plan document loading
//!
//! A plan document is a core plan file plus a `[backend]` table describing
//! how to reach the cluster under test.

use std::path::Path;

use anyhow::Context;
use loadramp_core::plan::PlanFile;
use loadramp_core::LoadPlan;
use serde::{Deserialize, Serialize};

/// Connection settings for the backend under test
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Base URL, e.g. `https://search.internal:9200`
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Reject self-signed certificates
    #[serde(default = "default_true")]
    pub verify_tls: bool,

    /// Idle connections kept per host
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
}

fn default_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_idle_per_host() -> usize {
    64
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            url: default_url(),
            username: None,
            password: None,
            verify_tls: true,
            max_idle_per_host: default_max_idle_per_host(),
        }
    }
}

/// Full on-disk document
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanDocument {
    #[serde(default)]
    pub backend: BackendSettings,

    #[serde(flatten)]
    pub plan: PlanFile,
}

impl PlanDocument {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading plan {}", path.display()))?;
        let document: PlanDocument =
            toml::from_str(&content).with_context(|| format!("parsing plan {}", path.display()))?;
        Ok(document)
    }

    /// Apply command-line overrides and validate
    pub fn into_plan(mut self, duration_secs: Option<u64>, skip_warmup: bool) -> anyhow::Result<(LoadPlan, BackendSettings)> {
        if let Some(secs) = duration_secs {
            self.plan.duration_secs = secs;
        }
        if skip_warmup {
            self.plan.warmup.enabled = false;
        }
        let plan = self.plan.into_plan().context("invalid plan")?;
        Ok((plan, self.backend))
    }
}
