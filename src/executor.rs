//! Module executors and the catalog of modules per phase.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::ModuleLists;
use crate::error::Result;
use crate::state_machine::Phase;

/// What a module run produced. Application errors are reported here, never raised.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleOutput {
    pub data: Option<Value>,
    pub options: Option<Value>,
    pub error: Option<String>,
}

impl ModuleOutput {
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Runs one named unit of work.
#[async_trait]
pub trait ModuleExecutor: Send + Sync {
    async fn execute(
        &self,
        module: &str,
        phase: Phase,
        organization_id: &str,
        run_timestamp: i64,
    ) -> ModuleOutput;

    /// Releases whatever the module run left behind. Called from the child's
    /// graceful terminal step.
    async fn cleanup(
        &self,
        _module: &str,
        _phase: Phase,
        _organization_id: &str,
        _run_timestamp: i64,
    ) -> Result<()> {
        Ok(())
    }
}

/// Lists the modules to fan out for a phase.
#[async_trait]
pub trait ModuleCatalog: Send + Sync {
    async fn modules(&self, organization_id: &str, phase: Phase) -> Result<Vec<String>>;
}

#[async_trait]
impl ModuleCatalog for ModuleLists {
    async fn modules(&self, _organization_id: &str, phase: Phase) -> Result<Vec<String>> {
        Ok(self.for_phase(phase).to_vec())
    }
}

/// Drops empty and repeated names, keeping first-seen order. Every name becomes
/// exactly one child and one marker, so duplicates would hold the barrier shut.
pub fn distinct_modules(names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty() && seen.insert(n.clone()))
        .collect()
}

/// Stand-in executor used by the demo: sleeps, then reports a canned result.
#[derive(Debug, Clone, Default)]
pub struct SimulatedExecutor {
    pub latency: Duration,
    /// Modules that report an application error.
    pub failing: HashSet<String>,
}

impl SimulatedExecutor {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            failing: HashSet::new(),
        }
    }

    pub fn failing(mut self, module: impl Into<String>) -> Self {
        self.failing.insert(module.into());
        self
    }
}

#[async_trait]
impl ModuleExecutor for SimulatedExecutor {
    async fn execute(
        &self,
        module: &str,
        phase: Phase,
        organization_id: &str,
        run_timestamp: i64,
    ) -> ModuleOutput {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.failing.contains(module) {
            return ModuleOutput::error(format!("{module} is not available for {organization_id}"));
        }
        ModuleOutput {
            data: Some(json!({
                "module": module,
                "phase": phase,
                "run": run_timestamp,
                "items": module.len() % 5,
            })),
            options: Some(json!({ "organization_id": organization_id })),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_modules_keeps_order() {
        let names = vec![
            "b".to_string(),
            "a".to_string(),
            " b ".to_string(),
            "".to_string(),
            "c".to_string(),
        ];
        assert_eq!(distinct_modules(names), ["b", "a", "c"]);
    }

    #[tokio::test]
    async fn static_catalog_by_phase() {
        let lists = ModuleLists {
            recommendation: vec!["rightsizing".into()],
            archive: vec![],
            service: vec!["budget_sync".into(), "tagging".into()],
        };
        assert_eq!(
            lists.modules("org", Phase::Recommendation).await.unwrap(),
            ["rightsizing"]
        );
        assert!(lists.modules("org", Phase::Archive).await.unwrap().is_empty());
        assert_eq!(lists.modules("org", Phase::Service).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn simulated_executor_reports_configured_failures() {
        let executor = SimulatedExecutor::default().failing("broken");
        let ok = executor.execute("fine", Phase::Service, "org", 1).await;
        assert!(ok.error.is_none());
        assert_eq!(ok.data.unwrap()["module"], "fine");

        let failed = executor.execute("broken", Phase::Service, "org", 1).await;
        assert_eq!(failed.error.as_deref(), Some("broken is not available for org"));
        assert!(executor.cleanup("broken", Phase::Service, "org", 1).await.is_ok());
    }
}
