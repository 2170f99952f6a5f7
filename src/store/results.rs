use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use super::marker::Marker;
use crate::error::Result;
use crate::state_machine::Phase;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleResult {
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Marker> for ModuleResult {
    fn from(marker: Marker) -> Self {
        Self {
            module: marker.module,
            data: marker.data,
            options: marker.options,
            error: marker.error,
        }
    }
}

/// Aggregated outcome of one phase of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResults {
    pub organization_id: String,
    pub checklist_id: String,
    pub created_at: i64,
    pub phase: Phase,
    pub modules: Vec<ModuleResult>,
}

impl PhaseResults {
    pub fn errors(&self) -> impl Iterator<Item = (&str, &str)> {
        self.modules
            .iter()
            .filter_map(|m| m.error.as_deref().map(|e| (m.module.as_str(), e)))
    }
}

/// Persists collected phase results. Saving the same phase twice replaces it.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save(&self, results: &PhaseResults) -> Result<()>;
}

type ResultKey = (String, i64, Phase);

#[derive(Debug, Default)]
pub struct MemoryResultStore {
    results: RwLock<HashMap<ResultKey, PhaseResults>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, organization_id: &str, created_at: i64, phase: Phase) -> Option<PhaseResults> {
        self.results
            .read()
            .await
            .get(&(organization_id.to_string(), created_at, phase))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn save(&self, results: &PhaseResults) -> Result<()> {
        let key = (
            results.organization_id.clone(),
            results.created_at,
            results.phase,
        );
        self.results.write().await.insert(key, results.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn results(modules: Vec<ModuleResult>) -> PhaseResults {
        PhaseResults {
            organization_id: "org".into(),
            checklist_id: "chk".into(),
            created_at: 10,
            phase: Phase::Recommendation,
            modules,
        }
    }

    #[test]
    fn module_result_from_marker() {
        let marker = Marker::completed("rightsizing", Some(json!([1, 2])), Some(json!({"x": 1})));
        let result = ModuleResult::from(marker);
        assert_eq!(result.module, "rightsizing");
        assert_eq!(result.data, Some(json!([1, 2])));
        assert!(result.error.is_none());
    }

    #[test]
    fn errors_lists_failed_modules() {
        let r = results(vec![
            ModuleResult::from(Marker::completed("a", None, None)),
            ModuleResult::from(Marker::failed("b", "quota exceeded")),
        ]);
        assert_eq!(r.errors().collect::<Vec<_>>(), vec![("b", "quota exceeded")]);
    }

    #[tokio::test]
    async fn saving_twice_replaces() {
        let store = MemoryResultStore::new();
        store.save(&results(vec![])).await.unwrap();
        store
            .save(&results(vec![ModuleResult::from(Marker::completed("a", None, None))]))
            .await
            .unwrap();
        assert_eq!(store.len().await, 1);
        let saved = store.get("org", 10, Phase::Recommendation).await.unwrap();
        assert_eq!(saved.modules.len(), 1);
    }
}
