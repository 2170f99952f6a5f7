//! Marker objects: one per child, written once, counted by the parent's barrier.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{EngineError, Result};
use crate::state_machine::Phase;

/// Outcome a child leaves behind for its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timeout_error: bool,
}

impl Marker {
    pub fn completed(module: impl Into<String>, data: Option<Value>, options: Option<Value>) -> Self {
        Self {
            module: module.into(),
            error: None,
            data,
            options,
            timeout_error: false,
        }
    }

    pub fn failed(module: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            error: Some(error.into()),
            data: None,
            options: None,
            timeout_error: false,
        }
    }

    pub fn timed_out(module: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            timeout_error: true,
            ..Self::failed(module, error)
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// `{organization_id}/{created_at}/{phase}/{module}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerKey {
    pub organization_id: String,
    pub created_at: i64,
    pub phase: Phase,
    pub module: String,
}

impl MarkerKey {
    pub fn new(
        organization_id: impl Into<String>,
        created_at: i64,
        phase: Phase,
        module: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            created_at,
            phase,
            module: module.into(),
        }
    }

    /// Prefix shared by every marker of one phase of one run.
    pub fn phase_prefix(organization_id: &str, created_at: i64, phase: Phase) -> String {
        format!("{organization_id}/{created_at}/{phase}/")
    }

    /// Prefix shared by every marker of one run.
    pub fn run_prefix(organization_id: &str, created_at: i64) -> String {
        format!("{organization_id}/{created_at}/")
    }

    /// Prefix shared by every marker of an organization.
    pub fn organization_prefix(organization_id: &str) -> String {
        format!("{organization_id}/")
    }

    /// The run timestamp encoded in a raw key, if it has one.
    pub fn run_of(key: &str) -> Option<i64> {
        key.split('/').nth(1)?.parse().ok()
    }
}

impl fmt::Display for MarkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.organization_id, self.created_at, self.phase, self.module
        )
    }
}

/// Write-once object namespace used as the fan-in barrier.
#[async_trait]
pub trait MarkerStore: Send + Sync {
    /// Stores `payload` under `key` unless the key already exists. Returns whether
    /// this call wrote it.
    async fn put(&self, key: &str, payload: Vec<u8>) -> Result<bool>;

    /// Every object whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Removes the given keys and returns how many existed.
    async fn delete_many(&self, keys: &[String]) -> Result<usize>;

    async fn count(&self, prefix: &str) -> Result<usize> {
        Ok(self.list(prefix).await?.len())
    }
}

/// Decodes every marker under `prefix`. Undecodable objects are reported as errors.
pub async fn read_markers(store: &dyn MarkerStore, prefix: &str) -> Result<Vec<Marker>> {
    store
        .list(prefix)
        .await?
        .into_iter()
        .map(|(key, payload)| {
            Marker::from_bytes(&payload)
                .map_err(|e| EngineError::MarkerStore(format!("undecodable marker {key}: {e}")))
        })
        .collect()
}

/// Marker store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryMarkerStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl MarkerStore for MemoryMarkerStore {
    async fn put(&self, key: &str, payload: Vec<u8>) -> Result<bool> {
        let mut objects = self.objects.write().await;
        if objects.contains_key(key) {
            return Ok(false);
        }
        objects.insert(key.to_string(), payload);
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, payload)| (key.clone(), payload.clone()))
            .collect())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        let mut objects = self.objects.write().await;
        Ok(keys.iter().filter(|key| objects.remove(*key).is_some()).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn marker_key_layout() {
        let key = MarkerKey::new("org-1", 1_700, Phase::Archive, "snapshots");
        assert_eq!(key.to_string(), "org-1/1700/archive/snapshots");
        assert!(key
            .to_string()
            .starts_with(&MarkerKey::phase_prefix("org-1", 1_700, Phase::Archive)));
        assert_eq!(MarkerKey::run_of("org-1/1700/archive/snapshots"), Some(1_700));
        assert_eq!(MarkerKey::run_of("garbage"), None);
    }

    #[test]
    fn timeout_marker_wire_format() {
        let marker = Marker::timed_out("rightsizing", "stalled");
        let json: Value = serde_json::from_slice(&marker.to_bytes().unwrap()).unwrap();
        assert_eq!(json["timeout_error"], true);
        assert_eq!(json["error"], "stalled");
        assert!(json.get("data").is_none());

        let ok = Marker::completed("rightsizing", Some(json!({"saving": 12.5})), None);
        let json: Value = serde_json::from_slice(&ok.to_bytes().unwrap()).unwrap();
        assert!(json.get("timeout_error").is_none());
        assert_eq!(Marker::from_bytes(&ok.to_bytes().unwrap()).unwrap(), ok);
    }

    #[tokio::test]
    async fn put_is_write_once() {
        let store = MemoryMarkerStore::new();
        assert!(store.put("o/1/service/a", b"first".to_vec()).await.unwrap());
        assert!(!store.put("o/1/service/a", b"second".to_vec()).await.unwrap());

        let listed = store.list("o/1/service/").await.unwrap();
        assert_eq!(listed, vec![("o/1/service/a".to_string(), b"first".to_vec())]);
    }

    #[tokio::test]
    async fn list_is_scoped_to_prefix() {
        let store = MemoryMarkerStore::new();
        for key in [
            "o/1/recommendation/a",
            "o/1/recommendation/b",
            "o/1/service/a",
            "o/10/recommendation/a",
            "p/1/recommendation/a",
        ] {
            store.put(key, b"{}".to_vec()).await.unwrap();
        }
        assert_eq!(store.count("o/1/recommendation/").await.unwrap(), 2);
        assert_eq!(store.count("o/1/").await.unwrap(), 3);
        assert_eq!(store.count("o/").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn delete_many_reports_existing_only() {
        let store = MemoryMarkerStore::new();
        store.put("o/1/service/a", b"{}".to_vec()).await.unwrap();
        let removed = store
            .delete_many(&["o/1/service/a".into(), "o/1/service/missing".into()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn read_markers_rejects_garbage() {
        let store = MemoryMarkerStore::new();
        store.put("o/1/service/a", b"not json".to_vec()).await.unwrap();
        let err = read_markers(&store, "o/1/service/").await.unwrap_err();
        assert!(matches!(err, EngineError::MarkerStore(_)));
    }
}
