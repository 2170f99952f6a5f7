//! Checklist bookkeeping. The engine only touches the three run timestamps, always
//! through conditional single-document patches.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checklist {
    pub id: String,
    pub organization_id: String,
    #[serde(default)]
    pub next_run: i64,
    #[serde(default)]
    pub last_run: i64,
    #[serde(default)]
    pub last_completed: i64,
}

impl Checklist {
    pub fn new(id: impl Into<String>, organization_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            organization_id: organization_id.into(),
            next_run: 0,
            last_run: 0,
            last_completed: 0,
        }
    }

    /// No run in flight.
    pub fn is_idle(&self) -> bool {
        self.last_run == self.last_completed
    }

    pub fn is_due(&self, now: i64) -> bool {
        self.is_idle() && self.next_run <= now
    }

    /// A run has been in flight for at least `reschedule_timeout` seconds.
    pub fn is_stuck(&self, now: i64, reschedule_timeout: i64) -> bool {
        !self.is_idle() && now - self.last_run >= reschedule_timeout
    }
}

/// Fields to set, plus an optional guard on the current `last_run`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecklistPatch {
    pub next_run: Option<i64>,
    pub last_run: Option<i64>,
    pub last_completed: Option<i64>,
    /// Apply only if the stored `last_run` still equals this value.
    pub expected_last_run: Option<i64>,
}

impl ChecklistPatch {
    /// Claims a run: pushes `next_run` out and stamps `last_run`.
    pub fn claim(observed_last_run: i64, now: i64, run_period: i64) -> Self {
        Self {
            next_run: Some(now + run_period),
            last_run: Some(now),
            last_completed: None,
            expected_last_run: Some(observed_last_run),
        }
    }

    /// Marks the run started at `created_at` as finished, unless a newer run has
    /// claimed the checklist since.
    pub fn complete(created_at: i64) -> Self {
        Self {
            last_completed: Some(created_at),
            expected_last_run: Some(created_at),
            ..Self::default()
        }
    }

    /// Applies the patch if its guard holds. Returns whether it was applied.
    pub fn apply(&self, checklist: &mut Checklist) -> bool {
        if let Some(expected) = self.expected_last_run
            && checklist.last_run != expected
        {
            return false;
        }
        if let Some(v) = self.next_run {
            checklist.next_run = v;
        }
        if let Some(v) = self.last_run {
            checklist.last_run = v;
        }
        if let Some(v) = self.last_completed {
            checklist.last_completed = v;
        }
        true
    }
}

#[async_trait]
pub trait ChecklistStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Checklist>>;

    /// Conditionally patches one checklist. `Ok(false)` means the guard did not hold.
    async fn patch(&self, id: &str, patch: &ChecklistPatch) -> Result<bool>;
}

#[derive(Debug, Default)]
pub struct MemoryChecklistStore {
    checklists: RwLock<HashMap<String, Checklist>>,
}

impl MemoryChecklistStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checklists(checklists: impl IntoIterator<Item = Checklist>) -> Self {
        Self {
            checklists: RwLock::new(
                checklists
                    .into_iter()
                    .map(|c| (c.id.clone(), c))
                    .collect(),
            ),
        }
    }

    pub async fn insert(&self, checklist: Checklist) {
        self.checklists
            .write()
            .await
            .insert(checklist.id.clone(), checklist);
    }

    pub async fn get(&self, id: &str) -> Option<Checklist> {
        self.checklists.read().await.get(id).cloned()
    }
}

#[async_trait]
impl ChecklistStore for MemoryChecklistStore {
    async fn list(&self) -> Result<Vec<Checklist>> {
        let mut all: Vec<_> = self.checklists.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn patch(&self, id: &str, patch: &ChecklistPatch) -> Result<bool> {
        let mut checklists = self.checklists.write().await;
        let checklist = checklists
            .get_mut(id)
            .ok_or_else(|| EngineError::ChecklistNotFound(id.to_string()))?;
        Ok(patch.apply(checklist))
    }
}

/// Checklists kept in a JSON array on disk. Used by the operator CLI.
#[derive(Debug)]
pub struct JsonFileChecklistStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileChecklistStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<Vec<Checklist>> {
        let contents = tokio::fs::read(&self.path).await?;
        if contents.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&contents)?)
    }
}

#[async_trait]
impl ChecklistStore for JsonFileChecklistStore {
    async fn list(&self) -> Result<Vec<Checklist>> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    async fn patch(&self, id: &str, patch: &ChecklistPatch) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut checklists = self.read().await?;
        let checklist = checklists
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| EngineError::ChecklistNotFound(id.to_string()))?;
        if !patch.apply(checklist) {
            return Ok(false);
        }
        let body = serde_json::to_vec_pretty(&checklists)?;
        tokio::fs::write(&self.path, body).await?;
        Ok(true)
    }
}
