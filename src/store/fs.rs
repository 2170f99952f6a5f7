//! Marker store on the local filesystem. Each key `a/b/c/d` maps to
//! `{root}/a/b/c/d.json`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use uuid::Uuid;

use super::marker::MarkerStore;
use crate::error::{EngineError, Result};

const EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct FsMarkerStore {
    root: PathBuf,
}

impl FsMarkerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(EngineError::MarkerStore(format!("invalid key: {key:?}")));
        }
        Ok(self.root.join(format!("{key}.{EXTENSION}")))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let relative = relative.with_extension("");
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }

    /// Deepest directory that holds every key starting with `prefix`: everything up
    /// to the prefix's last '/'.
    fn walk_start(&self, prefix: &str) -> Result<PathBuf> {
        let Some((dir, _)) = prefix.rsplit_once('/') else {
            return Ok(self.root.clone());
        };
        if dir.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(EngineError::MarkerStore(format!("invalid prefix: {prefix:?}")));
        }
        Ok(self.root.join(dir))
    }

    /// Marker files under `start`, skipping in-flight temp files.
    async fn walk(&self, start: PathBuf) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if path.extension().is_some_and(|ext| ext == EXTENSION)
                    && !entry.file_name().to_string_lossy().starts_with('.')
                {
                    files.push(path);
                }
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl MarkerStore for FsMarkerStore {
    async fn put(&self, key: &str, payload: Vec<u8>) -> Result<bool> {
        let path = self.path_for(key)?;
        let dir = path
            .parent()
            .ok_or_else(|| EngineError::MarkerStore(format!("invalid key: {key:?}")))?;
        fs::create_dir_all(dir).await?;

        // Write to a temp file, then hard-link into place: the link fails if the
        // marker exists, and readers never observe a partial object.
        let tmp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&tmp, &payload).await?;
        let linked = fs::hard_link(&tmp, &path).await;
        let _ = fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut found = Vec::new();
        for path in self.walk(self.walk_start(prefix)?).await? {
            let Some(key) = self.key_for(&path) else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            match fs::read(&path).await {
                Ok(payload) => found.push((key, payload)),
                // Deleted between walk and read.
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            match fs::remove_file(self.path_for(key)?).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}
