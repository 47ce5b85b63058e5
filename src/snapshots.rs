use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;

use crate::error::AssistError;
use crate::types::Screenshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Before,
    After,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Before => "before",
            Phase::After => "after",
        }
    }
}

/// Keeps the screenshots a StepRecord refers to. Returns the stored ref.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, task_id: &str, step: usize, phase: Phase, shot: &Screenshot) -> Result<String, AssistError>;
}

pub struct NullSnapshotStore;

#[async_trait]
impl SnapshotStore for NullSnapshotStore {
    async fn save(
        &self,
        _task_id: &str,
        _step: usize,
        _phase: Phase,
        shot: &Screenshot,
    ) -> Result<String, AssistError> {
        Ok(shot.id.clone())
    }
}

pub struct DiskSnapshotStore {
    base_dir: PathBuf,
}

impl DiskSnapshotStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }

    pub fn path_for(&self, task_id: &str, step: usize, phase: Phase) -> PathBuf {
        self.base_dir.join(task_id).join(format!("step_{:03}_{}.png", step, phase.as_str()))
    }
}

#[async_trait]
impl SnapshotStore for DiskSnapshotStore {
    async fn save(&self, task_id: &str, step: usize, phase: Phase, shot: &Screenshot) -> Result<String, AssistError> {
        // Pixel-less captures (tests, remote screens) are still referenced by id.
        let Some(b64) = &shot.image_base64 else {
            return Ok(shot.id.clone());
        };
        let dir = self.base_dir.join(task_id);
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|e| AssistError::Internal(format!("create_dir: {}", e)))?;
        let png = B64
            .decode(b64)
            .map_err(|e| AssistError::Internal(format!("b64 decode: {}", e)))?;
        let path = self.path_for(task_id, step, phase);
        async_fs::write(&path, &png)
            .await
            .map_err(|e| AssistError::Internal(format!("write: {}", e)))?;
        Ok(shot.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disk_store_writes_decoded_png() {
        let dir = std::env::temp_dir().join(format!("steady-hands-test-{}", nanoid::nanoid!()));
        let store = DiskSnapshotStore::new(&dir);
        let shot = Screenshot::new(2, 2, Some(B64.encode(b"\x89PNG fake")), None);
        let r = store.save("task1", 3, Phase::After, &shot).await.unwrap();
        assert_eq!(r, shot.id);
        let bytes = tokio::fs::read(store.path_for("task1", 3, Phase::After)).await.unwrap();
        assert_eq!(bytes, b"\x89PNG fake");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn bad_base64_is_reported() {
        let store = DiskSnapshotStore::new(std::env::temp_dir());
        let shot = Screenshot::new(2, 2, Some("%%%".into()), None);
        assert!(store.save("t", 0, Phase::Before, &shot).await.is_err());
    }
}
