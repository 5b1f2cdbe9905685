//! Per-attempt JSON-lines journal

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use safenet_core::{Result, WorkflowState};

/// Appends one JSON line per workflow step to `<dir>/<attempt_id>.log`
#[derive(Debug, Clone)]
pub struct AttemptJournal {
    dir: PathBuf,
}

impl AttemptJournal {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, attempt_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.log", attempt_id))
    }

    pub async fn record(
        &self,
        attempt_id: Uuid,
        state: WorkflowState,
        message: &str,
    ) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "attempt_id": attempt_id,
            "state": state,
            "message": message,
        });
        let line = format!("{}\n", serde_json::to_string(&entry)?);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(attempt_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
