// src/workspace.rs

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

/// Scratch layout of one pipeline run: `<tmp_root>/<pipeline>/data`.
#[derive(Clone, Debug)]
pub struct Scratch {
    root: PathBuf,
}

impl Scratch {
    pub fn new(pipeline_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: pipeline_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    /// Remove the whole pipeline directory and recreate an empty `data` dir.
    pub async fn reset(&self) -> Result<PathBuf> {
        if fs::try_exists(&self.root).await.unwrap_or(false) {
            fs::remove_dir_all(&self.root)
                .await
                .with_context(|| format!("removing {}", self.root.display()))?;
        }
        let data = self.data_dir();
        fs::create_dir_all(&data)
            .await
            .with_context(|| format!("creating {}", data.display()))?;
        info!(dir = %data.display(), "scratch directory reset");
        Ok(data)
    }
}
