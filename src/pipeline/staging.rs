//! Per-job staging directories.
//!
//! Each accepted upload gets `{staging_root}/{collection_name}/` holding the raw input and the
//! intermediate artifacts of every stage. [`StagingArea`] removes its directory when the
//! orchestrator finishes a job, and again on drop if that explicit removal never ran.

use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Owned staging directory for one job.
#[derive(Debug)]
pub struct StagingArea {
    dir: PathBuf,
    input: PathBuf,
    removed: bool,
}

impl StagingArea {
    /// Create the job directory and persist the uploaded bytes into it.
    ///
    /// A leftover directory for the same key (from an earlier terminal job) is replaced.
    pub async fn create(
        root: &Path,
        collection_name: &str,
        filename: &str,
        bytes: &[u8],
    ) -> io::Result<Self> {
        let dir = root.join(collection_name);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tokio::fs::create_dir_all(&dir).await?;

        let input = dir.join(input_file_name(filename));
        let area = Self {
            dir,
            input,
            removed: false,
        };
        tokio::fs::write(&area.input, bytes).await?;
        Ok(area)
    }

    /// Directory stages write their artifacts into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the staged upload.
    pub fn input(&self) -> &Path {
        &self.input
    }

    /// Remove the directory and everything in it.
    pub async fn remove(mut self) -> io::Result<()> {
        self.removed = true;
        match tokio::fs::remove_dir_all(&self.dir).await {
            Err(error) if error.kind() != io::ErrorKind::NotFound => Err(error),
            _ => Ok(()),
        }
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }
}

fn input_file_name(filename: &str) -> String {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()));
    match extension {
        Some(ext) => format!("input.{ext}"),
        None => "input".to_string(),
    }
}

/// Remove staging directories left behind by a previous process.
///
/// Job state is not durable, so nothing under the root can belong to a live job at startup.
pub fn sweep_orphans(root: &Path) -> usize {
    if !root.exists() {
        return 0;
    }
    let mut removed = 0;
    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
    {
        let path = entry.path();
        let outcome = if entry.file_type().is_dir() {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        };
        match outcome {
            Ok(()) => removed += 1,
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "Failed to sweep staging entry");
            }
        }
    }
    removed
}
