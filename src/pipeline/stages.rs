//! External-process and pass-through stages.
//!
//! Conversion and enrichment are delegated to external tools configured as command templates.
//! Templates are split on whitespace; each argument may reference `{input}`, `{output_dir}` and
//! `{output}`. A tool that prints its result instead of writing `{output}` has its stdout saved
//! as the artifact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use super::{IngestionJob, Stage, StageError};

/// Stage that runs an external command.
#[derive(Debug, Clone)]
pub struct CommandStage {
    name: &'static str,
    template: Vec<String>,
    output_name: String,
}

impl CommandStage {
    /// Build a stage from a command template. Returns `None` for an empty template.
    pub fn new(
        name: &'static str,
        template: &str,
        output_name: impl Into<String>,
    ) -> Option<Self> {
        let template: Vec<String> = template.split_whitespace().map(str::to_string).collect();
        if template.is_empty() {
            return None;
        }
        Some(Self {
            name,
            template,
            output_name: output_name.into(),
        })
    }

    fn render(&self, input: &Path, output_dir: &Path, output: &Path) -> Vec<String> {
        self.template
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input.to_string_lossy())
                    .replace("{output_dir}", &output_dir.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
            })
            .collect()
    }
}

#[async_trait]
impl Stage for CommandStage {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, job: &IngestionJob, input: &Path) -> Result<PathBuf, StageError> {
        let output_path = job.staging_dir().join(&self.output_name);
        let args = self.render(input, job.staging_dir(), &output_path);
        let Some((program, rest)) = args.split_first() else {
            return Err(StageError::MissingOutput {
                stage: self.name,
                path: output_path,
            });
        };

        let output = Command::new(program)
            .args(rest)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| StageError::Spawn {
                stage: self.name,
                source,
            })?;

        if !output.status.success() {
            return Err(StageError::CommandFailed {
                stage: self.name,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let exists = tokio::fs::try_exists(&output_path)
            .await
            .map_err(|source| StageError::Io {
                stage: self.name,
                source,
            })?;
        if !exists {
            if output.stdout.is_empty() {
                return Err(StageError::MissingOutput {
                    stage: self.name,
                    path: output_path,
                });
            }
            tokio::fs::write(&output_path, &output.stdout)
                .await
                .map_err(|source| StageError::Io {
                    stage: self.name,
                    source,
                })?;
        }

        tracing::debug!(
            collection = %job.collection_name,
            stage = self.name,
            output = %output_path.display(),
            "Command stage finished"
        );
        Ok(output_path)
    }
}

/// Stage that copies its input through unchanged. Used when no enrichment tool is configured.
#[derive(Debug, Clone)]
pub struct PassThroughStage {
    name: &'static str,
    output_name: String,
}

impl PassThroughStage {
    /// Create a copy-through stage writing `output_name` into the staging directory.
    pub fn new(name: &'static str, output_name: impl Into<String>) -> Self {
        Self {
            name,
            output_name: output_name.into(),
        }
    }
}

#[async_trait]
impl Stage for PassThroughStage {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, job: &IngestionJob, input: &Path) -> Result<PathBuf, StageError> {
        let output_path = job.staging_dir().join(&self.output_name);
        tokio::fs::copy(input, &output_path)
            .await
            .map_err(|source| StageError::Io {
                stage: self.name,
                source,
            })?;
        Ok(output_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StagingArea;

    async fn job(root: &Path, body: &[u8]) -> IngestionJob {
        let staging = StagingArea::create(root, "u_alice_notes", "notes.txt", body)
            .await
            .expect("stage");
        IngestionJob::new("notes.txt", "notes", "alice", "u_alice_notes", staging)
    }

    #[test]
    fn empty_template_is_rejected() {
        assert!(CommandStage::new("conversion", "   ", "base.md").is_none());
    }

    #[test]
    fn render_substitutes_placeholders() {
        let stage =
            CommandStage::new("conversion", "tool --in={input} -o {output} {output_dir}", "b.md")
                .expect("stage");
        let args = stage.render(Path::new("/s/in.pdf"), Path::new("/s"), Path::new("/s/b.md"));
        assert_eq!(args, vec!["tool", "--in=/s/in.pdf", "-o", "/s/b.md", "/s"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_output_file_becomes_artifact() {
        let root = tempfile::tempdir().expect("tempdir");
        let job = job(root.path(), b"hello").await;
        let stage = CommandStage::new("conversion", "cp {input} {output}", "base.md").expect("stage");

        let output = stage.run(&job, job.artifact()).await.expect("run");
        assert!(output.ends_with("base.md"));
        assert_eq!(std::fs::read(output).expect("read"), b"hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdout_is_captured_when_no_file_is_written() {
        let root = tempfile::tempdir().expect("tempdir");
        let job = job(root.path(), b"captured").await;
        let stage = CommandStage::new("enrichment", "cat {input}", "enriched.md").expect("stage");

        let output = stage.run(&job, job.artifact()).await.expect("run");
        assert_eq!(std::fs::read(output).expect("read"), b"captured");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_is_a_stage_error() {
        let root = tempfile::tempdir().expect("tempdir");
        let job = job(root.path(), b"x").await;
        let stage = CommandStage::new("conversion", "false", "base.md").expect("stage");

        assert!(matches!(
            stage.run(&job, job.artifact()).await,
            Err(StageError::CommandFailed { stage: "conversion", .. })
        ));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let root = tempfile::tempdir().expect("tempdir");
        let job = job(root.path(), b"x").await;
        let stage = CommandStage::new("conversion", "ragdesk-no-such-tool {input}", "base.md")
            .expect("stage");

        assert!(matches!(
            stage.run(&job, job.artifact()).await,
            Err(StageError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn pass_through_copies_input() {
        let root = tempfile::tempdir().expect("tempdir");
        let job = job(root.path(), b"# Title").await;
        let stage = PassThroughStage::new("enrichment", "enriched.md");

        let output = stage.run(&job, job.artifact()).await.expect("run");
        assert_eq!(std::fs::read(output).expect("read"), b"# Title");
    }
}
