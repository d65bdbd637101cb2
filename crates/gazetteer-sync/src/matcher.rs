use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};

use crate::{is_stale, MatcherConfig};

#[derive(Debug, Error)]
pub enum MatcherError {
    #[error("matcher input {0} does not exist")]
    MissingInput(PathBuf),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}")]
    Failed { program: String, status: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatcherOutcome {
    Ran { settings: PathBuf, settings_written: bool },
    UpToDate,
}

/// External record-linkage step that turns the merged dataset plus labelled training pairs into a
/// settings file. Invoked as `<program> -vv -t <training> <input>`.
#[derive(Debug, Clone)]
pub struct MatcherStage {
    program: String,
    training: PathBuf,
    input: PathBuf,
    merged: PathBuf,
    settings: PathBuf,
}

impl MatcherStage {
    pub fn new(config: &MatcherConfig, merged: PathBuf) -> Self {
        Self {
            program: config.program.clone(),
            training: config.training_file.clone(),
            input: config.input_file.clone(),
            merged,
            settings: config.settings_file.clone(),
        }
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            "-vv".to_string(),
            "-t".to_string(),
            self.training.display().to_string(),
            self.input.display().to_string(),
        ]
    }

    fn prerequisites(&self) -> Vec<PathBuf> {
        vec![
            self.merged.clone(),
            self.training.clone(),
            self.input.clone(),
        ]
    }

    pub(crate) async fn inputs_present_besides_merged(&self) -> bool {
        for path in [&self.training, &self.input] {
            if !fs::try_exists(path).await.unwrap_or(false) {
                return false;
            }
        }
        true
    }

    pub async fn is_stale(&self) -> anyhow::Result<bool> {
        is_stale(&self.settings, &self.prerequisites()).await
    }

    pub async fn run(&self, force: bool) -> Result<MatcherOutcome, MatcherError> {
        for path in self.prerequisites() {
            if !fs::try_exists(&path).await.unwrap_or(false) {
                return Err(MatcherError::MissingInput(path));
            }
        }

        if !force && !self.is_stale().await? {
            info!(settings = %self.settings.display(), "matcher settings up to date");
            return Ok(MatcherOutcome::UpToDate);
        }

        info!(program = %self.program, args = ?self.args(), "running matcher");
        let status = Command::new(&self.program)
            .args(self.args())
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|source| MatcherError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !status.success() {
            return Err(MatcherError::Failed {
                program: self.program.clone(),
                status: status.to_string(),
            });
        }

        let settings_written = fs::try_exists(&self.settings).await.unwrap_or(false);
        if !settings_written {
            warn!(settings = %self.settings.display(), "matcher finished without writing the expected settings file");
        }
        Ok(MatcherOutcome::Ran {
            settings: self.settings.clone(),
            settings_written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn stage_in(dir: &Path, program: &str) -> MatcherStage {
        MatcherStage::new(
            &MatcherConfig {
                program: program.to_string(),
                training_file: dir.join("data_matching_training.json"),
                input_file: dir.join("input.csv"),
                settings_file: dir.join("link_settings.pickle"),
            },
            dir.join("opdr_local.csv"),
        )
    }

    #[test]
    fn args_follow_tool_convention() {
        let stage = stage_in(Path::new("/work"), "unionlookup");
        assert_eq!(
            stage.args(),
            vec![
                "-vv",
                "-t",
                "/work/data_matching_training.json",
                "/work/input.csv"
            ]
        );
    }

    #[tokio::test]
    async fn missing_training_file_blocks_the_stage() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("opdr_local.csv"), "f_num\n").unwrap();
        std::fs::write(dir.path().join("input.csv"), "union_name\n").unwrap();

        let stage = stage_in(dir.path(), "unionlookup");
        assert!(!stage.inputs_present_besides_merged().await);
        let err = stage.run(false).await.unwrap_err();
        assert!(
            matches!(err, MatcherError::MissingInput(ref p) if p.ends_with("data_matching_training.json"))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_tool_then_skips_until_inputs_change() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::{Duration, SystemTime};

        let dir = tempdir().unwrap();
        for (name, body) in [
            ("opdr_local.csv", "f_num\n1\n"),
            ("data_matching_training.json", "{}"),
            ("input.csv", "union_name\nseiu 1\n"),
        ] {
            std::fs::write(dir.path().join(name), body).unwrap();
        }

        let settings = dir.path().join("link_settings.pickle");
        let script = dir.path().join("fake-matcher");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho \"$@\" > '{}'\n", settings.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let stage = stage_in(dir.path(), script.to_str().unwrap());
        assert!(stage.is_stale().await.unwrap());

        let outcome = stage.run(false).await.unwrap();
        assert_eq!(
            outcome,
            MatcherOutcome::Ran {
                settings: settings.clone(),
                settings_written: true
            }
        );
        let recorded = std::fs::read_to_string(&settings).unwrap();
        assert!(recorded.starts_with("-vv -t "));
        assert!(recorded.trim_end().ends_with("input.csv"));

        assert_eq!(stage.run(false).await.unwrap(), MatcherOutcome::UpToDate);

        let later = SystemTime::now() + Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(dir.path().join("opdr_local.csv"))
            .unwrap()
            .set_modified(later)
            .unwrap();
        assert!(stage.is_stale().await.unwrap());

        let failing = stage_in(dir.path(), "false");
        let err = failing.run(true).await.unwrap_err();
        assert!(matches!(err, MatcherError::Failed { .. }));

        let absent = stage_in(dir.path(), "/nonexistent/unionlookup");
        let err = absent.run(true).await.unwrap_err();
        assert!(matches!(err, MatcherError::Spawn { .. }));
    }
}
