use crate::{
    config::ProvenanceConfig,
    launcher::{Invocation, Launcher},
    run::RunDirectory,
};
use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, instrument, warn};

/// git invocations dumped into the provenance log, in order
pub const GIT_QUERIES: [&[&str]; 5] = [
    &["remote", "-v"],
    &["branch", "-a"],
    &["log", "-1"],
    &["status"],
    &["diff"],
];

#[derive(Error, Debug)]
pub enum ProvenanceCommandError {
    #[error("Failed to run `{command}`: {source}")]
    Spawn { command: String, source: io::Error },
    #[error("`{command}` exited with status {status:?}")]
    ExitStatus {
        command: String,
        status: Option<i32>,
    },
    #[error("Failed to write {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Appends the state of the source repository to the run directory, best effort
#[derive(Debug, Clone)]
pub struct ProvenanceRecorder {
    repository: PathBuf,
    legacy_svn_marker: bool,
}

impl ProvenanceRecorder {
    pub fn new(config: &ProvenanceConfig, working_dir: &Path) -> Self {
        Self {
            repository: config
                .repository
                .clone()
                .unwrap_or_else(|| working_dir.to_path_buf()),
            legacy_svn_marker: config.legacy_svn_marker,
        }
    }

    /// Never fails the run, problems are logged and handed back
    #[instrument(skip_all, fields(repository = ?self.repository), level = "info")]
    pub fn record(
        &self,
        run: &RunDirectory,
        launcher: &mut dyn Launcher,
    ) -> Vec<ProvenanceCommandError> {
        let mut failures = Vec::new();
        let mut log = String::new();

        for query in GIT_QUERIES {
            let invocation = Invocation::new("git")
                .args(query.iter().copied())
                .current_dir(&self.repository);
            let command = invocation.to_string();

            log.push_str(&format!("### {command}\n"));
            match launcher.launch(&invocation) {
                Ok(completion) => {
                    // error output lands in the log verbatim
                    log.push_str(&completion.stdout);
                    log.push_str(&completion.stderr);
                    if !completion.success() {
                        failures.push(ProvenanceCommandError::ExitStatus {
                            command,
                            status: completion.status,
                        });
                    }
                }
                Err(source) => {
                    log.push_str(&format!("{source}\n"));
                    failures.push(ProvenanceCommandError::Spawn { command, source });
                }
            }
            if !log.ends_with('\n') {
                log.push('\n');
            }
        }

        let git_log = run.git_log();
        if let Err(source) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&git_log)
            .and_then(|mut file| file.write_all(log.as_bytes()))
        {
            failures.push(ProvenanceCommandError::Write {
                path: git_log.clone(),
                source,
            });
        }

        if self.legacy_svn_marker {
            let marker = run.svn_marker();
            let line = format!("version control state recorded with git in {}\n", git_log.display());

            if let Err(source) = fs::write(&marker, line) {
                failures.push(ProvenanceCommandError::Write {
                    path: marker,
                    source,
                });
            }
        }

        for failure in &failures {
            warn!("Provenance incomplete: {failure}");
        }
        info!(path = ?git_log, failures = failures.len(), "Recorded provenance");

        failures
    }
}
