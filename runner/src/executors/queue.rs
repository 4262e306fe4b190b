use super::{task_environment, DispatchReport, Executor, ExecutorError, JobId};
use crate::{
    config::{HarnessConfig, QueueConfig},
    environment::Environment,
    launcher::{Invocation, Launcher},
    run::RunDirectory,
};
use itertools::Itertools;
use std::{
    collections::BTreeMap,
    fmt, io,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Batch systems the harness knows how to talk to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheduler {
    Slurm,
    Pbs,
}

impl Scheduler {
    pub fn environment(&self) -> Environment {
        match self {
            Self::Slurm => Environment::Slurm,
            Self::Pbs => Environment::Pbs,
        }
    }

    fn section<'a>(&self, config: &'a HarnessConfig) -> Option<&'a QueueConfig> {
        match self {
            Self::Slurm => config.slurm.as_ref(),
            Self::Pbs => config.pbs.as_ref(),
        }
    }

    pub fn default_command(&self) -> &'static str {
        match self {
            Self::Slurm => "sbatch",
            Self::Pbs => "qsub",
        }
    }

    /// `Submitted batch job 123` for sbatch, `123.server` for qsub
    pub fn default_job_id_field(&self) -> usize {
        match self {
            Self::Slurm => 3,
            Self::Pbs => 0,
        }
    }

    /// job name, log locations and full environment export
    fn submit_args(&self, name: &str, qlogs: &Path) -> Vec<String> {
        match self {
            Self::Slurm => vec![
                "--export=ALL".to_string(),
                format!("--job-name={name}"),
                format!("--output={}/%x-%j.out", qlogs.display()),
                format!("--error={}/%x-%j.err", qlogs.display()),
            ],
            Self::Pbs => vec![
                "-V".to_string(),
                "-N".to_string(),
                name.to_string(),
                "-o".to_string(),
                qlogs.display().to_string(),
                "-e".to_string(),
                qlogs.display().to_string(),
            ],
        }
    }

    fn dependency_args(&self, dependency: &DependencyExpression) -> Vec<String> {
        match self {
            Self::Slurm => vec![format!("--dependency={dependency}")],
            Self::Pbs => vec!["-W".to_string(), format!("depend={dependency}")],
        }
    }
}

/// Which submission an error or handle belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submission {
    Task(u32),
    Cleanup,
}

impl fmt::Display for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task(ordinal) => write!(f, "array task {ordinal}"),
            Self::Cleanup => f.write_str("cleanup job"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("{submission}: failed to run the submission command: {source}")]
    Spawn {
        submission: Submission,
        source: io::Error,
    },
    #[error("{submission}: submission exited with status {status:?}: {stderr}")]
    ExitStatus {
        submission: Submission,
        status: Option<i32>,
        stderr: String,
    },
    #[error("{submission}: no job id in field {field} of the response {stdout:?}")]
    MissingJobId {
        submission: Submission,
        field: usize,
        stdout: String,
    },
}

impl SubmissionError {
    pub fn submission(&self) -> Submission {
        match self {
            Self::Spawn { submission, .. }
            | Self::ExitStatus { submission, .. }
            | Self::MissingJobId { submission, .. } => *submission,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DependencyError {
    #[error("There are no job ids to depend on")]
    Empty,
    #[error("Missing job ids for array tasks {0:?}")]
    Incomplete(Vec<u32>),
    #[error("Job ids for array tasks {0:?} outside of the submitted array")]
    Unexpected(Vec<u32>),
}

/// `afterok:<id1>:...:<idN>`, run only once all listed jobs succeeded
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependencyExpression(String);

impl DependencyExpression {
    /// Only builds from a complete set, i.e. a handle for every ordinal in `1..=narray`
    pub fn after_ok(handles: &BTreeMap<u32, JobId>, narray: u32) -> Result<Self, DependencyError> {
        if narray == 0 || handles.is_empty() {
            return Err(DependencyError::Empty);
        }

        let missing = (1..=narray)
            .filter(|ordinal| !handles.contains_key(ordinal))
            .collect_vec();
        if !missing.is_empty() {
            return Err(DependencyError::Incomplete(missing));
        }
        let unexpected = handles
            .keys()
            .filter(|ordinal| !(1..=narray).contains(*ordinal))
            .copied()
            .collect_vec();
        if !unexpected.is_empty() {
            return Err(DependencyError::Unexpected(unexpected));
        }

        Ok(Self(format!("afterok:{}", handles.values().join(":"))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn job_ids(&self) -> impl Iterator<Item = &str> {
        self.0.split(':').skip(1)
    }
}

impl fmt::Display for DependencyExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub enum CleanupOutcome {
    Disabled,
    // not submitted because the array was incomplete
    Skipped,
    Submitted(JobId),
    Failed(SubmissionError),
}

#[derive(Debug)]
pub struct QueueReport {
    pub scheduler: Scheduler,
    pub narray: u32,
    pub handles: BTreeMap<u32, JobId>,
    pub failures: Vec<SubmissionError>,
    pub dependency: Option<DependencyExpression>,
    pub cleanup: CleanupOutcome,
}

impl QueueReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && !matches!(self.cleanup, CleanupOutcome::Failed(_))
    }
}

#[derive(Debug, Clone)]
struct CleanupJob {
    script: PathBuf,
    args: Vec<String>,
}

/// Submits one queue job per array task, one at a time
#[derive(Debug)]
pub struct QueueExecutor {
    scheduler: Scheduler,
    command: String,
    script: PathBuf,
    job_id_field: usize,
    args: Vec<String>,
    narray: u32,
    delay: Duration,
    cleanup: Option<CleanupJob>,
    config: HarnessConfig,
    run: RunDirectory,
}

impl QueueExecutor {
    pub fn load(
        scheduler: Scheduler,
        config: &HarnessConfig,
        run: &RunDirectory,
    ) -> Result<Self, ExecutorError> {
        let queue = scheduler
            .section(config)
            .ok_or(ExecutorError::MissingQueueConfig(scheduler.environment()))?;

        let cleanup = if config.cleanup.enabled {
            let script = config
                .cleanup
                .script
                .clone()
                .ok_or(ExecutorError::MissingCleanupScript)?;

            Some(CleanupJob {
                script,
                args: config.cleanup.args.clone(),
            })
        } else {
            None
        };

        Ok(Self {
            scheduler,
            command: queue
                .command
                .clone()
                .unwrap_or_else(|| scheduler.default_command().to_string()),
            script: queue.script.clone(),
            job_id_field: queue
                .job_id_field
                .unwrap_or_else(|| scheduler.default_job_id_field()),
            args: queue.args.clone(),
            narray: config.dispatch.narray,
            delay: Duration::from_millis(config.dispatch.submit_delay_ms),
            cleanup,
            config: config.clone(),
            run: run.clone(),
        })
    }

    fn task_invocation(&self, ordinal: u32) -> Invocation {
        let name = format!("{}-{ordinal}", self.config.study.model);

        Invocation::new(&self.command)
            .args(self.scheduler.submit_args(&name, &self.run.qlogs()))
            .args(self.args.iter().cloned())
            .arg(self.script.to_string_lossy())
            .envs(task_environment(&self.config, &self.run, ordinal))
    }

    fn cleanup_invocation(&self, job: &CleanupJob, dependency: &DependencyExpression) -> Invocation {
        let name = format!("{}-cleanup", self.config.study.model);
        let mut env = task_environment(&self.config, &self.run, 0);
        env.remove("TASK_ID");

        Invocation::new(&self.command)
            .args(self.scheduler.submit_args(&name, &self.run.qlogs()))
            .args(self.scheduler.dependency_args(dependency))
            .args(job.args.iter().cloned())
            .arg(job.script.to_string_lossy())
            .envs(env)
    }

    fn submit(
        &self,
        launcher: &mut dyn Launcher,
        invocation: &Invocation,
        submission: Submission,
    ) -> Result<JobId, SubmissionError> {
        debug!(%submission, command = %invocation, "Submitting");

        let completion = launcher
            .launch(invocation)
            .map_err(|source| SubmissionError::Spawn { submission, source })?;

        if !completion.success() {
            return Err(SubmissionError::ExitStatus {
                submission,
                status: completion.status,
                stderr: completion.stderr.trim().to_string(),
            });
        }

        JobId::parse(&completion.stdout, self.job_id_field).ok_or_else(|| {
            SubmissionError::MissingJobId {
                submission,
                field: self.job_id_field,
                stdout: completion.stdout.trim().to_string(),
            }
        })
    }
}

impl Executor for QueueExecutor {
    /// submit all array tasks sequentially, then the cleanup job if the set is complete
    #[instrument(skip_all, fields(scheduler = ?self.scheduler, narray = self.narray), level = "info")]
    fn execute(&mut self, launcher: &mut dyn Launcher) -> Result<DispatchReport, ExecutorError> {
        let mut handles = BTreeMap::new();
        let mut failures = Vec::new();

        for ordinal in 1..=self.narray {
            let invocation = self.task_invocation(ordinal);

            match self.submit(launcher, &invocation, Submission::Task(ordinal)) {
                Ok(job_id) => {
                    info!(ordinal, job_id = %job_id, "Submitted array task");
                    handles.insert(ordinal, job_id);
                }
                Err(e) => {
                    error!("{e}");
                    failures.push(e);
                }
            }

            // pause between submissions to not overwhelm the scheduler
            if ordinal < self.narray && !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
        }

        let dependency = if failures.is_empty() {
            match DependencyExpression::after_ok(&handles, self.narray) {
                Ok(dependency) => {
                    debug!(%dependency, "Built dependency for the cleanup job");
                    Some(dependency)
                }
                Err(e) => {
                    error!("Failed to build dependency expression: {e}");
                    None
                }
            }
        } else {
            warn!(
                "{} of {} submissions failed, no dependency is built on the incomplete set",
                failures.len(),
                self.narray
            );
            None
        };

        let cleanup = match (&self.cleanup, &dependency) {
            (None, _) => CleanupOutcome::Disabled,
            (Some(_), None) => {
                warn!("Skipping the cleanup job since not every array task was submitted");
                CleanupOutcome::Skipped
            }
            (Some(job), Some(dependency)) => {
                let invocation = self.cleanup_invocation(job, dependency);

                match self.submit(launcher, &invocation, Submission::Cleanup) {
                    Ok(job_id) => {
                        info!(job_id = %job_id, "Submitted cleanup job");
                        CleanupOutcome::Submitted(job_id)
                    }
                    Err(e) => {
                        error!("{e}");
                        CleanupOutcome::Failed(e)
                    }
                }
            }
        };

        Ok(DispatchReport::Queue(QueueReport {
            scheduler: self.scheduler,
            narray: self.narray,
            handles,
            failures,
            dependency,
            cleanup,
        }))
    }
}
