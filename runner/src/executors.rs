pub mod local;
pub mod queue;


use crate::{
    config::HarnessConfig,
    environment::Environment,
    launcher::Launcher,
    run::RunDirectory,
};
use std::{collections::BTreeMap, fmt, io, path::Path, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Running on {0} but the config has no `{0}` section")]
    MissingQueueConfig(Environment),
    #[error("cleanup.enabled is set but cleanup.script is missing")]
    MissingCleanupScript,
    #[error("Failed to launch the simulation")]
    Spawn(#[source] io::Error),
    #[error("Local simulation exited with status {0:?}")]
    LocalFailed(Option<i32>),
    #[error("Local simulation exceeded its timeout of {0:?}")]
    LocalTimeout(Duration),
}

/// Scheduler assigned job id, opaque to the harness
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(String);

impl JobId {
    /// Pick the whitespace separated `field` out of a submission response
    pub fn parse(response: &str, field: usize) -> Option<Self> {
        response
            .split_whitespace()
            .nth(field)
            .map(|token| Self(token.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Variables every simulation invocation receives, queued or local
pub fn task_environment(
    config: &HarnessConfig,
    run: &RunDirectory,
    ordinal: u32,
) -> BTreeMap<String, String> {
    let path = |p: std::path::PathBuf| p.to_string_lossy().into_owned();
    let mut env = config.simulation.env.clone();

    env.extend([
        ("Model".to_string(), config.study.model.clone()),
        ("Nloci".to_string(), config.study.loci.to_string()),
        ("Nsims".to_string(), config.study.reps.to_string()),
        ("TASK_ID".to_string(), ordinal.to_string()),
        ("SimID".to_string(), path(run.path().to_path_buf())),
        ("SUBMITDIR".to_string(), path(run.path().to_path_buf())),
        ("jobfile".to_string(), path(run.job_file())),
        ("lockfile".to_string(), path(run.lock_file())),
        ("datafile".to_string(), path(run.data_file())),
        ("errorfile".to_string(), path(run.error_file())),
    ]);

    env
}

/// Outcome of a dispatch, per environment
#[derive(Debug)]
pub enum DispatchReport {
    Queue(queue::QueueReport),
    Local(local::LocalReport),
}

pub trait Executor {
    fn execute(&mut self, launcher: &mut dyn Launcher) -> Result<DispatchReport, ExecutorError>;
}

#[derive(Debug)]
pub enum Executors {
    Queue(queue::QueueExecutor),
    Local(local::LocalExecutor),
}

impl Executors {
    /// `working_dir` is where relative simulation paths of a local run are found
    pub fn load(
        environment: Environment,
        config: &HarnessConfig,
        run: &RunDirectory,
        working_dir: &Path,
    ) -> Result<Self, ExecutorError> {
        match environment {
            Environment::Slurm => Ok(Self::Queue(queue::QueueExecutor::load(
                queue::Scheduler::Slurm,
                config,
                run,
            )?)),
            Environment::Pbs => Ok(Self::Queue(queue::QueueExecutor::load(
                queue::Scheduler::Pbs,
                config,
                run,
            )?)),
            Environment::Local => Ok(Self::Local(local::LocalExecutor::load(config, run, working_dir)?)),
        }
    }

    pub fn execute(&mut self, launcher: &mut dyn Launcher) -> Result<DispatchReport, ExecutorError> {
        match self {
            Self::Queue(executor) => executor.execute(launcher),
            Self::Local(executor) => executor.execute(launcher),
        }
    }
}
