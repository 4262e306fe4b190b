use super::{task_environment, DispatchReport, Executor, ExecutorError};
use crate::{
    config::HarnessConfig,
    launcher::{Invocation, Launcher},
    run::RunDirectory,
};
use std::{
    path::Path,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument};

/// Task ordinal of the single foreground run
pub const LOCAL_TASK_ORDINAL: u32 = 1;

#[derive(Debug)]
pub struct LocalReport {
    pub status: Option<i32>,
    pub elapsed: Duration,
}

/// Executor that runs the simulation directly, without a batch system
#[derive(Debug)]
pub struct LocalExecutor {
    invocation: Invocation,
}

impl LocalExecutor {
    /// create a new LocalExecutor instance
    ///
    /// The simulation runs inside the run directory, so relative paths are made
    /// absolute against `working_dir` first.
    pub fn load(
        config: &HarnessConfig,
        run: &RunDirectory,
        working_dir: &Path,
    ) -> Result<Self, ExecutorError> {
        let simulation = &config.simulation;
        let script = simulation
            .resolved_script(working_dir)
            .map(|script| script.to_string_lossy().into_owned());

        let invocation = Invocation::new(simulation.resolved_program(working_dir).to_string_lossy())
            .args(script)
            .args(simulation.args.iter().cloned())
            .envs(task_environment(config, run, LOCAL_TASK_ORDINAL))
            .current_dir(run.path())
            .inherit_output()
            .timeout(simulation.timeout_secs.map(Duration::from_secs));

        Ok(Self { invocation })
    }
}

impl Executor for LocalExecutor {
    /// run the simulation in the foreground and wait for it
    #[instrument(skip_all, level = "info")]
    fn execute(&mut self, launcher: &mut dyn Launcher) -> Result<DispatchReport, ExecutorError> {
        info!(command = %self.invocation, "Running simulation locally");
        let start = Instant::now();

        let completion = launcher
            .launch(&self.invocation)
            .map_err(ExecutorError::Spawn)?;
        let elapsed = start.elapsed();

        debug!(
            "Finished in {} ms | status: {:?}",
            elapsed.as_millis(),
            completion.status
        );

        if completion.timed_out {
            return Err(ExecutorError::LocalTimeout(
                self.invocation.timeout.unwrap_or_default(),
            ));
        }
        if !completion.success() {
            return Err(ExecutorError::LocalFailed(completion.status));
        }

        Ok(DispatchReport::Local(LocalReport {
            status: completion.status,
            elapsed,
        }))
    }
}
