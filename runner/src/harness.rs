use crate::{
    config::{ConfigErrors, HarnessConfig},
    environment::{Environment, EnvironmentError, HostRules},
    executors::{
        queue::{CleanupOutcome, QueueReport, Scheduler},
        DispatchReport, ExecutorError, Executors,
    },
    launcher::Launcher,
    provenance::ProvenanceRecorder,
    run::{RunDirectory, RunError, RunId},
    worklist::WorklistError,
};
use chrono::{DateTime, Local};
use std::{path::PathBuf, thread, time::Duration};
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("{}", describe_incomplete(.0))]
    IncompleteSubmission(Box<QueueReport>),
    #[error(transparent)]
    Worklist(#[from] WorklistError),
}

fn describe_incomplete(report: &QueueReport) -> String {
    match &report.cleanup {
        CleanupOutcome::Failed(e) if report.failures.is_empty() => format!(
            "All {} array tasks were submitted but the cleanup job failed: {e}",
            report.narray
        ),
        _ => format!(
            "{} of {} array tasks failed to submit",
            report.failures.len(),
            report.narray
        ),
    }
}

impl HarnessError {
    /// Process exit code, distinct per failure class
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_)
            | Self::Run(RunError::InvalidModel(_) | RunError::NonPositive(_))
            | Self::Executor(
                ExecutorError::MissingQueueConfig(_) | ExecutorError::MissingCleanupScript,
            ) => 2,
            Self::Run(RunError::DirectoryCreation { .. }) => 3,
            Self::Environment(_) => 4,
            Self::IncompleteSubmission(_) => 5,
            Self::Executor(_) => 6,
            Self::Worklist(_) => 7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmitOptions {
    // host name (or any identifier) used for environment detection
    pub host: String,
    pub timestamp: DateTime<Local>,
    // checkout the harness was started from, holds the simulation script and is
    // described in the provenance log unless configured otherwise
    pub working_dir: PathBuf,
}

#[derive(Debug)]
pub struct Summary {
    pub run_id: RunId,
    pub run: RunDirectory,
    pub environment: Environment,
    pub report: DispatchReport,
    pub provenance_failures: usize,
}

/// Number of response fields the dry run launcher has to fill for any configured scheduler
pub fn dry_run_fields(config: &HarnessConfig) -> usize {
    [
        (Scheduler::Slurm, config.slurm.as_ref()),
        (Scheduler::Pbs, config.pbs.as_ref()),
    ]
    .into_iter()
    .map(|(scheduler, queue)| {
        queue
            .and_then(|queue| queue.job_id_field)
            .unwrap_or_else(|| scheduler.default_job_id_field())
    })
    .max()
    .unwrap_or_default()
        + 1
}

fn countdown(secs: u64) {
    if secs == 0 {
        return;
    }

    info!("Submitting in {secs} s, interrupt now to cancel");
    thread::sleep(Duration::from_secs(secs));
}

/// Initialize a run and dispatch it.
///
/// `launcher` runs scheduler and simulation commands, `vcs` the provenance queries.
#[instrument(skip_all, fields(host = %options.host), level = "info")]
pub fn submit(
    config: &HarnessConfig,
    options: &SubmitOptions,
    launcher: &mut dyn Launcher,
    vcs: &mut dyn Launcher,
) -> Result<Summary, HarnessError> {
    let secs = config.dispatch.countdown_secs;
    submit_after(config, options, launcher, vcs, &mut |_: &RunId| countdown(secs))
}

/// [`submit`] with the cancellation window given by the caller.
///
/// `window` runs once everything is validated and nothing has been written yet:
/// the run directory does not exist and no command has been launched.
pub fn submit_after(
    config: &HarnessConfig,
    options: &SubmitOptions,
    launcher: &mut dyn Launcher,
    vcs: &mut dyn Launcher,
    window: &mut dyn FnMut(&RunId),
) -> Result<Summary, HarnessError> {
    if config.preflight_checks(&options.working_dir) {
        return Err(ConfigErrors::Preflight.into());
    }

    let environment = HostRules::compile(&config.hosts)?.resolve(&options.host)?;
    info!(%environment, "Detected environment");

    let study = &config.study;
    let run_id = RunId::new(&options.timestamp, &study.model, study.loci, study.reps)?;
    window(&run_id);

    let run = RunDirectory::create(&config.dispatch.output_root, &run_id)?;

    let provenance_failures = if config.provenance.enabled {
        ProvenanceRecorder::new(&config.provenance, &options.working_dir)
            .record(&run, vcs)
            .len()
    } else {
        0
    };

    let mut executor = Executors::load(environment, config, &run, &options.working_dir)?;

    match executor.execute(launcher)? {
        DispatchReport::Queue(report) if !report.is_complete() => {
            Err(HarnessError::IncompleteSubmission(Box::new(report)))
        }
        report => Ok(Summary {
            run_id,
            run,
            environment,
            report,
            provenance_failures,
        }),
    }
}

pub fn log_summary(summary: &Summary) {
    match &summary.report {
        DispatchReport::Queue(report) => {
            info!(
                run = %summary.run_id,
                environment = %summary.environment,
                "Submitted {} array tasks",
                report.handles.len()
            );
            match &report.cleanup {
                CleanupOutcome::Submitted(job_id) => info!(job_id = %job_id, "Cleanup job queued"),
                CleanupOutcome::Disabled => info!("Cleanup job disabled"),
                CleanupOutcome::Skipped | CleanupOutcome::Failed(_) => {}
            }
        }
        DispatchReport::Local(report) => {
            info!(
                run = %summary.run_id,
                "Local simulation finished in {} s",
                report.elapsed.as_secs()
            );
        }
    }

    if summary.provenance_failures > 0 {
        warn!(
            "{} provenance queries failed, see {}",
            summary.provenance_failures,
            summary.run.git_log().display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{tests::minimal, QueueConfig},
        environment::UnknownHostPolicy,
        launcher::{tests::RecordingLauncher, Completion},
        worklist::{Claim, Worklist},
    };
    use chrono::TimeZone;
    use std::{fs, path::Path};

    fn config(dir: &Path, narray: u32) -> HarnessConfig {
        let script = dir.join("array_cGPsim.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::write(dir.join("array_cGPsim.py"), "").unwrap();

        let mut config = minimal();
        config.dispatch.narray = narray;
        config.dispatch.submit_delay_ms = 0;
        config.dispatch.countdown_secs = 0;
        config.dispatch.output_root = dir.join("runs");
        config.hosts.slurm = vec!["stallo*".to_string()];
        config.slurm = Some(QueueConfig {
            script,
            command: None,
            job_id_field: None,
            args: Vec::new(),
        });

        config
    }

    fn options(dir: &Path, host: &str) -> SubmitOptions {
        SubmitOptions {
            host: host.to_string(),
            timestamp: Local.with_ymd_and_hms(2013, 5, 7, 14, 3, 9).unwrap(),
            working_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn cluster_run_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 20);
        let mut launcher = RecordingLauncher::with_stdout("Submitted batch job 30{n}");
        let mut vcs = RecordingLauncher::with_stdout("commit 0123abcd\n");

        let summary = submit(&config, &options(dir.path(), "stallo-1.uit.no"), &mut launcher, &mut vcs).unwrap();

        assert_eq!(summary.environment, Environment::Slurm);
        assert_eq!(
            summary.run_id.as_str(),
            "2013-05-07_140309_adjmotifshaploid3loci_2reps"
        );
        assert!(summary.run.qlogs().is_dir());
        assert_eq!(launcher.programs(), vec!["sbatch"; 20]);

        let DispatchReport::Queue(report) = &summary.report else {
            panic!("expected a queue report");
        };
        assert_eq!(report.dependency.as_ref().unwrap().job_ids().count(), 20);
        assert!(matches!(report.cleanup, CleanupOutcome::Disabled));

        let log = fs::read_to_string(summary.run.git_log()).unwrap();
        assert!(!log.is_empty());
        assert!(log.contains("commit 0123abcd"));
        assert_eq!(summary.provenance_failures, 0);
    }

    #[test]
    fn unknown_host_runs_locally_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 20);
        let mut launcher = RecordingLauncher::default();
        let mut vcs = RecordingLauncher::default();

        let summary = submit(&config, &options(dir.path(), "workstation"), &mut launcher, &mut vcs).unwrap();

        assert_eq!(summary.environment, Environment::Local);
        assert_eq!(launcher.programs(), vec!["python"]);
        assert_eq!(
            launcher.launched[0].args,
            vec![dir.path().join("array_cGPsim.py").to_string_lossy().into_owned()]
        );
        assert_eq!(launcher.launched[0].env["TASK_ID"], "1");
        assert_eq!(launcher.launched[0].cwd.as_deref(), Some(summary.run.path()));
        assert!(matches!(summary.report, DispatchReport::Local(_)));
    }

    #[test]
    fn failed_submission_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 20);
        let mut launcher = RecordingLauncher::default();
        for ordinal in 1..=20 {
            launcher.script.push_back(Ok(if ordinal == 13 {
                Completion {
                    status: Some(1),
                    ..Default::default()
                }
            } else {
                Completion {
                    status: Some(0),
                    stdout: format!("Submitted batch job {ordinal}"),
                    ..Default::default()
                }
            }));
        }

        let error = submit(
            &config,
            &options(dir.path(), "stallo-2"),
            &mut launcher,
            &mut RecordingLauncher::default(),
        )
        .unwrap_err();

        assert_eq!(error.exit_code(), 5);
        let HarnessError::IncompleteSubmission(report) = error else {
            panic!("expected an incomplete submission");
        };
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.handles.len(), 19);
        assert!(report.dependency.is_none());
    }

    #[test]
    fn rejected_host_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 2);
        config.hosts.on_unknown_host = UnknownHostPolicy::Error;
        let mut launcher = RecordingLauncher::default();

        let error = submit(
            &config,
            &options(dir.path(), "workstation"),
            &mut launcher,
            &mut RecordingLauncher::default(),
        )
        .unwrap_err();

        assert_eq!(error.exit_code(), 4);
        assert!(launcher.launched.is_empty());
        assert!(!dir.path().join("runs").exists());
    }

    #[test]
    fn directory_failure_aborts_before_submission() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 2);
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "").unwrap();
        config.dispatch.output_root = blocker;
        let mut launcher = RecordingLauncher::default();

        let error = submit(
            &config,
            &options(dir.path(), "stallo-1"),
            &mut launcher,
            &mut RecordingLauncher::default(),
        )
        .unwrap_err();

        assert_eq!(error.exit_code(), 3);
        assert!(launcher.launched.is_empty());
    }

    #[test]
    fn invalid_config_is_caught_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 0);
        config.provenance.enabled = false;

        let error = submit(
            &config,
            &options(dir.path(), "stallo-1"),
            &mut RecordingLauncher::default(),
            &mut RecordingLauncher::default(),
        )
        .unwrap_err();

        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn tasks_share_the_run_worklist() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 2);

        let summary = submit(
            &config,
            &options(dir.path(), "stallo-1"),
            &mut RecordingLauncher::with_stdout("Submitted batch job {n}"),
            &mut RecordingLauncher::default(),
        )
        .unwrap();

        // what two array tasks would do with the paths they were given
        let worklist = Worklist::new(&RunDirectory::open(summary.run.path().to_path_buf()));
        assert_eq!(worklist.claim(config.study.reps).unwrap(), Claim::Fresh(0));
        assert_eq!(worklist.claim(config.study.reps).unwrap(), Claim::Fresh(1));
        worklist.finish(0).unwrap();
        worklist.finish(1).unwrap();
        assert_eq!(worklist.claim(config.study.reps).unwrap(), Claim::Exhausted);
    }

    #[test]
    fn dry_run_fields_cover_configured_schedulers() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 1);
        assert_eq!(dry_run_fields(&config), 4);

        config.pbs = Some(QueueConfig {
            script: PathBuf::from("array.pbs"),
            command: None,
            job_id_field: Some(6),
            args: Vec::new(),
        });
        assert_eq!(dry_run_fields(&config), 7);
    }

    #[test]
    fn cancellation_window_precedes_every_side_effect() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 2);
        let mut launcher = RecordingLauncher::with_stdout("Submitted batch job {n}");
        let mut vcs = RecordingLauncher::default();
        let output_root = config.dispatch.output_root.clone();
        let mut windows = Vec::new();

        let summary = submit_after(
            &config,
            &options(dir.path(), "stallo-1"),
            &mut launcher,
            &mut vcs,
            &mut |run_id: &RunId| {
                windows.push((run_id.clone(), output_root.join(run_id.as_str()).exists()))
            },
        )
        .unwrap();

        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].0.as_str(), summary.run_id.as_str());
        assert!(!windows[0].1);
        assert_eq!(launcher.launched.len(), 2);
    }

    #[test]
    fn interrupted_window_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 2);
        let mut vcs = RecordingLauncher::default();

        // an interrupt ends the process inside the window, a panic stands in for it
        let interrupted = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            submit_after(
                &config,
                &options(dir.path(), "stallo-1"),
                &mut RecordingLauncher::default(),
                &mut vcs,
                &mut |_: &RunId| panic!("interrupted"),
            )
        }));

        assert!(interrupted.is_err());
        assert!(!config.dispatch.output_root.exists());
        assert!(vcs.launched.is_empty());
    }

    #[test]
    fn failed_cleanup_is_named_in_the_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 2);
        let cleanup = dir.path().join("collect_cGPsim.sh");
        fs::write(&cleanup, "#!/bin/sh\n").unwrap();
        config.cleanup.enabled = true;
        config.cleanup.script = Some(cleanup);
        let mut launcher = RecordingLauncher::default();
        for ordinal in 1..=2 {
            launcher.script.push_back(Ok(Completion {
                status: Some(0),
                stdout: format!("Submitted batch job {ordinal}"),
                ..Default::default()
            }));
        }
        launcher.script.push_back(Ok(Completion {
            status: Some(1),
            stderr: "sbatch: error: invalid dependency".to_string(),
            ..Default::default()
        }));

        let error = submit(
            &config,
            &options(dir.path(), "stallo-1"),
            &mut launcher,
            &mut RecordingLauncher::default(),
        )
        .unwrap_err();

        assert_eq!(error.exit_code(), 5);
        let message = error.to_string();
        assert!(message.contains("cleanup job failed"), "{message}");
        assert!(!message.contains("failed to submit"), "{message}");
    }
}
