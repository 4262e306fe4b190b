/*
 * Replicate hand-out shared by all array tasks of a run.
 *
 * Every task loops on `claim` until the worklist is exhausted:
 * 1. fresh replicates are handed out in order from the counter in `job`
 * 2. once the counter reaches nsims, replicates that left an error file are redone
 * 3. then replicates whose timeout marker is still present (never finished) are redone
 *
 * All state lives in the run directory, the lock file serializes concurrent tasks.
 */

use crate::run::RunDirectory;
use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info};

pub const TIMEOUT_MARKER: &str = "_timeout_";
pub const REDONE_MARKER: &str = "_redone_";

#[derive(Error, Debug)]
pub enum WorklistError {
    #[error("Failed to acquire {path:?} within {waited:?}")]
    LockTimeout { path: PathBuf, waited: Duration },
    #[error("Job counter in {path:?} is corrupt: {content:?}")]
    CorruptCounter { path: PathBuf, content: String },
    #[error("Replicate {0} is not in progress")]
    NotInProgress(u32),
    #[error("IO error on {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> WorklistError + '_ {
    move |source| WorklistError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Result of asking the worklist for work
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Claim {
    /// never handed out before
    Fresh(u32),
    /// handed out again after an error or a missing finish
    Retry(u32),
    /// every replicate is finished
    Exhausted,
}

impl Claim {
    /// replicate id, or `nsims` when nothing is left
    pub fn id_or(&self, nsims: u32) -> u32 {
        match self {
            Self::Fresh(id) | Self::Retry(id) => *id,
            Self::Exhausted => nsims,
        }
    }
}

/// Held lock file, removed on drop
#[derive(Debug)]
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = ?self.path, "Released worklist lock"),
            Err(error) => error!(error = ?error, "Failed to release worklist lock"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Worklist {
    dir: PathBuf,
    job: PathBuf,
    lock: PathBuf,
    error: PathBuf,
    retry_delay: Duration,
    max_wait: Duration,
}

/// `<stem>_<id>` or `<stem>_<id>.<ext>` -> (id, ext)
fn parse_numbered(file_name: &str, stem: &str) -> Option<(u32, Option<String>)> {
    let rest = file_name.strip_prefix(stem)?.strip_prefix('_')?;
    let (number, extension) = match rest.split_once('.') {
        Some((number, extension)) => (number, Some(extension.to_string())),
        None => (rest, None),
    };

    number.parse().ok().map(|id| (id, extension))
}

fn touch(path: &Path) -> Result<(), WorklistError> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .and_then(|file| file.set_len(0))
        .map_err(io_error(path))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl Worklist {
    pub fn new(run: &RunDirectory) -> Self {
        Self {
            dir: run.path().to_path_buf(),
            job: run.job_file(),
            lock: run.lock_file(),
            error: run.error_file(),
            retry_delay: Duration::from_millis(200),
            max_wait: Duration::from_secs(100),
        }
    }

    pub fn with_lock_timing(mut self, retry_delay: Duration, max_wait: Duration) -> Self {
        self.retry_delay = retry_delay;
        self.max_wait = max_wait;
        self
    }

    fn timeout_marker(&self, id: u32) -> PathBuf {
        self.dir
            .join(format!("{}{TIMEOUT_MARKER}{id}", file_name(&self.job)))
    }

    fn acquire(&self) -> Result<LockGuard, WorklistError> {
        let start = Instant::now();

        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock)
            {
                Ok(mut file) => {
                    // holder pid, only for humans inspecting a stale lock
                    let _ = writeln!(file, "{}", std::process::id());

                    return Ok(LockGuard {
                        path: self.lock.clone(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let waited = start.elapsed();
                    if waited >= self.max_wait {
                        return Err(WorklistError::LockTimeout {
                            path: self.lock.clone(),
                            waited,
                        });
                    }
                    thread::sleep(self.retry_delay);
                }
                Err(e) => return Err(io_error(&self.lock)(e)),
            }
        }
    }

    fn read_counter(&self) -> Result<u32, WorklistError> {
        if !self.job.exists() {
            fs::write(&self.job, "0").map_err(io_error(&self.job))?;
        }

        let content = fs::read_to_string(&self.job).map_err(io_error(&self.job))?;
        content
            .trim()
            .parse()
            .map_err(|_| WorklistError::CorruptCounter {
                path: self.job.clone(),
                content,
            })
    }

    /// entries of the run directory whose name is `<stem>_<id>[.<ext>]` with id < nsims, lowest id first
    fn numbered_entries(
        &self,
        stem: &str,
        nsims: u32,
    ) -> Result<Vec<(u32, Option<String>, PathBuf)>, WorklistError> {
        let mut entries = fs::read_dir(&self.dir)
            .map_err(io_error(&self.dir))?
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                parse_numbered(&name, stem).map(|(id, ext)| (id, ext, entry.path()))
            })
            .filter(|(id, _, _)| *id < nsims)
            .collect::<Vec<_>>();
        entries.sort_by_key(|(id, _, _)| *id);

        Ok(entries)
    }

    /// Hand out the next replicate to work on
    pub fn claim(&self, nsims: u32) -> Result<Claim, WorklistError> {
        let _guard = self.acquire()?;

        let next = self.read_counter()?;
        if next < nsims {
            fs::write(&self.job, (next + 1).to_string()).map_err(io_error(&self.job))?;
            touch(&self.timeout_marker(next))?;
            info!("Jobfile - next job: {next}");

            return Ok(Claim::Fresh(next));
        }

        // redo replicates that exited with an error
        let error_stem = file_name(&self.error);
        if let Some((id, extension, path)) = self.numbered_entries(&error_stem, nsims)?.into_iter().next() {
            let redone = match extension {
                Some(extension) => format!("{}{REDONE_MARKER}{id}.{extension}", file_name(&self.job)),
                None => format!("{}{REDONE_MARKER}{id}", file_name(&self.job)),
            };
            touch(&self.timeout_marker(id))?;
            fs::rename(&path, self.dir.join(redone)).map_err(io_error(&path))?;
            info!("Redoing failed job - next job: {id}");

            return Ok(Claim::Retry(id));
        }

        // then the ones that were started but never finished
        let timeout_stem = format!("{}{}", file_name(&self.job), TIMEOUT_MARKER.trim_end_matches('_'));
        if let Some((id, _, path)) = self.numbered_entries(&timeout_stem, nsims)?.into_iter().next() {
            touch(&path)?;
            info!("Redoing timed out job - next job: {id}");

            return Ok(Claim::Retry(id));
        }

        info!("Jobfile - no jobs left - finishing");
        Ok(Claim::Exhausted)
    }

    /// Mark a claimed replicate as done by removing its timeout marker
    pub fn finish(&self, id: u32) -> Result<(), WorklistError> {
        let marker = self.timeout_marker(id);

        match fs::remove_file(&marker) {
            Ok(()) => {
                debug!(id, "Finished replicate");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(WorklistError::NotInProgress(id)),
            Err(e) => Err(io_error(&marker)(e)),
        }
    }
}
