use chrono::{DateTime, TimeZone};
use std::{
    fmt,
    fs::{self, DirBuilder},
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

/// Second granularity, no path separators
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H%M%S";

/// Directory receiving scheduler stdout/ stderr
pub const QLOGS_DIR: &str = "qlogs";

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Model name must be non-empty and free of path separators, got {0:?}")]
    InvalidModel(String),
    #[error("{0} must be positive")]
    NonPositive(&'static str),
    #[error("Failed to create directory {path:?}: {source}")]
    DirectoryCreation { path: PathBuf, source: io::Error },
}

/// Name of a single submission run, also the name of its directory
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(String);

impl RunId {
    /// `<timestamp>_<model><loci>loci_<reps>reps`
    pub fn new<Tz>(
        timestamp: &DateTime<Tz>,
        model: &str,
        loci: u32,
        reps: u32,
    ) -> Result<Self, RunError>
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        if model.is_empty() || model.contains(['/', '\\']) {
            return Err(RunError::InvalidModel(model.to_string()));
        }
        if loci == 0 {
            return Err(RunError::NonPositive("loci"));
        }
        if reps == 0 {
            return Err(RunError::NonPositive("reps"));
        }

        Ok(Self(format!(
            "{}_{model}{loci}loci_{reps}reps",
            timestamp.format(TIMESTAMP_FORMAT)
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn create_error(path: &Path) -> impl FnOnce(io::Error) -> RunError + '_ {
    move |source| RunError::DirectoryCreation {
        path: path.to_path_buf(),
        source,
    }
}

/// Output directory of a run and the file names shared with the simulation tasks.
///
/// Only `qlogs`, `git` and `svn` are written by the harness, the remaining paths are
/// conventions handed to the tasks through their environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunDirectory {
    root: PathBuf,
}

impl RunDirectory {
    /// Create `<output_root>/<id>` and its log directory, an existing run directory is an error
    pub fn create(output_root: &Path, id: &RunId) -> Result<Self, RunError> {
        fs::create_dir_all(output_root).map_err(create_error(output_root))?;

        let root = output_root.join(id.as_str());
        // non-recursive so a second run within the same second is caught here
        DirBuilder::new()
            .create(&root)
            .map_err(create_error(&root))?;
        let root = root.canonicalize().map_err(create_error(&root))?;

        let qlogs = root.join(QLOGS_DIR);
        fs::create_dir(&qlogs).map_err(create_error(&qlogs))?;

        info!(run = %id, path = ?root, "Created run directory");

        Ok(Self { root })
    }

    /// Refer to an already existing run directory, e.g. from inside a running task
    pub fn open(root: PathBuf) -> Self {
        debug!(path = ?root, "Using existing run directory");

        Self { root }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn qlogs(&self) -> PathBuf {
        self.root.join(QLOGS_DIR)
    }

    /// provenance dump
    pub fn git_log(&self) -> PathBuf {
        self.root.join("git")
    }

    /// legacy marker, named after the version control system used before git
    pub fn svn_marker(&self) -> PathBuf {
        self.root.join("svn")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("lock")
    }

    pub fn job_file(&self) -> PathBuf {
        self.root.join("job")
    }

    pub fn data_file(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn error_file(&self) -> PathBuf {
        self.root.join("error")
    }
}
