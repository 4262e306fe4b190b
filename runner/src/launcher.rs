use itertools::Itertools;
use std::{
    collections::BTreeMap,
    fmt, io,
    io::Read,
    path::PathBuf,
    process::{Command, Stdio},
    time::Duration,
};
use tracing::{debug, info, trace, warn};
use wait_timeout::ChildExt;

/// A fully described external command, independent of how it ends up being run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    // pipe stdout/ stderr back instead of inheriting the terminal
    pub capture: bool,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            capture: true,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn inherit_output(mut self) -> Self {
        self.capture = false;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            f.write_str(&self.program)
        } else {
            write!(f, "{} {}", self.program, self.args.iter().join(" "))
        }
    }
}

/// What came back from a finished (or killed) command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Completion {
    // None if the process was ended by a signal or timed out
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl Completion {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status == Some(0)
    }
}

/// Seam between the harness and the operating system, every external command goes through it
pub trait Launcher {
    fn launch(&mut self, invocation: &Invocation) -> io::Result<Completion>;
}

/// Runs invocations as real child processes
#[derive(Debug, Default)]
pub struct SystemLauncher;

impl Launcher for SystemLauncher {
    fn launch(&mut self, invocation: &Invocation) -> io::Result<Completion> {
        debug!(command = %invocation, cwd = ?invocation.cwd, "Launching");

        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args).envs(&invocation.env);
        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }
        if invocation.capture {
            command
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }

        let mut child = command.spawn()?;

        let Some(timeout) = invocation.timeout else {
            let output = child.wait_with_output()?;
            let completion = Completion {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                timed_out: false,
            };
            trace!(?completion, "Finished");

            return Ok(completion);
        };

        match child.wait_timeout(timeout)? {
            Some(status) => {
                let mut completion = Completion {
                    status: status.code(),
                    ..Default::default()
                };
                if let Some(mut stdout) = child.stdout.take() {
                    stdout.read_to_string(&mut completion.stdout)?;
                }
                if let Some(mut stderr) = child.stderr.take() {
                    stderr.read_to_string(&mut completion.stderr)?;
                }
                trace!(?completion, "Finished");

                Ok(completion)
            }
            None => {
                // child hasn't exited yet
                warn!(command = %invocation, ?timeout, "Timed out, killing child");
                child.kill()?;
                child.wait()?;

                Ok(Completion {
                    timed_out: true,
                    ..Default::default()
                })
            }
        }
    }
}

/// Logs invocations instead of running them and answers with made up job ids.
///
/// Every whitespace separated field of the answer carries the id, so any configured
/// `job_id_field` up to `fields` parses.
#[derive(Debug)]
pub struct DryRunLauncher {
    fields: usize,
    issued: u64,
    pub launched: Vec<Invocation>,
}

impl DryRunLauncher {
    pub fn new(fields: usize) -> Self {
        Self {
            fields: fields.max(1),
            issued: 0,
            launched: Vec::new(),
        }
    }
}

impl Launcher for DryRunLauncher {
    fn launch(&mut self, invocation: &Invocation) -> io::Result<Completion> {
        self.issued += 1;
        let id = format!("dry-run-{}", self.issued);
        info!(command = %invocation, env = ?invocation.env, "Dry run, not launching");
        self.launched.push(invocation.clone());

        Ok(Completion {
            status: Some(0),
            stdout: std::iter::repeat(id.as_str()).take(self.fields).join(" "),
            stderr: String::new(),
            timed_out: false,
        })
    }
}
