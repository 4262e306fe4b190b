use crate::config::{ConfigErrors, HostConfig};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Where the harness is running, decides how tasks are launched
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Slurm cluster, tasks go through sbatch
    Slurm,
    /// PBS/Torque cluster, tasks go through qsub
    Pbs,
    /// Interactive machine, a single task runs in the foreground
    Local,
}

impl Environment {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Slurm => "slurm",
            Self::Pbs => "pbs",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What to do with a host that matches none of the configured globs
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UnknownHostPolicy {
    #[default]
    Local,
    Error,
}

#[derive(Error, Debug)]
pub enum EnvironmentError {
    #[error("Host '{0}' does not match any configured environment")]
    UnknownHost(String),
    #[error("Failed to retrieve hostname")]
    Hostname(#[from] nix::Error),
}

/// Compiled host globs, one set per environment
#[derive(Debug, Clone)]
pub struct HostRules {
    slurm: GlobSet,
    pbs: GlobSet,
    local: GlobSet,
    policy: UnknownHostPolicy,
}

fn compile_set(patterns: &[String]) -> Result<GlobSet, ConfigErrors> {
    let mut builder = GlobSetBuilder::new();

    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }

    Ok(builder.build()?)
}

/// first field of a dotted host name, `login-1.cluster.org` -> `login-1`
pub fn short_hostname(identifier: &str) -> &str {
    identifier.split('.').next().unwrap_or(identifier)
}

pub fn current_hostname() -> Result<String, EnvironmentError> {
    match nix::unistd::gethostname() {
        Ok(hostname) => Ok(hostname.to_string_lossy().into_owned()),
        Err(e) => {
            error!(error = ?e, "Failed to retrieve hostname for environment detection: {e}");

            Err(e.into())
        }
    }
}

impl HostRules {
    pub fn compile(config: &HostConfig) -> Result<Self, ConfigErrors> {
        Ok(Self {
            slurm: compile_set(&config.slurm)?,
            pbs: compile_set(&config.pbs)?,
            local: compile_set(&config.local)?,
            policy: config.on_unknown_host,
        })
    }

    /// Map an identifier (usually the hostname) onto an environment, without any fallback
    pub fn classify(&self, identifier: &str) -> Result<Environment, EnvironmentError> {
        let host = short_hostname(identifier);

        [
            (Environment::Slurm, &self.slurm),
            (Environment::Pbs, &self.pbs),
            (Environment::Local, &self.local),
        ]
        .into_iter()
        .find(|(_, set)| set.is_match(host))
        .map(|(environment, _)| environment)
        .ok_or_else(|| EnvironmentError::UnknownHost(host.to_string()))
    }

    /// `classify` with the configured policy applied to unknown hosts
    pub fn resolve(&self, identifier: &str) -> Result<Environment, EnvironmentError> {
        match self.classify(identifier) {
            Ok(environment) => {
                debug!(host = identifier, %environment, "Classified host");

                Ok(environment)
            }
            Err(EnvironmentError::UnknownHost(host)) if self.policy == UnknownHostPolicy::Local => {
                warn!("Host {host} matches no configured cluster, running locally");

                Ok(Environment::Local)
            }
            Err(e) => Err(e),
        }
    }
}
