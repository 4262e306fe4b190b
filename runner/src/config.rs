use crate::environment::{HostRules, UnknownHostPolicy};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
    #[error("Failed to read config file {path:?}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file")]
    Parse(#[from] serde_yaml::Error),
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[source] std::io::Error),
    #[error("Config failed preflight checks, see the log above")]
    Preflight,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    // what is being simulated, forwarded to every task
    pub study: StudyConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    // host name globs per environment
    #[serde(default)]
    pub hosts: HostConfig,
    pub slurm: Option<QueueConfig>,
    pub pbs: Option<QueueConfig>,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub provenance: ProvenanceConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct StudyConfig {
    pub model: String,
    pub loci: u32,
    // number of replicates shared out over the array tasks
    #[serde(alias = "nsims")]
    pub reps: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    #[serde(default = "default_narray")]
    pub narray: u32,
    #[serde(default = "default_submit_delay")]
    pub submit_delay_ms: u64,
    #[serde(default = "default_countdown")]
    pub countdown_secs: u64,
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            narray: default_narray(),
            submit_delay_ms: default_submit_delay(),
            countdown_secs: default_countdown(),
            output_root: default_output_root(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    #[serde(default)]
    pub slurm: Vec<String>,
    #[serde(default)]
    pub pbs: Vec<String>,
    #[serde(default)]
    pub local: Vec<String>,
    #[serde(default)]
    pub on_unknown_host: UnknownHostPolicy,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    // batch script handed to the submission command
    pub script: PathBuf,
    // falls back to sbatch/qsub
    pub command: Option<String>,
    // whitespace separated field of the submission response holding the job id
    pub job_id_field: Option<usize>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    #[serde(default = "default_program")]
    pub program: PathBuf,
    // first argument of the program, relative to where the harness was started
    #[serde(default = "default_script")]
    pub script: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    // extra variables on top of the fixed task environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub timeout_secs: Option<u64>,
}

impl SimulationConfig {
    /// program, made absolute when it is an explicit relative path, bare names stay for PATH lookup
    pub fn resolved_program(&self, working_dir: &Path) -> PathBuf {
        if self.program.components().count() > 1 {
            working_dir.join(&self.program)
        } else {
            self.program.clone()
        }
    }

    pub fn resolved_script(&self, working_dir: &Path) -> Option<PathBuf> {
        self.script.as_ref().map(|script| working_dir.join(script))
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            script: default_script(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout_secs: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct CleanupConfig {
    #[serde(default)]
    pub enabled: bool,
    pub script: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ProvenanceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    // repository to describe, defaults to the working directory
    pub repository: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub legacy_svn_marker: bool,
}

impl Default for ProvenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            repository: None,
            legacy_svn_marker: true,
        }
    }
}

/// Values given on the command line that take precedence over the file
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub model: Option<String>,
    pub loci: Option<u32>,
    pub reps: Option<u32>,
    pub narray: Option<u32>,
    pub output_root: Option<PathBuf>,
    pub cleanup: Option<bool>,
}

impl HarnessConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path).map_err(|source| ConfigErrors::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(model) = overrides.model {
            self.study.model = model;
        }
        if let Some(loci) = overrides.loci {
            self.study.loci = loci;
        }
        if let Some(reps) = overrides.reps {
            self.study.reps = reps;
        }
        if let Some(narray) = overrides.narray {
            self.dispatch.narray = narray;
        }
        if let Some(output_root) = overrides.output_root {
            self.dispatch.output_root = output_root;
        }
        if let Some(cleanup) = overrides.cleanup {
            self.cleanup.enabled = cleanup;
        }
    }

    /// Check the whole config and log every problem found, returns true if any was an error.
    /// Relative simulation paths are looked up in `working_dir`.
    pub fn preflight_checks(&self, working_dir: &Path) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        let model = &self.study.model;
        if model.is_empty() || model.contains(['/', '\\']) {
            error!("study.model ({model:?}) must be non-empty and must not contain path separators");
            contains_error = true;
        }
        if self.study.loci == 0 {
            error!("study.loci cannot be 0");
            contains_error = true;
        }
        if self.study.reps == 0 {
            error!("study.reps cannot be 0, there would be nothing to simulate");
            contains_error = true;
        }
        if self.dispatch.narray == 0 {
            error!("dispatch.narray cannot be 0, at least one array task is needed");
            contains_error = true;
        }
        if self.dispatch.narray > self.study.reps {
            warn!(
                "dispatch.narray ({}) exceeds study.reps ({}), some tasks will find no work",
                self.dispatch.narray, self.study.reps
            );
        }

        if let Err(e) = HostRules::compile(&self.hosts) {
            error!("hosts contains an invalid glob: {e}");
            contains_error = true;
        }

        for (name, hosts, queue) in [
            ("slurm", &self.hosts.slurm, &self.slurm),
            ("pbs", &self.hosts.pbs, &self.pbs),
        ] {
            match queue {
                None if !hosts.is_empty() => {
                    error!("hosts.{name} is set but the {name} section is missing");
                    contains_error = true;
                }
                Some(queue) if !queue.script.is_file() => {
                    error!(
                        "Failed to find {name}.script. Either not a file or not found at {}",
                        queue.script.to_string_lossy()
                    );
                    contains_error = true;
                }
                _ => {}
            }
        }

        if self.cleanup.enabled {
            match &self.cleanup.script {
                None => {
                    error!("cleanup.enabled is set but cleanup.script is missing");
                    contains_error = true;
                }
                Some(script) if !script.is_file() => {
                    error!(
                        "Failed to find cleanup.script at {}",
                        script.to_string_lossy()
                    );
                    contains_error = true;
                }
                Some(_) => {}
            }
        }

        if let Some(script) = self.simulation.resolved_script(working_dir) {
            if !script.is_file() {
                error!(
                    "Failed to find simulation.script. Either not a file or not found at {}",
                    script.to_string_lossy()
                );
                contains_error = true;
            }
        }

        // a bare program name is resolved through PATH at launch, only check explicit paths
        let program = self.simulation.resolved_program(working_dir);
        if program.components().count() > 1 {
            match check_executable(&program) {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        "simulation.program {} is not executable, this might cause problems",
                        program.to_string_lossy()
                    );
                }
                Err(e) => {
                    error!(
                        "Failed to determine if simulation.program ({}) is an executable: {e}",
                        program.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        contains_error
    }
}

fn default_narray() -> u32 {
    20
}

fn default_submit_delay() -> u64 {
    1000
}

fn default_countdown() -> u64 {
    3
}

fn default_output_root() -> PathBuf {
    PathBuf::from("runs")
}

fn default_program() -> PathBuf {
    PathBuf::from("python")
}

fn default_script() -> Option<PathBuf> {
    Some(PathBuf::from("array_cGPsim.py"))
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const MINIMAL: &str = "
study:
  model: adjmotifshaploid
  loci: 3
  reps: 2
";

    pub fn minimal() -> HarnessConfig {
        serde_yaml::from_str(MINIMAL).unwrap()
    }

    /// directory holding the default simulation script, as a checkout of the study would
    pub fn study_checkout() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("array_cGPsim.py"), "").unwrap();

        dir
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config = minimal();

        assert_eq!(config.dispatch.narray, 20);
        assert_eq!(config.dispatch.submit_delay_ms, 1000);
        assert_eq!(config.dispatch.countdown_secs, 3);
        assert_eq!(config.simulation.program, PathBuf::from("python"));
        assert_eq!(config.simulation.script, Some(PathBuf::from("array_cGPsim.py")));
        assert!(!config.cleanup.enabled);
        assert!(config.provenance.enabled);
        assert!(config.provenance.legacy_svn_marker);
        assert_eq!(config.hosts.on_unknown_host, UnknownHostPolicy::Local);
        assert!(!config.preflight_checks(study_checkout().path()));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = format!("{MINIMAL}\nqueue: slurm\n");

        assert!(serde_yaml::from_str::<HarnessConfig>(&yaml).is_err());
    }

    #[test]
    fn overrides_take_precedence() {
        let mut config = minimal();
        config.apply(Overrides {
            narray: Some(4),
            reps: Some(50),
            cleanup: Some(true),
            ..Default::default()
        });

        assert_eq!(config.dispatch.narray, 4);
        assert_eq!(config.study.reps, 50);
        assert_eq!(config.study.loci, 3);
        assert!(config.cleanup.enabled);
    }

    #[test]
    fn preflight_reports_every_problem() {
        let mut config = minimal();
        config.study.model = "adj/motif".to_string();
        config.dispatch.narray = 0;
        config.hosts.slurm = vec!["stallo*".to_string()];
        config.cleanup.enabled = true;

        assert!(config.preflight_checks(study_checkout().path()));
    }

    #[test]
    fn preflight_needs_existing_queue_script() {
        let dir = study_checkout();
        let script = dir.path().join("array.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();

        let mut config = minimal();
        config.hosts.slurm = vec!["stallo*".to_string()];
        config.slurm = Some(QueueConfig {
            script: script.clone(),
            command: None,
            job_id_field: None,
            args: Vec::new(),
        });
        assert!(!config.preflight_checks(dir.path()));

        config.slurm.as_mut().unwrap().script = dir.path().join("missing.sh");
        assert!(config.preflight_checks(dir.path()));
    }

    #[test]
    fn simulation_script_is_looked_up_in_working_dir() {
        let config = minimal();
        let checkout = study_checkout();
        let elsewhere = tempfile::tempdir().unwrap();

        assert!(!config.preflight_checks(checkout.path()));
        assert!(config.preflight_checks(elsewhere.path()));
        assert_eq!(
            config.simulation.resolved_script(checkout.path()),
            Some(checkout.path().join("array_cGPsim.py"))
        );
    }

    #[test]
    fn script_can_be_disabled_for_standalone_programs() {
        let yaml = format!("{MINIMAL}\nsimulation:\n  program: ./bin/cgpsim\n  script: null\n");
        let config: HarnessConfig = serde_yaml::from_str(&yaml).unwrap();
        let checkout = tempfile::tempdir().unwrap();

        assert_eq!(config.simulation.resolved_script(checkout.path()), None);
        assert_eq!(
            config.simulation.resolved_program(checkout.path()),
            checkout.path().join("./bin/cgpsim")
        );
        // the program itself is missing
        assert!(config.preflight_checks(checkout.path()));
        assert_eq!(minimal().simulation.resolved_program(checkout.path()), PathBuf::from("python"));
    }

    #[test]
    fn load_reads_yaml_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.yaml");
        fs::write(
            &path,
            format!("{MINIMAL}\ndispatch:\n  narray: 5\nhosts:\n  slurm: [\"stallo*\"]\n  on_unknown_host: error\n"),
        )
        .unwrap();

        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.dispatch.narray, 5);
        assert_eq!(config.hosts.slurm, vec!["stallo*".to_string()]);
        assert_eq!(config.hosts.on_unknown_host, UnknownHostPolicy::Error);

        assert!(matches!(
            HarnessConfig::load(&dir.path().join("nope.yaml")),
            Err(ConfigErrors::Read { .. })
        ));
    }
}
