use crate::artifact::DEFAULT_ARTIFACT_DIR;
use crate::executor::{CommandConfig, DifferentialExecutor, InputDelivery};
use crate::feedback::DEFAULT_COVERAGE_EPSILON;
use crate::mutator::MutationTechnique;
use crate::observer::{CommandCoverageObserver, DEFAULT_COVERAGE_PATTERN};
use crate::oracle::{DifferentialOracle, SEGFAULT_MARKER, SIGNAL_MARKER};
use crate::scheduler::SchedulerConfig;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigInputDelivery {
    #[default]
    StdIn,
    File {
        template: String,
    },
}

impl From<ConfigInputDelivery> for InputDelivery {
    fn from(delivery: ConfigInputDelivery) -> Self {
        match delivery {
            ConfigInputDelivery::StdIn => InputDelivery::StdIn,
            ConfigInputDelivery::File { template } => InputDelivery::File(template),
        }
    }
}

/// One engine invocation.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    pub command: Vec<String>,
    #[serde(default)]
    pub input_delivery: ConfigInputDelivery,
    pub working_dir: Option<PathBuf>,
}

impl EngineSettings {
    pub fn to_command_config(&self, timeout: Duration) -> CommandConfig {
        CommandConfig {
            command: self.command.clone(),
            input_delivery: self.input_delivery.clone().into(),
            timeout,
            working_dir: self.working_dir.clone(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CoverageSettings {
    pub command: Vec<String>,
    pub reset_command: Option<Vec<String>>,
    #[serde(default = "default_coverage_pattern")]
    pub pattern: String,
    pub working_dir: Option<PathBuf>,
}

fn default_coverage_pattern() -> String {
    DEFAULT_COVERAGE_PATTERN.to_string()
}

impl CoverageSettings {
    fn command_config(&self, command: &[String], timeout: Duration) -> CommandConfig {
        CommandConfig {
            command: command.to_vec(),
            input_delivery: InputDelivery::StdIn,
            timeout,
            working_dir: self.working_dir.clone(),
        }
    }

    pub fn coverage_command_config(&self, timeout: Duration) -> CommandConfig {
        self.command_config(&self.command, timeout)
    }

    pub fn reset_config(&self, timeout: Duration) -> Option<CommandConfig> {
        self.reset_command
            .as_deref()
            .map(|command| self.command_config(command, timeout))
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutorSettings {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_crash_markers")]
    pub crash_markers: Vec<String>,
    pub reference: EngineSettings,
    pub candidate: EngineSettings,
    #[serde(default)]
    pub coverage: Option<CoverageSettings>,
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_crash_markers() -> Vec<String> {
    vec![SEGFAULT_MARKER.to_string(), SIGNAL_MARKER.to_string()]
}

impl ExecutorSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn oracle(&self) -> DifferentialOracle {
        DifferentialOracle::new(&self.crash_markers)
    }

    /// Wires both engines and, when configured, the coverage command.
    pub fn build_executor(&self) -> Result<DifferentialExecutor, anyhow::Error> {
        let timeout = self.timeout();
        let executor = DifferentialExecutor::new(
            self.reference.to_command_config(timeout),
            self.candidate.to_command_config(timeout),
        );
        let Some(coverage) = &self.coverage else {
            return Ok(executor);
        };
        let pattern = Regex::new(&coverage.pattern).map_err(|e| {
            anyhow::anyhow!("Invalid coverage pattern {:?}: {}", coverage.pattern, e)
        })?;
        if pattern.captures_len() < 2 {
            anyhow::bail!(
                "Coverage pattern {:?} needs a capture group for the percentage",
                coverage.pattern
            );
        }
        let observer = CommandCoverageObserver::new(
            coverage.coverage_command_config(timeout),
            coverage.reset_config(timeout),
            pattern,
        );
        Ok(executor.with_coverage(Box::new(observer)))
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    pub schema_path: Option<PathBuf>,
    #[serde(default)]
    pub seeds: Vec<String>,
    #[serde(default)]
    pub initial_seed_paths: Vec<PathBuf>,
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
}

pub fn default_artifact_dir() -> PathBuf {
    PathBuf::from(DEFAULT_ARTIFACT_DIR)
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            schema_path: None,
            seeds: Vec::new(),
            initial_seed_paths: Vec::new(),
            artifact_dir: default_artifact_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_max_mutations")]
    pub max_mutations: u32,
    #[serde(default = "default_mutation_attempts")]
    pub mutation_attempts: usize,
    #[serde(default = "default_coverage_epsilon")]
    pub coverage_epsilon: f64,
    pub rng_seed: Option<u64>,
    pub max_iterations: Option<u64>,
    #[serde(default = "default_techniques")]
    pub techniques: Vec<MutationTechnique>,
    #[serde(default = "default_true")]
    pub calibrate_seeds: bool,
    #[serde(default = "default_infra_retries")]
    pub infra_retries: u32,
    #[serde(default)]
    pub dedup_mutants: bool,
}

fn default_max_mutations() -> u32 {
    2
}
fn default_mutation_attempts() -> usize {
    3
}
fn default_coverage_epsilon() -> f64 {
    DEFAULT_COVERAGE_EPSILON
}
fn default_techniques() -> Vec<MutationTechnique> {
    MutationTechnique::ALL.to_vec()
}
fn default_true() -> bool {
    true
}
fn default_infra_retries() -> u32 {
    1
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_mutations: default_max_mutations(),
            mutation_attempts: default_mutation_attempts(),
            coverage_epsilon: default_coverage_epsilon(),
            rng_seed: None,
            max_iterations: None,
            techniques: default_techniques(),
            calibrate_seeds: true,
            infra_retries: default_infra_retries(),
            dedup_mutants: false,
        }
    }
}

impl FuzzerSettings {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_mutations: self.max_mutations,
            mutation_attempts: self.mutation_attempts,
            coverage_epsilon: self.coverage_epsilon,
            techniques: self.techniques.clone(),
            infra_retries: self.infra_retries,
            max_iterations: self.max_iterations,
            calibrate_seeds: self.calibrate_seeds,
            dedup_mutants: self.dedup_mutants,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SqlDriftConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub corpus: CorpusConfig,
}

impl SqlDriftConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
        Self::from_toml_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, anyhow::Error> {
        let config: SqlDriftConfig = toml::from_str(content)?;
        if config.executor.reference.command.is_empty() {
            anyhow::bail!("executor.reference.command must not be empty");
        }
        if config.executor.candidate.command.is_empty() {
            anyhow::bail!("executor.candidate.command must not be empty");
        }
        if config.fuzzer.techniques.is_empty() {
            anyhow::bail!("fuzzer.techniques must name at least one technique");
        }
        Ok(config)
    }
}
