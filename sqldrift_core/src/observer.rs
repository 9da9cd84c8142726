use crate::executor::{CommandConfig, CommandRunner, ExecutorError};
use regex::Regex;
use tracing::debug;

/// Default pattern for gcov's summary line, e.g. `Lines executed:42.17% of 1234`.
pub const DEFAULT_COVERAGE_PATTERN: &str = r"Lines executed:\s*([0-9.]+)%";

/// A `CoverageObserver` reads the reference engine's cumulative line
/// coverage after a run.
///
/// The reading is an opaque percentage in `[0, 100]` used only to decide
/// whether a mutant is interesting. Failing to obtain it is an
/// infrastructure error, never a verdict.
pub trait CoverageObserver: Send {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Discards accumulated coverage data.
    fn reset(&mut self) -> Result<(), ExecutorError>;

    /// Returns the coverage accumulated since the last reset.
    fn collect(&mut self) -> Result<f64, ExecutorError>;
}

/// Reports zero coverage. Used when no coverage command is configured; every
/// mutant then looks uninteresting unless it finds a bug.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoOpCoverageObserver;

impl CoverageObserver for NoOpCoverageObserver {
    fn name(&self) -> &'static str {
        "NoOpCoverageObserver"
    }

    fn reset(&mut self) -> Result<(), ExecutorError> {
        Ok(())
    }

    fn collect(&mut self) -> Result<f64, ExecutorError> {
        Ok(0.0)
    }
}

/// Runs an external coverage tool and extracts the percentage from its
/// standard output with a regex whose first capture group is the number.
#[derive(Debug, Clone)]
pub struct CommandCoverageObserver {
    coverage: CommandRunner,
    reset: Option<CommandRunner>,
    pattern: Regex,
}

impl CommandCoverageObserver {
    pub fn new(command: CommandConfig, reset: Option<CommandConfig>, pattern: Regex) -> Self {
        Self {
            coverage: CommandRunner::new(command),
            reset: reset.map(CommandRunner::new),
            pattern,
        }
    }

    /// Pulls the percentage out of the coverage command output.
    pub fn parse_coverage(&self, output: &str) -> Result<f64, ExecutorError> {
        let not_found = || ExecutorError::CoverageNotFound {
            pattern: self.pattern.as_str().to_string(),
            output: output.to_string(),
        };
        let captures = self.pattern.captures(output).ok_or_else(not_found)?;
        let value: f64 = captures
            .get(1)
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(not_found)?;
        if !(0.0..=100.0).contains(&value) {
            return Err(ExecutorError::CoverageOutOfRange(value));
        }
        Ok(value)
    }
}

impl CoverageObserver for CommandCoverageObserver {
    fn name(&self) -> &'static str {
        "CommandCoverageObserver"
    }

    fn reset(&mut self) -> Result<(), ExecutorError> {
        let Some(reset) = &self.reset else {
            return Ok(());
        };
        let output = reset.run(b"")?;
        if !output.success() {
            return Err(ExecutorError::CoverageCommandFailed {
                command: reset.command().to_vec(),
                status: describe_exit(output.exit_code, output.signal),
            });
        }
        Ok(())
    }

    fn collect(&mut self) -> Result<f64, ExecutorError> {
        let output = self.coverage.run(b"")?;
        if !output.success() {
            return Err(ExecutorError::CoverageCommandFailed {
                command: self.coverage.command().to_vec(),
                status: describe_exit(output.exit_code, output.signal),
            });
        }
        let coverage = self.parse_coverage(&String::from_utf8_lossy(&output.stdout))?;
        debug!(coverage, "Collected coverage");
        Ok(coverage)
    }
}

fn describe_exit(code: Option<i32>, signal: Option<i32>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "unknown status".to_string(),
    }
}
