use crate::observer::{CoverageObserver, NoOpCoverageObserver};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Infrastructure failures: the engines could not be run or observed.
///
/// A target crash is never reported through this type; it is a normal
/// [`ExecutionOutcome`] whose output carries the crash evidence.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Engine command is empty")]
    EmptyCommand,
    #[error("Failed to spawn command {command:?}: {source}")]
    Spawn {
        command: Vec<String>,
        #[source]
        source: io::Error,
    },
    #[error("I/O error while running {command:?}: {source}")]
    Io {
        command: Vec<String>,
        #[source]
        source: io::Error,
    },
    #[error("Failed to stage input file: {0}")]
    InputFile(#[source] io::Error),
    #[error("Temp file path is not valid UTF-8")]
    NonUtf8Path,
    #[error("Command {command:?} timed out after {timeout:?}")]
    Timeout {
        command: Vec<String>,
        timeout: Duration,
    },
    #[error("Pipe thread for {command:?} panicked")]
    PipeThreadPanicked { command: Vec<String> },
    #[error("Coverage command {command:?} exited with {status}")]
    CoverageCommandFailed { command: Vec<String>, status: String },
    #[error("Coverage command output did not match /{pattern}/: {output:?}")]
    CoverageNotFound { pattern: String, output: String },
    #[error("Coverage value {0} is not a percentage")]
    CoverageOutOfRange(f64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputDelivery {
    StdIn,
    /// Writes the input to a temp file and substitutes its path for `{}`.
    File(String),
}

#[derive(Debug, Clone)]
pub struct CommandConfig {
    pub command: Vec<String>,
    pub input_delivery: InputDelivery,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
}

/// Captured result of one process run, with stdout and stderr trimmed of
/// surrounding ASCII whitespace.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    fn from_raw(stdout: Vec<u8>, stderr: Vec<u8>, status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        let mut stderr = stderr.trim_ascii().to_vec();
        // Signal deaths print nothing themselves; record them so crash markers can see them.
        if let Some(signal) = signal {
            if !stderr.is_empty() {
                stderr.push(b'\n');
            }
            stderr.extend_from_slice(format!("Terminated by signal {signal}").as_bytes());
        }
        Self {
            stdout: stdout.trim_ascii().to_vec(),
            stderr,
            exit_code: status.code(),
            signal,
        }
    }
}

/// Everything one differential run produced: coverage after the reference
/// run plus the raw streams of both engines.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub coverage: f64,
    pub reference: ProcessOutput,
    pub candidate: ProcessOutput,
}

/// Runs one SQL statement against the reference and the candidate engine.
pub trait Executor {
    fn execute(&mut self, sql: &str) -> Result<ExecutionOutcome, ExecutorError>;

    /// Clears accumulated coverage so later readings start from zero.
    fn reset_coverage(&mut self) -> Result<(), ExecutorError>;
}

/// Runs outcomes produced by a closure, for harness-style setups where the
/// engines live in the fuzzer's own process.
pub struct InProcessExecutor<F>
where
    F: FnMut(&str) -> ExecutionOutcome,
{
    harness_fn: F,
}

impl<F> InProcessExecutor<F>
where
    F: FnMut(&str) -> ExecutionOutcome,
{
    pub fn new(harness_fn: F) -> Self {
        Self { harness_fn }
    }
}

impl<F> Executor for InProcessExecutor<F>
where
    F: FnMut(&str) -> ExecutionOutcome,
{
    fn execute(&mut self, sql: &str) -> Result<ExecutionOutcome, ExecutorError> {
        Ok((self.harness_fn)(sql))
    }

    fn reset_coverage(&mut self) -> Result<(), ExecutorError> {
        Ok(())
    }
}

/// A process invocation with input delivery and a wall-clock timeout.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    config: CommandConfig,
}

impl CommandRunner {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }

    pub fn command(&self) -> &[String] {
        &self.config.command
    }

    pub fn run(&self, input: &[u8]) -> Result<ProcessOutput, ExecutorError> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or(ExecutorError::EmptyCommand)?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }

        // Kept alive until the child has exited.
        let _input_file = match &self.config.input_delivery {
            InputDelivery::StdIn => {
                cmd.stdin(Stdio::piped());
                None
            }
            InputDelivery::File(template) => {
                let file = tempfile::NamedTempFile::new().map_err(ExecutorError::InputFile)?;
                File::create(file.path())
                    .and_then(|mut f| f.write_all(input))
                    .map_err(ExecutorError::InputFile)?;
                let path = file.path().to_str().ok_or(ExecutorError::NonUtf8Path)?;
                for part in template.replace("{}", path).split_whitespace() {
                    cmd.arg(part);
                }
                cmd.stdin(Stdio::null());
                Some(file)
            }
        };
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
            command: self.config.command.clone(),
            source,
        })?;

        let stdout_reader = child.stdout.take().map(spawn_reader::<ChildStdout>);
        let stderr_reader = child.stderr.take().map(spawn_reader::<ChildStderr>);

        let stdin_writer = child
            .stdin
            .take()
            .map(|stdin| spawn_writer(stdin, input.to_vec()));

        let status = match self.wait_with_timeout(&mut child) {
            Ok(status) => status,
            Err(e) => {
                // Processes the engine forked may still hold the pipes. The
                // helper threads are detached and exit once the pipes close.
                drop((stdin_writer, stdout_reader, stderr_reader));
                return Err(e);
            }
        };
        if let Some(writer) = stdin_writer {
            writer
                .join()
                .map_err(|_| ExecutorError::PipeThreadPanicked {
                    command: self.config.command.clone(),
                })?
                .map_err(|e| self.io_error(e))?;
        }
        let stdout = self.join_reader(stdout_reader)?;
        let stderr = self.join_reader(stderr_reader)?;
        Ok(ProcessOutput::from_raw(stdout, stderr, status))
    }

    fn wait_with_timeout(&self, child: &mut Child) -> Result<ExitStatus, ExecutorError> {
        let start_time = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if start_time.elapsed() > self.config.timeout {
                        warn!(command = ?self.config.command, "Engine timed out, killing");
                        if let Err(e) = child.kill() {
                            return Err(self.io_error(e));
                        }
                        let _ = child.wait();
                        return Err(ExecutorError::Timeout {
                            command: self.config.command.clone(),
                            timeout: self.config.timeout,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(self.io_error(e)),
            }
        }
    }

    fn join_reader(
        &self,
        reader: Option<JoinHandle<io::Result<Vec<u8>>>>,
    ) -> Result<Vec<u8>, ExecutorError> {
        let Some(handle) = reader else {
            return Ok(Vec::new());
        };
        handle
            .join()
            .map_err(|_| ExecutorError::PipeThreadPanicked {
                command: self.config.command.clone(),
            })?
            .map_err(|e| self.io_error(e))
    }

    fn io_error(&self, source: io::Error) -> ExecutorError {
        ExecutorError::Io {
            command: self.config.command.clone(),
            source,
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<io::Result<Vec<u8>>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

fn spawn_writer(mut stdin: ChildStdin, input: Vec<u8>) -> JoinHandle<io::Result<()>> {
    std::thread::spawn(move || match stdin.write_all(&input) {
        // An engine may exit without reading its input.
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    })
}

/// Terminates the statement so shell-style engines execute it.
fn engine_input(sql: &str) -> Vec<u8> {
    let trimmed = sql.trim_end();
    let mut input = String::with_capacity(trimmed.len() + 2);
    input.push_str(trimmed);
    if !trimmed.ends_with(';') {
        input.push(';');
    }
    input.push('\n');
    input.into_bytes()
}

/// The differential oracle backed by two engine processes.
///
/// The reference engine runs first and coverage is read right after it, so
/// the reading reflects the reference build only.
pub struct DifferentialExecutor {
    reference: CommandRunner,
    candidate: CommandRunner,
    coverage: Box<dyn CoverageObserver>,
}

impl DifferentialExecutor {
    pub fn new(reference: CommandConfig, candidate: CommandConfig) -> Self {
        Self {
            reference: CommandRunner::new(reference),
            candidate: CommandRunner::new(candidate),
            coverage: Box::new(NoOpCoverageObserver),
        }
    }

    pub fn with_coverage(mut self, observer: Box<dyn CoverageObserver>) -> Self {
        self.coverage = observer;
        self
    }
}

impl Executor for DifferentialExecutor {
    fn execute(&mut self, sql: &str) -> Result<ExecutionOutcome, ExecutorError> {
        let input = engine_input(sql);
        let reference = self.reference.run(&input)?;
        let coverage = self.coverage.collect()?;
        let candidate = self.candidate.run(&input)?;
        debug!(
            coverage,
            reference_exit = ?reference.exit_code,
            candidate_exit = ?candidate.exit_code,
            "Executed statement on both engines"
        );
        Ok(ExecutionOutcome {
            coverage,
            reference,
            candidate,
        })
    }

    fn reset_coverage(&mut self) -> Result<(), ExecutorError> {
        debug!(observer = self.coverage.name(), "Resetting coverage");
        self.coverage.reset()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn test_target(name: &str) -> String {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        let path = manifest_dir.join("../test_targets").join(name);
        assert!(path.exists(), "Test target missing: {path:?}");
        path.to_string_lossy().into_owned()
    }

    pub fn script_config(name: &str) -> CommandConfig {
        CommandConfig {
            command: vec!["sh".to_string(), test_target(name)],
            input_delivery: InputDelivery::StdIn,
            timeout: Duration::from_secs(5),
            working_dir: None,
        }
    }
}
