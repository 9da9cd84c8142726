use crate::artifact::{ArtifactError, ArtifactSink, InMemoryArtifactSink};
use crate::corpus::{WorkItem, WorkQueue};
use crate::executor::{ExecutionOutcome, Executor, ExecutorError};
use crate::feedback::{CoverageFeedback, DEFAULT_COVERAGE_EPSILON};
use crate::mutator::{MutationTechnique, Mutator};
use crate::oracle::{BugCategory, DifferentialOracle, Oracle, Verdict};
use rand::seq::IndexedRandom;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failures that abort a run. Verdicts, including crashes, never end up here.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Differential execution failed: {0}")]
    Execution(#[from] ExecutorError),
    #[error("Artifact export failed: {0}")]
    Artifact(#[from] ArtifactError),
}

/// Run-wide counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FuzzStats {
    /// Accepted mutants that behaved the same on both engines but gained coverage.
    pub queries_executed: u64,
    pub bugs_found: u64,
    pub crashes_found: u64,
    pub syntax_errors: u64,
    /// Every oracle call, including seed calibration.
    pub executions: u64,
    pub iterations: u64,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Mutation rounds an item gets before it must show a coverage gain.
    pub max_mutations: u32,
    /// Mutants requested per round.
    pub mutation_attempts: usize,
    pub coverage_epsilon: f64,
    pub techniques: Vec<MutationTechnique>,
    /// Extra attempts for an oracle call that failed with an infrastructure error.
    pub infra_retries: u32,
    pub max_iterations: Option<u64>,
    pub calibrate_seeds: bool,
    pub dedup_mutants: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_mutations: 2,
            mutation_attempts: 3,
            coverage_epsilon: DEFAULT_COVERAGE_EPSILON,
            techniques: MutationTechnique::ALL.to_vec(),
            infra_retries: 1,
            max_iterations: None,
            calibrate_seeds: true,
            dedup_mutants: false,
        }
    }
}

/// Coverage-guided work-queue scheduler.
///
/// Owns the queue and the counters. Each iteration pops one item, mutates
/// it, runs every mutant through the oracle and decides what goes back on
/// the queue.
pub struct Scheduler {
    config: SchedulerConfig,
    queue: WorkQueue,
    stats: FuzzStats,
    rng: ChaCha8Rng,
    mutator: Box<dyn Mutator>,
    executor: Box<dyn Executor>,
    oracle: Box<dyn Oracle>,
    artifacts: Box<dyn ArtifactSink>,
    feedback: CoverageFeedback,
    stop: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        mutator: Box<dyn Mutator>,
        executor: Box<dyn Executor>,
        rng: ChaCha8Rng,
    ) -> Self {
        let feedback =
            CoverageFeedback::new(config.coverage_epsilon).with_dedup(config.dedup_mutants);
        Self {
            config,
            queue: WorkQueue::new(),
            stats: FuzzStats::default(),
            rng,
            mutator,
            executor,
            oracle: Box::new(DifferentialOracle::default()),
            artifacts: Box::new(InMemoryArtifactSink::new()),
            feedback,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_oracle(mut self, oracle: Box<dyn Oracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_artifact_sink(mut self, artifacts: Box<dyn ArtifactSink>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn add_seed(&mut self, sql: impl Into<String>) {
        self.queue.push(WorkItem::new(sql));
    }

    pub fn enqueue(&mut self, item: WorkItem) {
        self.queue.push(item);
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn stats(&self) -> &FuzzStats {
        &self.stats
    }

    /// Setting the returned flag makes [`Scheduler::run`] stop popping the
    /// queue once the current iteration is done.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Executes every unscored item once and records its coverage as its
    /// first score. Verdicts are logged, not counted.
    pub fn calibrate(&mut self) -> Result<(), SchedulerError> {
        for item in self.queue.iter_mut().filter(|item| !item.is_scored()) {
            let outcome =
                execute_with_retries(self.executor.as_mut(), self.config.infra_retries, &item.sql)?;
            self.stats.executions += 1;
            item.update_coverage(outcome.coverage);
            let verdict = self.oracle.verdict(&outcome);
            if verdict != Verdict::Same {
                warn!(sql = %item.sql, %verdict, "Seed does not behave the same on both engines");
            }
            debug!(sql = %item.sql, coverage = outcome.coverage, "Calibrated seed");
        }
        Ok(())
    }

    /// Runs one iteration. Returns `false` when the queue was empty.
    pub fn step(&mut self) -> Result<bool, SchedulerError> {
        let Some(mut item) = self.queue.pop() else {
            return Ok(false);
        };
        self.stats.iterations += 1;

        if item.mutation_count >= self.config.max_mutations {
            if !item.has_new_coverage() {
                debug!(sql = %item.sql, "Retiring exhausted item");
                return Ok(true);
            }
            item.reset_mutation_count();
        }

        let technique = self
            .config
            .techniques
            .choose(&mut self.rng)
            .copied()
            .unwrap_or(MutationTechnique::Generic);
        item.last_technique = Some(technique);
        let mutants = self.mutator.mutate(
            &item.sql,
            technique,
            self.config.mutation_attempts,
            &mut self.rng,
        );
        debug!(%technique, count = mutants.len(), "Generated mutants");

        let parent_coverage = item.new_coverage.unwrap_or(0.0);
        let mut last_coverage = None;
        for mutant in mutants {
            let outcome = execute_with_retries(
                self.executor.as_mut(),
                self.config.infra_retries,
                &mutant,
            )?;
            self.stats.executions += 1;
            last_coverage = Some(outcome.coverage);
            self.process_outcome(mutant, &outcome, parent_coverage)?;
        }

        item.mutation_count += 1;
        let Some(coverage) = last_coverage.or(item.new_coverage) else {
            debug!(sql = %item.sql, "Retiring unscored item without mutants");
            return Ok(true);
        };
        item.update_coverage(coverage);
        if self.feedback.exceeds_epsilon(item.coverage_gain()) {
            self.queue.push(item);
        } else {
            debug!(sql = %item.sql, "Retiring item without coverage gain");
        }
        Ok(true)
    }

    fn process_outcome(
        &mut self,
        mutant: String,
        outcome: &ExecutionOutcome,
        parent_coverage: f64,
    ) -> Result<(), SchedulerError> {
        let (verdict, report) = self.oracle.examine(&mutant, outcome);
        debug!(%verdict, coverage = outcome.coverage, "Classified mutant");
        if let Some(report) = report {
            let counter = match report.category {
                BugCategory::Crash => &mut self.stats.crashes_found,
                BugCategory::Logical => &mut self.stats.bugs_found,
            };
            let sequence_number = *counter;
            *counter += 1;
            info!(
                category = %report.category,
                hash = %report.sql_hash,
                sql = %report.sql,
                "{}",
                report.description
            );
            self.artifacts
                .export(&mutant, sequence_number, report.category)?;
            self.queue.push(WorkItem::scored(mutant, outcome.coverage));
            return Ok(());
        }

        match verdict {
            Verdict::SyntaxError => self.stats.syntax_errors += 1,
            Verdict::Same
                if self
                    .feedback
                    .is_interesting(&mutant, outcome.coverage, parent_coverage) =>
            {
                self.feedback.report_interesting(&mutant);
                self.stats.queries_executed += 1;
                self.queue.push(WorkItem::scored(mutant, outcome.coverage));
            }
            _ => {}
        }
        Ok(())
    }

    /// Resets coverage, calibrates seeds if configured, then iterates until
    /// the queue is empty, the iteration cap is hit or a stop is requested.
    pub fn run(&mut self) -> Result<FuzzStats, SchedulerError> {
        self.executor.reset_coverage()?;
        if self.config.calibrate_seeds {
            self.calibrate()?;
        }
        info!(seeds = self.queue.len(), "Starting fuzz loop");
        let start_time = Instant::now();

        while !self.stop.load(Ordering::Relaxed) {
            if self
                .config
                .max_iterations
                .is_some_and(|max| self.stats.iterations >= max)
            {
                info!("Iteration limit reached");
                break;
            }
            if !self.step()? {
                info!("Work queue exhausted");
                break;
            }
            let elapsed = start_time.elapsed().as_secs_f64();
            let execs_per_sec = if elapsed > 0.0 {
                self.stats.executions as f64 / elapsed
            } else {
                0.0
            };
            info!(
                iteration = self.stats.iterations,
                queue = self.queue.len(),
                queries = self.stats.queries_executed,
                bugs = self.stats.bugs_found,
                crashes = self.stats.crashes_found,
                syntax_errors = self.stats.syntax_errors,
                execs_per_sec = format_args!("{execs_per_sec:.2}"),
                "Status"
            );
        }
        info!(
            elapsed = ?start_time.elapsed(),
            executions = self.stats.executions,
            "Fuzz loop finished"
        );
        Ok(self.stats.clone())
    }
}

fn execute_with_retries(
    executor: &mut dyn Executor,
    retries: u32,
    sql: &str,
) -> Result<ExecutionOutcome, ExecutorError> {
    let mut attempt = 0;
    loop {
        match executor.execute(sql) {
            Ok(outcome) => return Ok(outcome),
            Err(e) if attempt < retries => {
                attempt += 1;
                warn!(error = %e, attempt, "Execution failed, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}
