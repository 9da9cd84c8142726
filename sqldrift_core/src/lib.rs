//! Coverage-guided, schema-aware differential fuzzing of SQL engines.
//!
//! Seed statements are parsed, mutated against a schema, executed on a
//! reference and a candidate engine build, and the two outcomes are
//! classified into a [`Verdict`].

pub mod artifact;
pub mod config;
pub mod corpus;
pub mod executor;
pub mod feedback;
pub mod mutator;
pub mod observer;
pub mod oracle;
pub mod scheduler;
pub mod schema;
pub mod sql;

pub use artifact::{ArtifactError, ArtifactSink, DirectoryArtifactSink, InMemoryArtifactSink};
pub use config::SqlDriftConfig;
pub use corpus::{CorpusError, WorkItem, WorkQueue, load_seed_statements};
pub use executor::{
    CommandConfig, DifferentialExecutor, ExecutionOutcome, Executor, ExecutorError,
    InProcessExecutor, InputDelivery, ProcessOutput,
};
pub use feedback::CoverageFeedback;
pub use mutator::{MutationTechnique, Mutator, SqlMutator};
pub use observer::{CommandCoverageObserver, CoverageObserver, NoOpCoverageObserver};
pub use oracle::{BugCategory, BugReport, DifferentialOracle, Oracle, Verdict};
pub use scheduler::{FuzzStats, Scheduler, SchedulerConfig, SchedulerError};
pub use schema::{ColumnType, Schema, SchemaError, TableSchema};
