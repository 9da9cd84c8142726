use crate::mutator::MutationTechnique;
use crate::sql::{ParseError, split_statements};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// File extension of seed files picked up from seed directories.
pub const SEED_FILE_EXTENSION: &str = "sql";

#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("Failed to read seeds from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to split seed file {path:?} into statements: {source}")]
    Split {
        path: PathBuf,
        #[source]
        source: ParseError,
    },
    #[error("Seed path {0:?} is neither a file nor a directory")]
    InvalidSeedPath(PathBuf),
}

/// A queued SQL candidate plus its mutation history and coverage scores.
///
/// `prev_coverage` is `None` only while the item has never been scored.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub sql: String,
    pub mutation_count: u32,
    pub prev_coverage: Option<f64>,
    pub new_coverage: Option<f64>,
    pub last_technique: Option<MutationTechnique>,
}

impl WorkItem {
    /// An unscored item, as created from a seed.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            mutation_count: 0,
            prev_coverage: None,
            new_coverage: None,
            last_technique: None,
        }
    }

    /// An item whose first score is `coverage`.
    pub fn scored(sql: impl Into<String>, coverage: f64) -> Self {
        let mut item = Self::new(sql);
        item.update_coverage(coverage);
        item
    }

    pub fn is_scored(&self) -> bool {
        self.prev_coverage.is_some()
    }

    /// Shifts the scores: the old `new_coverage` becomes `prev_coverage`.
    /// On the first score both fields become `coverage`.
    pub fn update_coverage(&mut self, coverage: f64) {
        self.prev_coverage = Some(self.new_coverage.unwrap_or(coverage));
        self.new_coverage = Some(coverage);
    }

    /// `new_coverage - prev_coverage`, or 0 for an unscored item.
    pub fn coverage_gain(&self) -> f64 {
        match (self.prev_coverage, self.new_coverage) {
            (Some(prev), Some(new)) => new - prev,
            _ => 0.0,
        }
    }

    pub fn has_new_coverage(&self) -> bool {
        self.coverage_gain() > 0.0
    }

    pub fn reset_mutation_count(&mut self) {
        self.mutation_count = 0;
    }
}

/// FIFO queue of work items, owned by the scheduler.
#[derive(Debug, Default)]
pub struct WorkQueue {
    items: VecDeque<WorkItem>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: WorkItem) {
        self.items.push_back(item);
    }

    pub fn pop(&mut self) -> Option<WorkItem> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkItem> {
        self.items.iter_mut()
    }
}

/// Reads seed statements from files and directories, in the given order.
///
/// Each file may hold several statements separated by semicolons. Files
/// directly inside a directory are read in name order when they carry the
/// `.sql` extension; subdirectories are not traversed.
pub fn load_seed_statements(seed_paths: &[PathBuf]) -> Result<Vec<String>, CorpusError> {
    let mut statements = Vec::new();
    for path in seed_paths {
        if path.is_file() {
            statements.extend(read_seed_file(path)?);
        } else if path.is_dir() {
            let mut files = Vec::new();
            let entries = fs::read_dir(path).map_err(|source| CorpusError::Io {
                path: path.clone(),
                source,
            })?;
            for entry in entries {
                let entry = entry.map_err(|source| CorpusError::Io {
                    path: path.clone(),
                    source,
                })?;
                let file_path = entry.path();
                if file_path.is_file()
                    && file_path.extension().is_some_and(|ext| ext == SEED_FILE_EXTENSION)
                {
                    files.push(file_path);
                }
            }
            files.sort();
            for file in files {
                statements.extend(read_seed_file(&file)?);
            }
        } else {
            return Err(CorpusError::InvalidSeedPath(path.clone()));
        }
    }
    Ok(statements)
}

fn read_seed_file(path: &Path) -> Result<Vec<String>, CorpusError> {
    let script = fs::read_to_string(path).map_err(|source| CorpusError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let statements = split_statements(&script).map_err(|source| CorpusError::Split {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(?path, count = statements.len(), "Loaded seed file");
    Ok(statements)
}
