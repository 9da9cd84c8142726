use crate::oracle::BugCategory;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_ARTIFACT_DIR: &str = "bugs";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to create artifact directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write artifact {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Persists findings for offline replay and reduction.
///
/// Exporting the same `(category, sequence_number)` twice must leave a
/// single artifact holding the latest SQL.
pub trait ArtifactSink {
    fn export(
        &mut self,
        sql: &str,
        sequence_number: u64,
        category: BugCategory,
    ) -> Result<(), ArtifactError>;
}

/// Name of the artifact file for a finding, e.g. `bug3.sql` or `crash0.sql`.
pub fn artifact_file_name(sequence_number: u64, category: BugCategory) -> String {
    let prefix = match category {
        BugCategory::Logical => "bug",
        BugCategory::Crash => "crash",
    };
    format!("{prefix}{sequence_number}.sql")
}

/// Writes one `.sql` file per finding into a directory.
#[derive(Debug, Clone)]
pub struct DirectoryArtifactSink {
    dir: PathBuf,
}

impl DirectoryArtifactSink {
    /// Creates the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| ArtifactError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ArtifactSink for DirectoryArtifactSink {
    fn export(
        &mut self,
        sql: &str,
        sequence_number: u64,
        category: BugCategory,
    ) -> Result<(), ArtifactError> {
        let path = self.dir.join(artifact_file_name(sequence_number, category));
        fs::write(&path, format!("{sql}\n"))
            .map_err(|source| ArtifactError::Write { path: path.clone(), source })?;
        info!(?path, %category, "Exported artifact");
        Ok(())
    }
}

/// Keeps artifacts in memory, keyed like the directory sink's file names.
#[derive(Debug, Default, Clone)]
pub struct InMemoryArtifactSink {
    pub artifacts: std::collections::BTreeMap<(BugCategory, u64), String>,
}

impl InMemoryArtifactSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

impl ArtifactSink for InMemoryArtifactSink {
    fn export(
        &mut self,
        sql: &str,
        sequence_number: u64,
        category: BugCategory,
    ) -> Result<(), ArtifactError> {
        self.artifacts
            .insert((category, sequence_number), sql.to_string());
        Ok(())
    }
}
