use crate::executor::ExecutionOutcome;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker the reference engine's shell prints when the engine segfaults.
pub const SEGFAULT_MARKER: &str = "Segmentation fault";
/// Prefix the executor appends to stderr when an engine dies by signal.
pub const SIGNAL_MARKER: &str = "Terminated by signal";

/// Category of one executed mutant, in order of classification precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Same,
    LogicBug,
    Crash,
    SyntaxError,
}

impl Verdict {
    /// The artifact category a verdict is exported under, if any.
    pub fn bug_category(&self) -> Option<BugCategory> {
        match self {
            Verdict::Crash => Some(BugCategory::Crash),
            Verdict::LogicBug => Some(BugCategory::Logical),
            Verdict::Same | Verdict::SyntaxError => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Same => "same",
            Verdict::LogicBug => "logic-bug",
            Verdict::Crash => "crash",
            Verdict::SyntaxError => "syntax-error",
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BugCategory {
    Logical,
    Crash,
}

impl BugCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            BugCategory::Logical => "logical",
            BugCategory::Crash => "crash",
        }
    }
}

impl fmt::Display for BugCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A finding worth exporting: the statement plus why it was flagged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BugReport {
    pub sql: String,
    pub category: BugCategory,
    pub description: String,
    /// MD5 hex digest of `sql`, for correlating log lines and artifacts.
    pub sql_hash: String,
}

impl BugReport {
    pub fn new(sql: impl Into<String>, category: BugCategory, description: impl Into<String>) -> Self {
        let sql = sql.into();
        let sql_hash = format!("{:x}", md5::compute(sql.as_bytes()));
        Self {
            sql,
            category,
            description: description.into(),
            sql_hash,
        }
    }
}

/// An `Oracle` turns the raw outcome of a differential run into a verdict.
///
/// Implementations are pure: the same outcome always yields the same
/// verdict, and nothing is executed while deciding.
pub trait Oracle: Send + Sync {
    fn verdict(&self, outcome: &ExecutionOutcome) -> Verdict;

    /// Classifies `outcome` and builds a report for verdicts that are bugs.
    fn examine(&self, sql: &str, outcome: &ExecutionOutcome) -> (Verdict, Option<BugReport>) {
        let verdict = self.verdict(outcome);
        let report = verdict.bug_category().map(|category| {
            let description = match category {
                BugCategory::Crash => format!(
                    "reference engine crashed: {}",
                    String::from_utf8_lossy(&outcome.reference.stderr)
                ),
                BugCategory::Logical => "reference and candidate outputs differ".to_string(),
            };
            BugReport::new(sql, category, description)
        });
        (verdict, report)
    }
}

/// Compares reference and candidate streams with a fixed precedence:
/// crash marker in reference stderr, then any reference stderr, then an
/// output mismatch.
#[derive(Debug, Clone)]
pub struct DifferentialOracle {
    crash_markers: Vec<Vec<u8>>,
}

impl DifferentialOracle {
    /// Empty markers are ignored; they would match every stream.
    pub fn new<S: AsRef<str>>(crash_markers: impl IntoIterator<Item = S>) -> Self {
        Self {
            crash_markers: crash_markers
                .into_iter()
                .map(|marker| marker.as_ref().as_bytes().to_vec())
                .filter(|marker| !marker.is_empty())
                .collect(),
        }
    }

    pub fn classify(
        &self,
        stderr_ref: &[u8],
        stdout_ref: &[u8],
        _stderr_cand: &[u8],
        stdout_cand: &[u8],
    ) -> Verdict {
        if self
            .crash_markers
            .iter()
            .any(|marker| contains(stderr_ref, marker))
        {
            Verdict::Crash
        } else if !stderr_ref.is_empty() {
            Verdict::SyntaxError
        } else if stdout_ref != stdout_cand {
            Verdict::LogicBug
        } else {
            Verdict::Same
        }
    }
}

impl Default for DifferentialOracle {
    fn default() -> Self {
        Self::new([SEGFAULT_MARKER, SIGNAL_MARKER])
    }
}

impl Oracle for DifferentialOracle {
    fn verdict(&self, outcome: &ExecutionOutcome) -> Verdict {
        self.classify(
            &outcome.reference.stderr,
            &outcome.reference.stdout,
            &outcome.candidate.stderr,
            &outcome.candidate.stdout,
        )
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}
