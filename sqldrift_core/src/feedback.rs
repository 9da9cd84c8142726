use std::collections::HashSet;

/// Minimum coverage-percentage gain that counts as new coverage.
pub const DEFAULT_COVERAGE_EPSILON: f64 = 0.05;

/// Retention policy for mutants that behaved the same on both engines.
///
/// A mutant is worth keeping when the coverage observed for it exceeds its
/// parent's current score by more than `epsilon`. With duplicate
/// suppression enabled, a statement text is accepted at most once per run.
#[derive(Debug, Clone)]
pub struct CoverageFeedback {
    epsilon: f64,
    dedup: bool,
    known_hashes: HashSet<[u8; 16]>,
}

impl CoverageFeedback {
    pub fn new(epsilon: f64) -> Self {
        Self {
            epsilon,
            dedup: false,
            known_hashes: HashSet::new(),
        }
    }

    pub fn with_dedup(mut self, dedup: bool) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Whether `gain` is large enough to count as new coverage.
    pub fn exceeds_epsilon(&self, gain: f64) -> bool {
        gain > self.epsilon
    }

    /// Whether a mutant observed at `coverage` beats a parent scored at
    /// `parent_coverage`.
    pub fn is_interesting(&self, sql: &str, coverage: f64, parent_coverage: f64) -> bool {
        if !self.exceeds_epsilon(coverage - parent_coverage) {
            return false;
        }
        !self.dedup || !self.known_hashes.contains(&md5::compute(sql.as_bytes()).0)
    }

    /// Records an accepted mutant. Returns `false` if it was already known.
    pub fn report_interesting(&mut self, sql: &str) -> bool {
        if !self.dedup {
            return true;
        }
        self.known_hashes.insert(md5::compute(sql.as_bytes()).0)
    }
}

impl Default for CoverageFeedback {
    fn default() -> Self {
        Self::new(DEFAULT_COVERAGE_EPSILON)
    }
}
