//! Fitness regression detection.
//!
//! Tracks per-allele peak fitness. A drop of 0.2 from peak is a mild
//! regression, 0.4 severe; either is a signal to generate competing
//! alleles before the decline spreads.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::arena;
use crate::error::Result;
use crate::registry::Allele;

/// Fitness drop from peak that counts as a mild regression.
pub const REGRESSION_THRESHOLD: f64 = 0.2;

/// Fitness drop from peak that counts as severe.
pub const SEVERE_REGRESSION: f64 = 0.4;

/// Invocations needed before regression detection is trusted.
pub const MIN_INVOCATIONS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Mild,
    Severe,
}

/// Peak-fitness memory for one allele.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FitnessHistory {
    pub peak_fitness: f64,
    pub last_fitness: f64,
    pub samples: u64,
}

/// Monitors allele fitness for drops below historical peak.
/// JSON-persisted, keyed by allele id.
#[derive(Debug, Default)]
pub struct RegressionDetector {
    history: BTreeMap<String, FitnessHistory>,
}

impl RegressionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the allele's current fitness. Returns the regression
    /// severity when the drop from peak crosses a threshold.
    pub fn record(&mut self, allele: &Allele) -> Option<Severity> {
        let fitness = arena::compute_fitness(allele);
        let history = self.history.entry(allele.sha256.clone()).or_default();
        history.last_fitness = fitness;
        history.samples += 1;

        if fitness > history.peak_fitness {
            history.peak_fitness = fitness;
            return None;
        }

        if allele.total_invocations() < MIN_INVOCATIONS {
            return None;
        }

        let drop = history.peak_fitness - fitness;
        if drop >= SEVERE_REGRESSION {
            Some(Severity::Severe)
        } else if drop >= REGRESSION_THRESHOLD {
            Some(Severity::Mild)
        } else {
            None
        }
    }

    pub fn get_history(&self, sha: &str) -> Option<&FitnessHistory> {
        self.history.get(sha)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(&self.history)?)?;
        Ok(())
    }

    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let history = serde_json::from_str(&fs::read_to_string(path)?)?;
        Ok(Self { history })
    }
}
