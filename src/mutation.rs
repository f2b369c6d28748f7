//! Mutation engine interface.
//!
//! When every allele at a locus is exhausted, the orchestrator asks a
//! mutation engine for a repaired implementation. LLM providers are
//! external collaborators behind this trait; the fixture engine serves
//! development and tests from canned sources.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::registry::SOURCE_SUFFIX;

/// Everything a mutation engine gets to work with when repairing a
/// failing locus.
#[derive(Debug, Clone)]
pub struct MutationContext {
    pub gene_source: String,
    pub locus: String,
    pub failing_input: String,
    pub error_message: String,
}

/// Generates gene sources. Implementations are synchronous; callers own
/// any offloading.
pub trait MutationEngine: Send + Sync {
    /// Generate a mutated gene source from a failing context.
    fn mutate(&self, ctx: &MutationContext) -> Result<String>;

    /// Proactively generate competing implementations from a contract
    /// prompt.
    fn generate(&self, locus: &str, contract_prompt: &str, count: usize) -> Result<Vec<String>> {
        let _ = (locus, contract_prompt, count);
        Err(Error::Mutation(
            "this engine does not support proactive generation".into(),
        ))
    }

    /// Generate a single fused gene combining a pathway's steps.
    fn generate_fused(&self, pathway: &str, sources: &[String], loci: &[String]) -> Result<String> {
        let _ = (pathway, sources, loci);
        Err(Error::Mutation(
            "this engine does not support fusion generation".into(),
        ))
    }
}

/// Serves fixture files as mutation results. Mock mode for development
/// and tests: `<locus>_fix.gene` and `<pathway>_fused.gene`.
pub struct FixtureMutationEngine {
    fixtures_dir: PathBuf,
}

impl FixtureMutationEngine {
    pub fn new(fixtures_dir: impl Into<PathBuf>) -> Self {
        Self {
            fixtures_dir: fixtures_dir.into(),
        }
    }

    fn read_fixture(&self, stem: &str) -> Result<String> {
        let path = self.fixtures_dir.join(format!("{stem}.{SOURCE_SUFFIX}"));
        if !path.exists() {
            return Err(Error::Mutation(format!("no fixture at {}", path.display())));
        }
        Ok(std::fs::read_to_string(path)?)
    }
}

impl MutationEngine for FixtureMutationEngine {
    fn mutate(&self, ctx: &MutationContext) -> Result<String> {
        self.read_fixture(&format!("{}_fix", ctx.locus))
    }

    fn generate(&self, locus: &str, _contract_prompt: &str, _count: usize) -> Result<Vec<String>> {
        Ok(vec![self.read_fixture(&format!("{locus}_fix"))?])
    }

    fn generate_fused(&self, pathway: &str, _sources: &[String], _loci: &[String]) -> Result<String> {
        self.read_fixture(&format!("{pathway}_fused"))
    }
}
