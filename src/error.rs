//! Engine error taxonomy.
//!
//! The orchestrator absorbs gene, kernel, validation, and timeout errors,
//! turning them into per-allele failures. Only pathway/topology exhaustion
//! and snapshot/federation/contract errors propagate to the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or inconsistent contract. Fatal to loading that contract.
    #[error("contract error: {0}")]
    ContractLoad(String),

    /// Gene source failed to load: parse failure or missing `execute`.
    #[error("gene load error: {0}")]
    GeneLoad(String),

    /// Gene imported a module outside the allowlist. Raised before execution.
    #[error("gene import violation: {0}")]
    GeneImport(String),

    /// Gene output was not a JSON object with a boolean `success` field.
    #[error("output validation failed for '{locus}': {reason}")]
    Validation { locus: String, reason: String },

    /// The gene raised during execution.
    #[error("gene runtime error: {0}")]
    GeneRuntime(String),

    /// The gene exceeded its wall-clock budget.
    #[error("gene execution exceeded {0}s timeout")]
    GeneTimeout(u64),

    /// A kernel operation failed.
    #[error("kernel error: {0}")]
    Kernel(String),

    /// The mutation engine raised or produced unusable source.
    #[error("mutation generation failed: {0}")]
    Mutation(String),

    /// A pathway step exhausted every allele.
    #[error("pathway '{pathway}' failed at step {step}: {reason}")]
    Pathway {
        pathway: String,
        step: String,
        reason: String,
    },

    /// Fused gene execution failed; the pathway decomposes.
    #[error("fused execution failed for '{0}'")]
    Fusion(String),

    /// Topology decomposition or execution failed.
    #[error("topology error: {0}")]
    Topology(String),

    /// Snapshot create/restore/delete failed.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// A federation import's digest did not match its source.
    #[error("federation integrity error: sha mismatch for '{locus}' (expected {expected})")]
    FederationIntegrity { locus: String, expected: String },

    /// Record/commit/rollback on a terminal transaction.
    #[error("transaction for '{0}' is already closed")]
    TransactionClosed(String),

    /// Re-registration of known source under a different locus.
    #[error("allele {sha} already registered for locus '{existing}', not '{requested}'")]
    Registration {
        sha: String,
        existing: String,
        requested: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("phenotype serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("phenotype parse error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
