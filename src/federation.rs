//! Multi-organism federation: allele sharing between peers.
//!
//! Organisms exchange successful alleles and make independent promotion
//! decisions — no consensus. The HTTP plumbing is an external
//! collaborator; this module owns the export/import records, the
//! integrity check, and peer-observation accounting.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::arena;
use crate::error::{Error, Result};
use crate::fitness;
use crate::phenotype::PhenotypeMap;
use crate::registry::{source_digest, AlleleState, Registry};

/// A federation peer from `peers.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub url: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PeersFile {
    #[serde(default)]
    peers: Vec<PeerConfig>,
}

pub fn load_peers(config_path: &Path) -> Result<Vec<PeerConfig>> {
    if !config_path.exists() {
        return Ok(Vec::new());
    }
    let file: PeersFile = serde_json::from_str(&fs::read_to_string(config_path)?)?;
    Ok(file.peers)
}

/// The wire shape of a shared allele.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlleleExport {
    pub sha256: String,
    pub locus: String,
    #[serde(default)]
    pub generation: u32,
    pub source: String,
    #[serde(default)]
    pub fitness: f64,
    #[serde(default)]
    pub successful_invocations: u64,
    #[serde(default)]
    pub total_invocations: u64,
}

/// Package an allele for sharing: metadata plus source. `None` when the
/// allele or its source blob is unknown.
pub fn export_allele(registry: &Registry, sha: &str) -> Option<AlleleExport> {
    let allele = registry.get(sha)?;
    let source = registry.load_source(sha)?;
    Some(AlleleExport {
        sha256: allele.sha256.clone(),
        locus: allele.locus.clone(),
        generation: allele.generation,
        source,
        fitness: arena::compute_fitness(allele),
        successful_invocations: allele.successful_invocations,
        total_invocations: allele.total_invocations(),
    })
}

/// Import a shared allele: verify the peer's digest against the source,
/// register under the declared locus preserving generation, and join the
/// locus fallback in recessive state. Returns the local id.
pub fn import_allele(
    registry: &mut Registry,
    phenotype: &mut PhenotypeMap,
    export: &AlleleExport,
) -> Result<String> {
    if source_digest(&export.source) != export.sha256 {
        return Err(Error::FederationIntegrity {
            locus: export.locus.clone(),
            expected: export.sha256.clone(),
        });
    }
    let sha = registry.register(&export.source, &export.locus, export.generation, None)?;
    if let Some(allele) = registry.get_mut(&sha) {
        allele.state = AlleleState::Recessive;
    }
    phenotype.add_to_fallback(&export.locus, &sha);
    Ok(sha)
}

/// Record a peer's aggregate results for an allele, feeding distributed
/// fitness.
pub fn record_peer_result(
    registry: &mut Registry,
    sha: &str,
    peer: &str,
    successes: u64,
    failures: u64,
) {
    if let Some(allele) = registry.get_mut(sha) {
        fitness::record_peer_observation(allele, peer, successes, failures);
    }
}
