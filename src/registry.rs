//! Content-addressed allele store.
//!
//! Alleles are immutable, addressed by the SHA-256 of their source bytes.
//! Sources live as one blob file per digest; metadata lives in a single
//! JSON index. Registering the same source twice yields the same id
//! without duplicating storage.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::contract::Timescale;
use crate::error::{Error, Result};

/// File suffix for stored gene sources.
pub const SOURCE_SUFFIX: &str = "gene";

/// Selection state of an allele.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlleleState {
    Dominant,
    #[default]
    Recessive,
    Deprecated,
}

/// A single fitness observation at a specific timescale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitnessRecord {
    pub timescale: Timescale,
    pub success: bool,
    /// Which locus produced this observation.
    pub source_locus: String,
    pub timestamp: f64,
}

/// Aggregated peer results synced over federation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerObservation {
    pub peer: String,
    pub successes: u64,
    pub failures: u64,
    pub timestamp: f64,
}

/// An immutable executable unit: one implementation of a locus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allele {
    pub sha256: String,
    pub locus: String,
    pub generation: u32,
    #[serde(default)]
    pub parent_sha: Option<String>,
    #[serde(default)]
    pub state: AlleleState,
    #[serde(default)]
    pub successful_invocations: u64,
    #[serde(default)]
    pub failed_invocations: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub shadow_successes: u32,
    #[serde(default)]
    pub fitness_records: Vec<FitnessRecord>,
    #[serde(default)]
    pub peer_observations: Vec<PeerObservation>,
    pub created_at: f64,
}

impl Allele {
    fn new(sha256: String, locus: String, generation: u32, parent_sha: Option<String>) -> Self {
        Self {
            sha256,
            locus,
            generation,
            parent_sha,
            state: AlleleState::Recessive,
            successful_invocations: 0,
            failed_invocations: 0,
            consecutive_failures: 0,
            shadow_successes: 0,
            fitness_records: Vec::new(),
            peer_observations: Vec::new(),
            created_at: unix_now(),
        }
    }

    /// Total invocations is derived, so the counter invariant holds by
    /// construction.
    pub fn total_invocations(&self) -> u64 {
        self.successful_invocations + self.failed_invocations
    }

    /// Walk the lineage chain of this allele inside `registry`, root last.
    /// Visited ids are tracked, so malformed parent data cannot loop.
    pub fn lineage<'a>(&'a self, registry: &'a Registry) -> Vec<&'a Allele> {
        let mut chain = vec![self];
        let mut seen = vec![self.sha256.as_str()];
        let mut cursor = self.parent_sha.as_deref();
        while let Some(sha) = cursor {
            if seen.contains(&sha) {
                break;
            }
            match registry.get(sha) {
                Some(parent) => {
                    seen.push(sha);
                    chain.push(parent);
                    cursor = parent.parent_sha.as_deref();
                }
                None => break,
            }
        }
        chain
    }
}

/// Compute the content address of a gene source.
pub fn source_digest(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

pub(crate) fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// SHA-256 CAS plus a JSON metadata index.
#[derive(Debug)]
pub struct Registry {
    root: PathBuf,
    sources_dir: PathBuf,
    alleles: HashMap<String, Allele>,
}

impl Registry {
    /// Open (or create) a registry rooted at `root`. Re-reads the index;
    /// an allele whose source blob is missing stays in the index for
    /// lineage but can no longer execute.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let sources_dir = root.join("sources");
        fs::create_dir_all(&sources_dir)?;

        let mut alleles = HashMap::new();
        let index_path = root.join("registry.json");
        if index_path.exists() {
            let text = fs::read_to_string(&index_path)?;
            alleles = serde_json::from_str(&text)?;
        }

        let registry = Self {
            root,
            sources_dir,
            alleles,
        };
        for allele in registry.alleles.values() {
            if !registry.source_path(&allele.sha256).exists() {
                warn!(
                    sha = %&allele.sha256[..12.min(allele.sha256.len())],
                    locus = %allele.locus,
                    "allele metadata present but source blob missing"
                );
            }
        }
        Ok(registry)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn source_path(&self, sha: &str) -> PathBuf {
        self.sources_dir.join(format!("{sha}.{SOURCE_SUFFIX}"))
    }

    /// Register a source under a locus. Idempotent: known sources return
    /// the existing id untouched. A known source registered under a
    /// different locus is a fatal registration error.
    pub fn register(
        &mut self,
        source: &str,
        locus: &str,
        generation: u32,
        parent_sha: Option<String>,
    ) -> Result<String> {
        let sha = source_digest(source);
        if let Some(existing) = self.alleles.get(&sha) {
            if existing.locus != locus {
                return Err(Error::Registration {
                    sha,
                    existing: existing.locus.clone(),
                    requested: locus.to_string(),
                });
            }
            return Ok(sha);
        }

        fs::write(self.source_path(&sha), source)?;
        self.alleles.insert(
            sha.clone(),
            Allele::new(sha.clone(), locus.to_string(), generation, parent_sha),
        );
        Ok(sha)
    }

    pub fn get(&self, sha: &str) -> Option<&Allele> {
        self.alleles.get(sha)
    }

    pub fn get_mut(&mut self, sha: &str) -> Option<&mut Allele> {
        self.alleles.get_mut(sha)
    }

    pub fn contains(&self, sha: &str) -> bool {
        self.alleles.contains_key(sha)
    }

    /// Read the source blob for an allele, or `None` if unknown/missing.
    pub fn load_source(&self, sha: &str) -> Option<String> {
        if !self.alleles.contains_key(sha) {
            return None;
        }
        fs::read_to_string(self.source_path(sha)).ok()
    }

    /// Every allele implementing a locus. Callers sort by fitness when
    /// selecting.
    pub fn alleles_for_locus(&self, locus: &str) -> Vec<&Allele> {
        let mut found: Vec<&Allele> = self
            .alleles
            .values()
            .filter(|a| a.locus == locus)
            .collect();
        found.sort_by(|a, b| a.sha256.cmp(&b.sha256));
        found
    }

    pub fn alleles(&self) -> impl Iterator<Item = &Allele> {
        self.alleles.values()
    }

    pub fn allele_count(&self) -> usize {
        self.alleles.len()
    }

    pub fn loci_count(&self) -> usize {
        let mut loci: Vec<&str> = self.alleles.values().map(|a| a.locus.as_str()).collect();
        loci.sort_unstable();
        loci.dedup();
        loci.len()
    }

    /// Flush the metadata index atomically: write a temp file, then rename
    /// over the live index.
    pub fn save_index(&self) -> Result<()> {
        let index_path = self.root.join("registry.json");
        let tmp_path = self.root.join("registry.json.tmp");
        let text = serde_json::to_string_pretty(&self.alleles)?;
        fs::write(&tmp_path, text)?;
        fs::rename(&tmp_path, &index_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "fn execute(input) { return input; }";

    fn open_registry(dir: &Path) -> Registry {
        Registry::open(dir.join("registry")).unwrap()
    }

    #[test]
    fn register_and_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = open_registry(dir.path());
        let sha = registry.register(SOURCE, "bridge_create", 0, None).unwrap();
        assert_eq!(sha.len(), 64);
        assert_eq!(sha, source_digest(SOURCE));
        let allele = registry.get(&sha).unwrap();
        assert_eq!(allele.locus, "bridge_create");
        assert_eq!(allele.generation, 0);
        assert_eq!(allele.state, AlleleState::Recessive);
    }

    #[test]
    fn register_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = open_registry(dir.path());
        let sha1 = registry.register(SOURCE, "bridge_create", 0, None).unwrap();
        let sha2 = registry.register(SOURCE, "bridge_create", 0, None).unwrap();
        assert_eq!(sha1, sha2);
        assert_eq!(registry.allele_count(), 1);
    }

    #[test]
    fn locus_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = open_registry(dir.path());
        registry.register(SOURCE, "bridge_create", 0, None).unwrap();
        let err = registry.register(SOURCE, "bond_create", 0, None).unwrap_err();
        assert!(matches!(err, Error::Registration { .. }));
    }

    #[test]
    fn load_source_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = open_registry(dir.path());
        let sha = registry.register(SOURCE, "bridge_create", 0, None).unwrap();
        assert_eq!(registry.load_source(&sha).unwrap(), SOURCE);
        assert!(registry.load_source("nonexistent").is_none());
    }

    #[test]
    fn alleles_for_locus_filters() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = open_registry(dir.path());
        let sha1 = registry.register("fn execute(i) { return \"a\"; }", "bridge_create", 0, None).unwrap();
        let sha2 = registry.register("fn execute(i) { return \"b\"; }", "bridge_create", 0, None).unwrap();
        let sha3 = registry.register("fn execute(i) { return \"c\"; }", "bridge_stp", 0, None).unwrap();
        let shas: Vec<&str> = registry
            .alleles_for_locus("bridge_create")
            .iter()
            .map(|a| a.sha256.as_str())
            .collect();
        assert!(shas.contains(&sha1.as_str()));
        assert!(shas.contains(&sha2.as_str()));
        assert!(!shas.contains(&sha3.as_str()));
    }

    #[test]
    fn save_and_reload_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = open_registry(dir.path());
        let sha = registry.register(SOURCE, "bridge_create", 0, None).unwrap();
        registry.get_mut(&sha).unwrap().successful_invocations = 5;
        registry.save_index().unwrap();

        let reloaded = open_registry(dir.path());
        assert_eq!(reloaded.get(&sha).unwrap().successful_invocations, 5);
        assert_eq!(reloaded.load_source(&sha).unwrap(), SOURCE);
    }

    #[test]
    fn lineage_links_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = open_registry(dir.path());
        let parent = registry.register("fn execute(i) { return \"v1\"; }", "bridge_create", 0, None).unwrap();
        let child = registry
            .register("fn execute(i) { return \"v2\"; }", "bridge_create", 1, Some(parent.clone()))
            .unwrap();
        let allele = registry.get(&child).unwrap();
        assert_eq!(allele.generation, 1);
        assert_eq!(allele.parent_sha.as_deref(), Some(parent.as_str()));
        let chain = allele.lineage(&registry);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].sha256, parent);
    }
}
