//! Phenotype map: which allele is expressed at each locus.
//!
//! A TOML file maps loci to dominant alleles plus ordered fallback stacks,
//! and pathways to their fusion state. Reload preserves stack order
//! exactly.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocusConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dominant: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FusionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fused_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fused_fallback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composition_fingerprint: Option<String>,
}

/// On-disk shape: `[locus.<name>]` and `[pathway_fusion.<name>]` tables.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PhenotypeFile {
    #[serde(default)]
    locus: BTreeMap<String, LocusConfig>,
    #[serde(default)]
    pathway_fusion: BTreeMap<String, FusionConfig>,
}

/// In-memory phenotype state.
#[derive(Debug, Default)]
pub struct PhenotypeMap {
    loci: BTreeMap<String, LocusConfig>,
    pathway_fusions: BTreeMap<String, FusionConfig>,
}

impl PhenotypeMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_locus(&mut self, locus: &str) -> &mut LocusConfig {
        self.loci.entry(locus.to_string()).or_default()
    }

    /// Set `sha` as dominant for a locus. The previous dominant moves to
    /// the head of the fallback stack; the new dominant leaves it.
    pub fn promote(&mut self, locus: &str, sha: &str) {
        let config = self.ensure_locus(locus);
        if let Some(old) = config.dominant.take() {
            if old != sha && !config.fallback.contains(&old) {
                config.fallback.insert(0, old);
            }
        }
        config.dominant = Some(sha.to_string());
        config.fallback.retain(|s| s != sha);
    }

    /// Append to the fallback stack if absent and not dominant.
    pub fn add_to_fallback(&mut self, locus: &str, sha: &str) {
        let config = self.ensure_locus(locus);
        if config.dominant.as_deref() != Some(sha) && !config.fallback.iter().any(|s| s == sha) {
            config.fallback.push(sha.to_string());
        }
    }

    /// Remove an allele from a locus stack entirely.
    pub fn remove(&mut self, locus: &str, sha: &str) {
        if let Some(config) = self.loci.get_mut(locus) {
            if config.dominant.as_deref() == Some(sha) {
                config.dominant = None;
            }
            config.fallback.retain(|s| s != sha);
        }
    }

    /// The authoritative selection order: `[dominant, *fallback]`.
    pub fn get_stack(&self, locus: &str) -> Vec<String> {
        let Some(config) = self.loci.get(locus) else {
            return Vec::new();
        };
        let mut stack = Vec::with_capacity(1 + config.fallback.len());
        if let Some(dominant) = &config.dominant {
            stack.push(dominant.clone());
        }
        stack.extend(config.fallback.iter().cloned());
        stack
    }

    pub fn get_dominant(&self, locus: &str) -> Option<&str> {
        self.loci.get(locus)?.dominant.as_deref()
    }

    pub fn loci(&self) -> impl Iterator<Item = (&String, &LocusConfig)> {
        self.loci.iter()
    }

    // --- Fusion state ---

    pub fn get_fused(&self, pathway: &str) -> Option<&FusionConfig> {
        self.pathway_fusions.get(pathway)
    }

    pub fn set_fused(&mut self, pathway: &str, sha: &str, fingerprint: &str) {
        self.pathway_fusions.insert(
            pathway.to_string(),
            FusionConfig {
                fused_sha: Some(sha.to_string()),
                fused_fallback: None,
                composition_fingerprint: Some(fingerprint.to_string()),
            },
        );
    }

    pub fn set_fused_fallback(&mut self, pathway: &str, sha: &str) {
        if let Some(config) = self.pathway_fusions.get_mut(pathway) {
            config.fused_fallback = Some(sha.to_string());
        }
    }

    pub fn clear_fused(&mut self, pathway: &str) {
        self.pathway_fusions.remove(pathway);
    }

    // --- Persistence ---

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = PhenotypeFile {
            locus: self.loci.clone(),
            pathway_fusion: self.pathway_fusions.clone(),
        };
        fs::write(path, toml::to_string_pretty(&file)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let file: PhenotypeFile = toml::from_str(&fs::read_to_string(path)?)?;
        Ok(Self {
            loci: file.locus,
            pathway_fusions: file.pathway_fusion,
        })
    }
}
