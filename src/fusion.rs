//! Pathway fusion: reinforcement tracking and the fuse/decompose cycle.
//!
//! When a pathway completes successfully ten consecutive times with the
//! same allele composition, it earns fusion into a single optimized gene.
//! Any fused failure decomposes it back to individual steps.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Consecutive same-composition successes required before fusing.
pub const FUSION_THRESHOLD: u32 = 10;

/// Reinforcement state for one pathway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathwayTrack {
    #[serde(default)]
    pub composition_fingerprint: Option<String>,
    #[serde(default)]
    pub constituent_alleles: Vec<String>,
    #[serde(default)]
    pub reinforcement_count: u32,
    #[serde(default)]
    pub total_successes: u64,
    #[serde(default)]
    pub total_failures: u64,
}

/// SHA-256 of the colon-joined ordered allele list: the fusion identity.
pub fn composition_fingerprint(allele_shas: &[String]) -> String {
    let combined = allele_shas.join(":");
    hex::encode(Sha256::digest(combined.as_bytes()))
}

/// Tracks reinforcement state per pathway. JSON-persisted.
#[derive(Debug, Default)]
pub struct FusionTracker {
    tracks: BTreeMap<String, PathwayTrack>,
}

impl FusionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful step-by-step pathway run. A changed
    /// composition replaces the stored fingerprint and resets the count.
    /// Returns the fingerprint once the fusion threshold is met.
    pub fn record_success(&mut self, pathway: &str, allele_shas: &[String]) -> Option<String> {
        let fingerprint = composition_fingerprint(allele_shas);
        let track = self.tracks.entry(pathway.to_string()).or_default();

        if track.composition_fingerprint.as_deref() != Some(fingerprint.as_str()) {
            track.composition_fingerprint = Some(fingerprint.clone());
            track.constituent_alleles = allele_shas.to_vec();
            track.reinforcement_count = 0;
        }

        track.reinforcement_count += 1;
        track.total_successes += 1;

        (track.reinforcement_count >= FUSION_THRESHOLD).then_some(fingerprint)
    }

    /// A step failure (or fused failure) resets the reinforcement run.
    pub fn record_failure(&mut self, pathway: &str) {
        if let Some(track) = self.tracks.get_mut(pathway) {
            track.reinforcement_count = 0;
            track.total_failures += 1;
        }
    }

    /// A successful fused execution counts toward totals without touching
    /// the reinforcement run.
    pub fn record_fused_success(&mut self, pathway: &str) {
        let track = self.tracks.entry(pathway.to_string()).or_default();
        track.total_successes += 1;
    }

    pub fn get_track(&self, pathway: &str) -> Option<&PathwayTrack> {
        self.tracks.get(pathway)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(&self.tracks)?)?;
        Ok(())
    }

    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let tracks = serde_json::from_str(&fs::read_to_string(path)?)?;
        Ok(Self { tracks })
    }
}
