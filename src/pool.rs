//! Gene pool: share high-fitness alleles across organisms.
//!
//! Pools are remote services; the HTTP surface is an external
//! collaborator behind `PoolTransport`. This module owns push
//! eligibility, membership/reciprocity accounting, cross-domain
//! compatibility gating, and z-score fitness normalization so alleles
//! from different domains rank on one scale.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::contract::{contracts_compatible, ContractStore, GeneContract};
use crate::error::{Error, Result};
use crate::federation::{export_allele, import_allele, AlleleExport};
use crate::phenotype::PhenotypeMap;
use crate::registry::{unix_now, AlleleState, Registry};

/// Fitness floor for pushing an allele to a pool.
pub const DEFAULT_MIN_FITNESS: f64 = 0.85;

/// Invocation floor for pushing an allele to a pool.
pub const DEFAULT_MIN_INVOCATIONS: u64 = 50;

// --- Configuration ---

/// One configured pool from `pools.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub token_env: String,
}

impl PoolConfig {
    /// Bearer token resolved from the configured environment variable.
    pub fn token(&self) -> Option<String> {
        if self.token_env.is_empty() {
            return None;
        }
        std::env::var(&self.token_env).ok()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PoolsFile {
    #[serde(default, rename = "pool")]
    pools: Vec<PoolConfig>,
}

pub fn load_pool_configs(config_path: &Path) -> Result<Vec<PoolConfig>> {
    if !config_path.exists() {
        return Ok(Vec::new());
    }
    let file: PoolsFile = toml::from_str(&fs::read_to_string(config_path)?)?;
    Ok(file.pools)
}

// --- Membership tracking ---

/// An organism's relationship with one pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMembership {
    pub pool_name: String,
    pub pool_url: String,
    pub organism_id: String,
    #[serde(default)]
    pub last_push: Option<f64>,
    #[serde(default)]
    pub last_pull: Option<f64>,
    #[serde(default)]
    pub total_pushed: u64,
    #[serde(default)]
    pub total_pulled: u64,
    #[serde(default = "default_true")]
    pub access_granted: bool,
}

fn default_true() -> bool {
    true
}

/// Persists pool membership state under `.sg/pool_memberships.json`.
#[derive(Debug)]
pub struct MembershipStore {
    path: PathBuf,
    memberships: BTreeMap<String, PoolMembership>,
}

impl MembershipStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let memberships = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, memberships })
    }

    pub fn get(&self, pool_name: &str) -> Option<&PoolMembership> {
        self.memberships.get(pool_name)
    }

    pub fn get_or_create(&mut self, pool_name: &str, pool_url: &str) -> &mut PoolMembership {
        self.memberships
            .entry(pool_name.to_string())
            .or_insert_with(|| PoolMembership {
                pool_name: pool_name.to_string(),
                pool_url: pool_url.to_string(),
                organism_id: uuid::Uuid::new_v4().to_string(),
                last_push: None,
                last_pull: None,
                total_pushed: 0,
                total_pulled: 0,
                access_granted: true,
            })
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&self.memberships)?)?;
        Ok(())
    }
}

// --- Push eligibility & cross-domain ranking ---

/// Push gate: enough history, high fitness, and not deprecated.
pub fn is_push_eligible(allele: &crate::registry::Allele) -> bool {
    if allele.total_invocations() < DEFAULT_MIN_INVOCATIONS {
        return false;
    }
    if crate::arena::compute_fitness(allele) < DEFAULT_MIN_FITNESS {
        return false;
    }
    allele.state != AlleleState::Deprecated
}

/// Running fitness statistics for one domain, for z-score normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainStats {
    pub domain: String,
    #[serde(default)]
    pub allele_count: u64,
    #[serde(default)]
    pub fitness_sum: f64,
    #[serde(default)]
    pub fitness_sum_sq: f64,
}

impl DomainStats {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            ..Self::default()
        }
    }

    pub fn observe(&mut self, fitness: f64) {
        self.allele_count += 1;
        self.fitness_sum += fitness;
        self.fitness_sum_sq += fitness * fitness;
    }

    pub fn mean(&self) -> f64 {
        if self.allele_count == 0 {
            return 0.0;
        }
        self.fitness_sum / self.allele_count as f64
    }

    pub fn stddev(&self) -> f64 {
        if self.allele_count == 0 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = (self.fitness_sum_sq / self.allele_count as f64) - mean * mean;
        variance.max(0.0).sqrt()
    }

    /// Normalize a fitness value within this domain. Stddev is floored
    /// at 0.001 so thin domains cannot explode the score.
    pub fn zscore(&self, fitness: f64) -> f64 {
        if self.allele_count == 0 {
            return fitness;
        }
        (fitness - self.mean()) / self.stddev().max(0.001)
    }
}

/// An allele as a pool serves it: export payload plus domain ranking
/// metadata and optional contract for compatibility gating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolAllele {
    #[serde(flatten)]
    pub export: AlleleExport,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub normalized_fitness: f64,
    #[serde(default)]
    pub contract: Option<GeneContract>,
}

// --- Transport & client ---

/// The pool's remote surface. HTTP implementations live outside the
/// engine; tests use an in-memory transport.
pub trait PoolTransport: Send + Sync {
    fn push(&self, pool: &PoolConfig, organism_id: &str, allele: &AlleleExport) -> Result<bool>;
    fn pull(&self, pool: &PoolConfig, organism_id: &str, locus: &str) -> Result<Vec<PoolAllele>>;
}

/// Summary of an automatic push/pull cycle.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PoolCycleSummary {
    pub pushed: u64,
    pub pulled: u64,
    pub push_errors: Vec<String>,
    pub pull_errors: Vec<String>,
}

/// Client for configured gene pools.
pub struct PoolClient {
    configs: Vec<PoolConfig>,
    memberships: MembershipStore,
    transport: Box<dyn PoolTransport>,
}

impl PoolClient {
    pub fn open(project_root: &Path, transport: Box<dyn PoolTransport>) -> Result<Self> {
        Ok(Self {
            configs: load_pool_configs(&project_root.join("pools.toml"))?,
            memberships: MembershipStore::open(
                project_root.join(".sg").join("pool_memberships.json"),
            )?,
            transport,
        })
    }

    fn config(&self, pool_name: &str) -> Result<PoolConfig> {
        self.configs
            .iter()
            .find(|config| config.name == pool_name)
            .cloned()
            .ok_or_else(|| Error::ContractLoad(format!("no pool configured with name: {pool_name}")))
    }

    pub fn list_pools(&self) -> &[PoolConfig] {
        &self.configs
    }

    pub fn status(&self, pool_name: &str) -> Option<&PoolMembership> {
        self.memberships.get(pool_name)
    }

    /// Push the dominant allele for a locus, if eligible. Returns whether
    /// a push happened.
    pub fn push(
        &mut self,
        locus: &str,
        registry: &Registry,
        phenotype: &PhenotypeMap,
        pool_name: &str,
    ) -> Result<bool> {
        let config = self.config(pool_name)?;
        let Some(dominant_sha) = phenotype.get_dominant(locus) else {
            return Ok(false);
        };
        let Some(allele) = registry.get(dominant_sha) else {
            return Ok(false);
        };
        if !is_push_eligible(allele) {
            return Ok(false);
        }
        let Some(export) = export_allele(registry, dominant_sha) else {
            return Ok(false);
        };

        let organism_id = self
            .memberships
            .get_or_create(pool_name, &config.url)
            .organism_id
            .clone();
        if self.transport.push(&config, &organism_id, &export)? {
            let membership = self.memberships.get_or_create(pool_name, &config.url);
            membership.last_push = Some(unix_now());
            membership.total_pushed += 1;
            self.memberships.save()?;
            info!(locus, pool = pool_name, "pushed dominant allele");
            return Ok(true);
        }
        Ok(false)
    }

    /// Pull alleles for a locus. Pulled alleles enter as recessive
    /// fallbacks and compete on local fitness. Cross-domain pulls are
    /// gated on structural contract compatibility.
    pub fn pull(
        &mut self,
        locus: &str,
        registry: &mut Registry,
        phenotype: &mut PhenotypeMap,
        local_contract: Option<&GeneContract>,
        pool_name: &str,
    ) -> Result<Vec<String>> {
        let config = self.config(pool_name)?;
        let organism_id = self
            .memberships
            .get_or_create(pool_name, &config.url)
            .organism_id
            .clone();

        let candidates = self.transport.pull(&config, &organism_id, locus)?;
        let mut imported = Vec::new();
        for candidate in candidates {
            if let (Some(local), Some(remote)) = (local_contract, candidate.contract.as_ref()) {
                if !contracts_compatible(local, remote) {
                    info!(
                        locus,
                        remote_locus = %candidate.export.locus,
                        "skipping structurally incompatible pool allele"
                    );
                    continue;
                }
            }
            match import_allele(registry, phenotype, &candidate.export) {
                Ok(sha) => imported.push(sha),
                Err(e) => warn!(locus, error = %e, "pool import rejected"),
            }
        }

        if !imported.is_empty() {
            let membership = self.memberships.get_or_create(pool_name, &config.url);
            membership.last_pull = Some(unix_now());
            membership.total_pulled += imported.len() as u64;
            self.memberships.save()?;
        }
        Ok(imported)
    }

    /// Automatic cycle: push every eligible dominant, then pull for every
    /// known locus.
    pub fn auto(
        &mut self,
        registry: &mut Registry,
        phenotype: &mut PhenotypeMap,
        contracts: &ContractStore,
        pool_name: &str,
    ) -> Result<PoolCycleSummary> {
        let mut summary = PoolCycleSummary::default();

        for locus in contracts.known_loci() {
            match self.push(&locus, registry, phenotype, pool_name) {
                Ok(true) => summary.pushed += 1,
                Ok(false) => {}
                Err(e) => summary.push_errors.push(format!("{locus}: {e}")),
            }
        }

        for locus in contracts.known_loci() {
            match self.pull(&locus, registry, phenotype, contracts.gene(&locus), pool_name) {
                Ok(shas) => summary.pulled += shas.len() as u64,
                Err(e) => summary.pull_errors.push(format!("{locus}: {e}")),
            }
        }

        Ok(summary)
    }
}
