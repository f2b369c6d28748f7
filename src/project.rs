//! Project layout and subsystem wiring.
//!
//! Everything an organism persists lives relative to one project root:
//!
//! ```text
//! genes/*.gene                      seed sources, used only by init
//! fixtures/*_fix.gene, *_fused.gene mock-mode mutation fixtures
//! .sg/registry/sources/<sha>.gene   one file per source blob
//! .sg/registry/registry.json        allele metadata index
//! phenotype.toml                    dominance stacks + fusion state
//! fusion_tracker.json               per-pathway reinforcement records
//! .sg/regression.json               per-allele peak history
//! .sg/snapshots/<name>/             named state snapshots
//! peers.json, pools.toml            federation/pool inputs
//! .sg/pool_memberships.json         pool membership state
//! ```
//!
//! No ambient singletons: an orchestrator is built from its parts, and
//! two projects with disjoint roots coexist in one process.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::arena;
use crate::contract::ContractStore;
use crate::error::Result;
use crate::fusion::FusionTracker;
use crate::kernel::{Kernel, SharedKernel};
use crate::mutation::MutationEngine;
use crate::orchestrator::Orchestrator;
use crate::phenotype::PhenotypeMap;
use crate::registry::{Registry, SOURCE_SUFFIX};
use crate::regression::RegressionDetector;
use crate::snapshot::SnapshotManager;

/// Resolves the persisted-state layout for one project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    root: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(".sg")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.state_dir().join("registry")
    }

    pub fn phenotype_file(&self) -> PathBuf {
        self.root.join("phenotype.toml")
    }

    pub fn fusion_tracker_file(&self) -> PathBuf {
        self.root.join("fusion_tracker.json")
    }

    pub fn regression_file(&self) -> PathBuf {
        self.state_dir().join("regression.json")
    }

    pub fn genes_dir(&self) -> PathBuf {
        self.root.join("genes")
    }

    pub fn fixtures_dir(&self) -> PathBuf {
        self.root.join("fixtures")
    }

    pub fn contracts_dir(&self) -> PathBuf {
        self.root.join("contracts")
    }

    pub fn peers_file(&self) -> PathBuf {
        self.root.join("peers.json")
    }

    pub fn pools_file(&self) -> PathBuf {
        self.root.join("pools.toml")
    }

    pub fn pool_memberships_file(&self) -> PathBuf {
        self.state_dir().join("pool_memberships.json")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.state_dir().join("snapshots")
    }
}

/// An opened project: paths plus a fully wired orchestrator.
pub struct Project {
    paths: ProjectPaths,
    pub orchestrator: Arc<Orchestrator>,
}

impl Project {
    /// Open a project root, loading every persisted structure and wiring
    /// the orchestrator.
    pub fn open(
        root: impl Into<PathBuf>,
        contracts: ContractStore,
        kernel: Box<dyn Kernel>,
        mutation_engine: Arc<dyn MutationEngine>,
    ) -> Result<Self> {
        let paths = ProjectPaths::new(root);
        fs::create_dir_all(paths.state_dir())?;

        let registry = Registry::open(paths.registry_dir())?;
        let phenotype = PhenotypeMap::load(&paths.phenotype_file())?;
        let fusion = FusionTracker::open(&paths.fusion_tracker_file())?;
        let regression = RegressionDetector::open(&paths.regression_file())?;
        let kernel: SharedKernel = Arc::new(parking_lot::Mutex::new(kernel));

        let orchestrator = Orchestrator::new(
            registry,
            phenotype,
            fusion,
            regression,
            kernel,
            Arc::new(contracts),
            mutation_engine,
            paths.root().to_path_buf(),
        );
        Ok(Self {
            paths,
            orchestrator,
        })
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    pub fn snapshots(&self) -> SnapshotManager {
        SnapshotManager::new(self.paths.root())
    }

    /// Seed the registry from `genes/<locus>_*.gene`: the first seed per
    /// known locus registers and becomes dominant. Idempotent — loci
    /// that already carry a dominant are left alone.
    pub async fn init_seeds(&self) -> Result<usize> {
        let genes_dir = self.paths.genes_dir();
        if !genes_dir.exists() {
            return Ok(0);
        }

        let mut seeded = 0;
        for locus in self.orchestrator.contracts().known_loci() {
            if self
                .orchestrator
                .phenotype()
                .read()
                .await
                .get_dominant(&locus)
                .is_some()
            {
                continue;
            }
            let Some(seed_path) = first_seed(&genes_dir, &locus)? else {
                continue;
            };
            let source = fs::read_to_string(&seed_path)?;

            let sha = {
                let mut registry = self.orchestrator.registry().write().await;
                let sha = registry.register(&source, &locus, 0, None)?;
                if let Some(allele) = registry.get_mut(&sha) {
                    arena::set_dominant(allele);
                }
                sha
            };
            self.orchestrator.phenotype().write().await.promote(&locus, &sha);
            info!(locus = %locus, seed = %seed_path.display(), "seeded locus");
            seeded += 1;
        }
        Ok(seeded)
    }
}

fn first_seed(genes_dir: &Path, locus: &str) -> Result<Option<PathBuf>> {
    let prefix = format!("{locus}_");
    let mut candidates: Vec<PathBuf> = fs::read_dir(genes_dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().is_some_and(|ext| ext == SOURCE_SUFFIX)
                && path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .is_some_and(|stem| stem.starts_with(&prefix))
        })
        .collect();
    candidates.sort();
    Ok(candidates.into_iter().next())
}
