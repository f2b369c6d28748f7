//! The execution loop: select → run → score → recover → mutate.
//!
//! The orchestrator owns the authoritative in-memory state (registry,
//! phenotype, fusion tracks, regression history). It walks the allele
//! stack for a locus, runs each candidate under the safety policy its
//! risk demands, scores the outcome, and asks the mutation engine for a
//! repair when the stack is exhausted. Verify timers call back into
//! `execute_locus` from background tasks, so all state sits behind
//! locks and the orchestrator is used through an `Arc`.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::arena;
use crate::contract::{
    validate_output, BlastRadius, ContractStore, GeneFamily, Timescale, VerifySpec,
};
use crate::error::{Error, Result};
use crate::fitness;
use crate::fusion::FusionTracker;
use crate::gene::{call_gene, load_gene, DEFAULT_TIMEOUT_SECS};
use crate::kernel::SharedKernel;
use crate::mutation::{MutationContext, MutationEngine};
use crate::pathway;
use crate::phenotype::PhenotypeMap;
use crate::registry::{AlleleState, Registry};
use crate::regression::RegressionDetector;
use crate::safety::{
    requires_shadow, requires_transaction, SafeKernel, Transaction, SHADOW_PROMOTION_THRESHOLD,
};
use crate::topology;
use crate::verify::{parse_duration, VerifyScheduler};

/// Mutation attempts after the allele stack is exhausted.
pub const MAX_MUTATION_RETRIES: u32 = 3;

pub struct Orchestrator {
    registry: RwLock<Registry>,
    phenotype: RwLock<PhenotypeMap>,
    fusion: RwLock<FusionTracker>,
    regression: RwLock<RegressionDetector>,
    kernel: SharedKernel,
    contracts: Arc<ContractStore>,
    mutation_engine: Arc<dyn MutationEngine>,
    verify: VerifyScheduler,
    project_root: PathBuf,
    gene_timeout: Duration,
    /// Overrides the timescale of `feeds` routing (e.g. a resilience
    /// sweep re-running old diagnostics).
    feedback_timescale: Mutex<Option<Timescale>>,
    weak: Weak<Orchestrator>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Registry,
        phenotype: PhenotypeMap,
        fusion: FusionTracker,
        regression: RegressionDetector,
        kernel: SharedKernel,
        contracts: Arc<ContractStore>,
        mutation_engine: Arc<dyn MutationEngine>,
        project_root: PathBuf,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            registry: RwLock::new(registry),
            phenotype: RwLock::new(phenotype),
            fusion: RwLock::new(fusion),
            regression: RwLock::new(regression),
            kernel,
            contracts,
            mutation_engine,
            verify: VerifyScheduler::new(),
            project_root,
            gene_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            feedback_timescale: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    pub fn registry(&self) -> &RwLock<Registry> {
        &self.registry
    }

    pub fn phenotype(&self) -> &RwLock<PhenotypeMap> {
        &self.phenotype
    }

    pub fn fusion_tracker(&self) -> &RwLock<FusionTracker> {
        &self.fusion
    }

    pub fn regression_detector(&self) -> &RwLock<RegressionDetector> {
        &self.regression
    }

    pub fn kernel(&self) -> SharedKernel {
        self.kernel.clone()
    }

    pub fn contracts(&self) -> &ContractStore {
        &self.contracts
    }

    pub fn verify_scheduler(&self) -> &VerifyScheduler {
        &self.verify
    }

    pub fn project_root(&self) -> &std::path::Path {
        &self.project_root
    }

    pub fn set_feedback_timescale(&self, timescale: Option<Timescale>) {
        *self.feedback_timescale.lock() = timescale;
    }

    pub fn kernel_mappers(
        &self,
    ) -> std::collections::HashMap<String, crate::topology::ResourceMapper> {
        self.kernel.lock().resource_mappers()
    }

    fn risk_for(&self, locus: &str) -> BlastRadius {
        self.contracts
            .gene(locus)
            .map_or(BlastRadius::Low, |contract| contract.risk)
    }

    /// Execute a locus with its allele stack.
    ///
    /// Returns `(output_json, used_sha)` on success, or `None` once the
    /// stack and the mutation retries are both exhausted. Each live
    /// attempt runs under a transaction when the risk demands one; on
    /// failure all kernel mutations are rolled back and the next allele
    /// is tried.
    pub async fn execute_locus(
        &self,
        locus: &str,
        input_json: &str,
    ) -> Result<Option<(String, String)>> {
        let risk = self.risk_for(locus);
        let use_txn = requires_transaction(risk);
        let use_shadow = requires_shadow(risk);
        let stack = self.phenotype.read().await.get_stack(locus);
        let mut last_error = String::new();

        for sha in stack {
            let candidate = {
                let registry = self.registry.read().await;
                let Some(allele) = registry.get(&sha) else {
                    continue;
                };
                if allele.state == AlleleState::Deprecated {
                    continue;
                }
                let Some(source) = registry.load_source(&sha) else {
                    continue;
                };
                (source, allele.shadow_successes)
            };
            let (source, shadow_successes) = candidate;

            // High/critical risk alleles earn trust against a shadow
            // kernel before they may touch the live one.
            if use_shadow && shadow_successes < SHADOW_PROMOTION_THRESHOLD {
                match self.try_shadow_execution(locus, &sha, &source, input_json).await {
                    Some(output) => return Ok(Some((output, sha))),
                    None => {
                        last_error = "shadow execution failed".into();
                        continue;
                    }
                }
            }

            match self.attempt_execution(locus, risk, use_txn, &source, input_json).await {
                Ok(output) => {
                    {
                        let mut registry = self.registry.write().await;
                        if let Some(allele) = registry.get_mut(&sha) {
                            arena::record_success(allele);
                            info!(
                                locus,
                                sha = %short(&sha),
                                fitness = format!("{:.2}", arena::compute_fitness(allele)),
                                "success"
                            );
                        }
                    }
                    self.post_success(locus, &sha, &output, input_json).await;
                    return Ok(Some((output, sha)));
                }
                Err(e) => {
                    last_error = e.to_string();
                    {
                        let mut registry = self.registry.write().await;
                        if let Some(allele) = registry.get_mut(&sha) {
                            arena::record_failure(allele);
                        }
                    }
                    self.check_demotion(locus, &sha).await;
                    warn!(locus, sha = %short(&sha), error = %e, "allele failed");
                }
            }
        }

        info!(locus, "all alleles exhausted, triggering mutation");
        self.try_mutation(locus, input_json, &last_error).await
    }

    /// One live gene attempt: open a transaction if required, wrap the
    /// kernel, load, call, validate. Commit on success; roll back every
    /// recorded kernel mutation on any failure.
    async fn attempt_execution(
        &self,
        locus: &str,
        risk: BlastRadius,
        use_txn: bool,
        source: &str,
        input_json: &str,
    ) -> Result<String> {
        let gene = load_gene(source)?;
        let txn = use_txn.then(|| Arc::new(Mutex::new(Transaction::new(locus, risk))));
        let sdk = SafeKernel::new(self.kernel.clone(), txn.clone());

        let result = call_gene(&gene, sdk, input_json, self.gene_timeout).await;
        match result {
            Ok(output) if validate_output(&output) => {
                if let Some(txn) = txn {
                    txn.lock().commit()?;
                }
                Ok(output)
            }
            Ok(_) => {
                self.rollback(locus, txn.as_ref());
                Err(Error::Validation {
                    locus: locus.to_string(),
                    reason: "output must be a JSON object with a boolean 'success'".into(),
                })
            }
            Err(e) => {
                self.rollback(locus, txn.as_ref());
                Err(e)
            }
        }
    }

    fn rollback(&self, locus: &str, txn: Option<&Arc<Mutex<Transaction>>>) {
        let Some(txn) = txn else { return };
        let mut txn = txn.lock();
        let had_actions = txn.action_count() > 0;
        match txn.rollback() {
            Ok(undone) if had_actions => {
                info!(locus, count = undone.len(), "rolled back kernel actions");
            }
            Ok(_) => {}
            Err(e) => warn!(locus, error = %e, "rollback failed"),
        }
    }

    /// Run a gene against a fresh shadow kernel. The shadow's output is
    /// returned to the caller, the live kernel is untouched, and the
    /// allele earns (or loses) shadow trust.
    async fn try_shadow_execution(
        &self,
        locus: &str,
        sha: &str,
        source: &str,
        input_json: &str,
    ) -> Option<String> {
        let shadow = {
            let kernel = self.kernel.lock();
            kernel.create_shadow()
        };
        let sdk = SafeKernel::new(Arc::new(Mutex::new(shadow)), None);

        let outcome = async {
            let gene = load_gene(source)?;
            let output = call_gene(&gene, sdk, input_json, self.gene_timeout).await?;
            if !validate_output(&output) {
                return Err(Error::Validation {
                    locus: locus.to_string(),
                    reason: "shadow output validation failed".into(),
                });
            }
            Ok(output)
        }
        .await;

        let mut registry = self.registry.write().await;
        let allele = registry.get_mut(sha)?;
        match outcome {
            Ok(output) => {
                allele.shadow_successes += 1;
                if allele.shadow_successes < SHADOW_PROMOTION_THRESHOLD {
                    info!(
                        locus,
                        sha = %short(sha),
                        progress = format!("{}/{}", allele.shadow_successes, SHADOW_PROMOTION_THRESHOLD),
                        "shadow success"
                    );
                } else {
                    info!(locus, sha = %short(sha), "shadow threshold met, eligible for live execution");
                }
                Some(output)
            }
            Err(e) => {
                allele.shadow_successes = 0;
                warn!(locus, sha = %short(sha), error = %e, "shadow failed");
                None
            }
        }
    }

    /// Exhaustion recovery: ask the mutation engine for a repair, up to
    /// three attempts. Each mutant registers as a child of the current
    /// dominant and joins the fallback stack before its trial run.
    async fn try_mutation(
        &self,
        locus: &str,
        input_json: &str,
        last_error: &str,
    ) -> Result<Option<(String, String)>> {
        let dominant_sha = self
            .phenotype
            .read()
            .await
            .get_dominant(locus)
            .map(ToString::to_string);
        let gene_source = match &dominant_sha {
            Some(sha) => self.registry.read().await.load_source(sha).unwrap_or_default(),
            None => String::new(),
        };

        let ctx = MutationContext {
            gene_source,
            locus: locus.to_string(),
            failing_input: input_json.to_string(),
            error_message: last_error.to_string(),
        };
        let risk = self.risk_for(locus);
        let use_txn = requires_transaction(risk);

        for attempt in 1..=MAX_MUTATION_RETRIES {
            let new_source = match self.mutation_engine.mutate(&ctx) {
                Ok(source) => source,
                Err(e) => {
                    warn!(locus, attempt, error = %e, "mutation generation failed");
                    continue;
                }
            };

            let new_sha = {
                let mut registry = self.registry.write().await;
                let generation = dominant_sha
                    .as_deref()
                    .and_then(|sha| registry.get(sha))
                    .map_or(0, |parent| parent.generation + 1);
                match registry.register(&new_source, locus, generation, dominant_sha.clone()) {
                    Ok(sha) => sha,
                    Err(e) => {
                        warn!(locus, attempt, error = %e, "mutant registration failed");
                        continue;
                    }
                }
            };
            self.phenotype.write().await.add_to_fallback(locus, &new_sha);

            match self.attempt_execution(locus, risk, use_txn, &new_source, input_json).await {
                Ok(output) => {
                    {
                        let mut registry = self.registry.write().await;
                        if let Some(allele) = registry.get_mut(&new_sha) {
                            arena::record_success(allele);
                        }
                    }
                    info!(locus, sha = %short(&new_sha), attempt, "mutant succeeded");
                    self.post_success(locus, &new_sha, &output, input_json).await;
                    return Ok(Some((output, new_sha)));
                }
                Err(e) => {
                    let mut registry = self.registry.write().await;
                    if let Some(allele) = registry.get_mut(&new_sha) {
                        arena::record_failure(allele);
                    }
                    warn!(locus, sha = %short(&new_sha), attempt, error = %e, "mutant failed");
                }
            }
        }

        warn!(locus, retries = MAX_MUTATION_RETRIES, "all mutation attempts failed");
        Ok(None)
    }

    /// Post-commit bookkeeping shared by stack and mutant successes:
    /// diagnostic feedback, verify scheduling, promotion, regression.
    async fn post_success(&self, locus: &str, sha: &str, output: &str, input_json: &str) {
        self.process_diagnostic_feedback(locus, output).await;
        self.schedule_gene_verify(locus, input_json);
        self.check_promotion(locus, sha).await;
        self.record_regression(sha).await;
    }

    /// Route a diagnostic's `healthy` verdict into the fitness records of
    /// the dominant alleles its contract feeds.
    async fn process_diagnostic_feedback(&self, locus: &str, output_json: &str) {
        let Some(contract) = self.contracts.gene(locus) else {
            return;
        };
        if contract.feeds.is_empty() {
            return;
        }
        let Ok(data) = serde_json::from_str::<Value>(output_json) else {
            return;
        };
        let Some(healthy) = data.get("healthy").and_then(Value::as_bool) else {
            return;
        };

        let override_timescale = *self.feedback_timescale.lock();
        for feed in &contract.feeds {
            let timescale = override_timescale.unwrap_or(feed.timescale);
            let target_sha = self
                .phenotype
                .read()
                .await
                .get_dominant(&feed.target_locus)
                .map(ToString::to_string);
            let Some(target_sha) = target_sha else {
                continue;
            };
            let mut registry = self.registry.write().await;
            if let Some(target) = registry.get_mut(&target_sha) {
                fitness::record_feedback(target, timescale, healthy, locus);
                info!(
                    diagnostic = locus,
                    target = %feed.target_locus,
                    timescale = timescale.as_str(),
                    healthy,
                    fitness = format!("{:.2}", arena::compute_fitness(target)),
                    "feedback recorded"
                );
            }
        }
    }

    fn schedule_gene_verify(&self, locus: &str, input_json: &str) {
        let Some(contract) = self.contracts.gene(locus) else {
            return;
        };
        if contract.family != GeneFamily::Configuration || contract.verify.is_empty() {
            return;
        }
        self.schedule_verify_block(&contract.verify, contract.verify_within.as_deref(), input_json);
    }

    /// Schedule a verify block against this orchestrator. Shared by gene,
    /// pathway, and topology contracts.
    pub fn schedule_verify_block(
        &self,
        steps: &[VerifySpec],
        within: Option<&str>,
        input_json: &str,
    ) {
        if steps.is_empty() {
            return;
        }
        let delay = match within {
            Some(text) => match parse_duration(text) {
                Ok(delay) => delay,
                Err(e) => {
                    warn!(error = %e, "skipping verify block");
                    return;
                }
            },
            None => Duration::ZERO,
        };
        self.verify.schedule(steps, delay, input_json, self.weak.clone());
    }

    /// Block until pending verify timers finish (single-shot flows).
    pub async fn wait_for_verifies(&self, timeout: Duration) {
        self.verify.wait(timeout).await;
    }

    async fn check_promotion(&self, locus: &str, sha: &str) {
        let dominant_sha = self
            .phenotype
            .read()
            .await
            .get_dominant(locus)
            .map(ToString::to_string);

        let should_promote = {
            let registry = self.registry.read().await;
            let Some(candidate) = registry.get(sha) else {
                return;
            };
            let dominant = dominant_sha.as_deref().and_then(|d| registry.get(d));
            arena::should_promote(candidate, dominant)
        };
        if !should_promote {
            return;
        }

        {
            let mut registry = self.registry.write().await;
            if let Some(candidate) = registry.get_mut(sha) {
                arena::set_dominant(candidate);
            }
            if let Some(dominant_sha) = dominant_sha.as_deref() {
                if let Some(old) = registry.get_mut(dominant_sha) {
                    arena::set_recessive(old);
                }
            }
        }
        self.phenotype.write().await.promote(locus, sha);
        info!(locus, sha = %short(sha), "promoted to dominant");
    }

    async fn check_demotion(&self, locus: &str, sha: &str) {
        let mut registry = self.registry.write().await;
        let Some(allele) = registry.get_mut(sha) else {
            return;
        };
        if arena::should_demote(allele) {
            arena::set_deprecated(allele);
            warn!(locus, sha = %short(sha), "deprecated after consecutive failures");
        }
    }

    async fn record_regression(&self, sha: &str) {
        let allele = {
            let registry = self.registry.read().await;
            registry.get(sha).cloned()
        };
        let Some(allele) = allele else { return };
        if let Some(severity) = self.regression.write().await.record(&allele) {
            warn!(
                locus = %allele.locus,
                sha = %short(sha),
                ?severity,
                "fitness regression detected"
            );
        }
    }

    // --- Fusion support (driven by the pathway engine) ---

    /// Try the fused gene for a pathway. On success the output is the
    /// whole pathway result; any failure clears the fused entry so the
    /// pathway decomposes back to steps.
    pub(crate) async fn try_fused_execution(
        &self,
        pathway_name: &str,
        input_json: &str,
    ) -> Option<String> {
        let fused_sha = self
            .phenotype
            .read()
            .await
            .get_fused(pathway_name)
            .and_then(|config| config.fused_sha.clone())?;

        let Some(source) = self.registry.read().await.load_source(&fused_sha) else {
            warn!(pathway = pathway_name, sha = %short(&fused_sha), "fused source missing");
            self.phenotype.write().await.clear_fused(pathway_name);
            return None;
        };

        let sdk = SafeKernel::new(self.kernel.clone(), None);
        let outcome = async {
            let gene = load_gene(&source)?;
            call_gene(&gene, sdk, input_json, self.gene_timeout).await
        }
        .await;

        match outcome {
            Ok(output) => {
                info!(pathway = pathway_name, "fused execution succeeded");
                self.fusion.write().await.record_fused_success(pathway_name);
                Some(output)
            }
            Err(e) => {
                warn!(pathway = pathway_name, error = %e, "fused execution failed, decomposing");
                self.fusion.write().await.record_failure(pathway_name);
                self.phenotype.write().await.clear_fused(pathway_name);
                None
            }
        }
    }

    pub(crate) async fn fusion_record_success(
        &self,
        pathway_name: &str,
        used_shas: &[String],
    ) -> Option<String> {
        self.fusion.write().await.record_success(pathway_name, used_shas)
    }

    pub(crate) async fn fusion_record_failure(&self, pathway_name: &str) {
        self.fusion.write().await.record_failure(pathway_name);
    }

    /// Generate and install a fused gene for a reinforced pathway.
    /// Failures are logged and swallowed — the pathway keeps running
    /// step-by-step.
    pub(crate) async fn fuse_pathway(
        &self,
        pathway_name: &str,
        used_shas: &[String],
        fingerprint: &str,
    ) {
        if used_shas.is_empty() {
            return;
        }
        let (sources, loci) = {
            let registry = self.registry.read().await;
            let mut sources = Vec::with_capacity(used_shas.len());
            let mut loci = Vec::with_capacity(used_shas.len());
            for sha in used_shas {
                let Some(source) = registry.load_source(sha) else {
                    warn!(pathway = pathway_name, sha = %short(sha), "cannot load constituent source");
                    return;
                };
                let Some(allele) = registry.get(sha) else {
                    return;
                };
                sources.push(source);
                loci.push(allele.locus.clone());
            }
            (sources, loci)
        };

        let fused_source = match self
            .mutation_engine
            .generate_fused(pathway_name, &sources, &loci)
        {
            Ok(source) => source,
            Err(e) => {
                warn!(pathway = pathway_name, error = %e, "fusion generation failed");
                return;
            }
        };

        let fused_sha = {
            let mut registry = self.registry.write().await;
            match registry.register(&fused_source, &loci[0], 0, None) {
                Ok(sha) => sha,
                Err(e) => {
                    warn!(pathway = pathway_name, error = %e, "fused registration failed");
                    return;
                }
            }
        };
        self.phenotype
            .write()
            .await
            .set_fused(pathway_name, &fused_sha, fingerprint);
        info!(pathway = pathway_name, sha = %short(&fused_sha), "pathway fused");
    }

    // --- Composition entry points ---

    /// Execute a named pathway. Snapshots tracked resources first; when
    /// the contract says `rollback all` and the pathway raises, every
    /// resource tracked during the run is deleted again.
    pub fn run_pathway<'a>(
        &'a self,
        pathway_name: &'a str,
        input_json: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let contract = self.contracts.pathway(pathway_name).ok_or_else(|| {
                Error::ContractLoad(format!("unknown pathway: {pathway_name}"))
            })?;

            info!(pathway = pathway_name, "executing pathway");
            let resources_before: HashSet<(String, String)> = {
                let kernel = self.kernel.lock();
                kernel.tracked_resources().into_iter().collect()
            };

            match pathway::execute_pathway(contract, input_json, self).await {
                Ok(outputs) => {
                    info!(pathway = pathway_name, outputs = outputs.len(), "pathway completed");
                    self.schedule_verify_block(
                        &contract.verify,
                        contract.verify_within.as_deref(),
                        input_json,
                    );
                    Ok(outputs)
                }
                Err(e) => {
                    if contract.on_failure == crate::contract::OnFailure::RollbackAll {
                        self.rollback_pathway_resources(&resources_before);
                    }
                    Err(e)
                }
            }
        })
    }

    fn rollback_pathway_resources(&self, before: &HashSet<(String, String)>) {
        let mut kernel = self.kernel.lock();
        let new_resources: Vec<(String, String)> = kernel
            .tracked_resources()
            .into_iter()
            .filter(|pair| !before.contains(pair))
            .collect();
        if new_resources.is_empty() {
            return;
        }
        info!(count = new_resources.len(), "rolling back pathway resources");
        for (resource_type, name) in new_resources {
            match kernel.delete_resource(&resource_type, &name) {
                Ok(()) => info!(%resource_type, %name, "cleaned up resource"),
                Err(e) => warn!(%resource_type, %name, error = %e, "cleanup failed"),
            }
        }
    }

    /// Execute a named topology by decomposing it into pathway/gene calls.
    pub async fn run_topology(&self, topology_name: &str, input_json: &str) -> Result<Vec<String>> {
        let contract = self.contracts.topology(topology_name).ok_or_else(|| {
            Error::ContractLoad(format!("unknown topology: {topology_name}"))
        })?;
        info!(topology = topology_name, "deploying topology");
        let outputs = topology::execute_topology(contract, input_json, self).await?;
        info!(topology = topology_name, outputs = outputs.len(), "topology deployed");
        Ok(outputs)
    }

    /// Flush registry index, phenotype, fusion tracks, and regression
    /// history to disk.
    pub async fn save_state(&self) -> Result<()> {
        self.registry.read().await.save_index()?;
        self.phenotype
            .read()
            .await
            .save(&self.project_root.join("phenotype.toml"))?;
        self.fusion
            .read()
            .await
            .save(&self.project_root.join("fusion_tracker.json"))?;
        let state_dir = self.project_root.join(".sg");
        std::fs::create_dir_all(&state_dir)?;
        self.regression
            .read()
            .await
            .save(&state_dir.join("regression.json"))?;
        Ok(())
    }
}

fn short(sha: &str) -> &str {
    &sha[..sha.len().min(12)]
}
