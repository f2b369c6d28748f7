//! Shared test bed: the demo network domain (contracts, seed genes,
//! mutation fixtures) wired into a project under a temp root.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use symbiont::contract::{
    BlastRadius, ContractStore, FeedSpec, FieldDef, GeneContract, GeneFamily, OnFailure,
    PathwayContract, PathwayStepSpec, StepDependency, Timescale, TopologyContract,
    TopologyResource, VerifySpec,
};
use symbiont::kernel::MockNetKernel;
use symbiont::mutation::FixtureMutationEngine;
use symbiont::project::Project;

pub struct TestBed {
    pub dir: TempDir,
    pub project: Project,
    pub kernel: MockNetKernel,
}

pub fn manifest_path(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join(relative)
}

pub fn params(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

fn gene(name: &str, family: GeneFamily, risk: BlastRadius) -> GeneContract {
    let mut contract = GeneContract::new(name, family, risk);
    contract.gives = vec![FieldDef::new("success", "bool")];
    contract
}

fn diagnostic(name: &str, feeds: &[(&str, Timescale)]) -> GeneContract {
    let mut contract = gene(name, GeneFamily::Diagnostic, BlastRadius::None);
    contract.gives.push(FieldDef::new("healthy", "bool"));
    contract.feeds = feeds
        .iter()
        .map(|(target, timescale)| FeedSpec {
            target_locus: (*target).to_string(),
            timescale: *timescale,
        })
        .collect();
    contract
}

fn locus_step(locus: &str, bound: &[(&str, &str)]) -> PathwayStepSpec {
    PathwayStepSpec::Locus {
        locus: locus.to_string(),
        params: params(bound),
    }
}

/// The standard demo network contract set.
pub fn network_contracts() -> ContractStore {
    let mut store = ContractStore::new();

    let mut bridge_create = gene("bridge_create", GeneFamily::Configuration, BlastRadius::Low);
    bridge_create.takes = vec![
        FieldDef::new("bridge_name", "string"),
        FieldDef::new("interfaces", "string[]"),
    ];
    store.insert_gene(bridge_create);

    let mut bridge_stp = gene("bridge_stp", GeneFamily::Configuration, BlastRadius::Low);
    bridge_stp.takes = vec![
        FieldDef::new("bridge_name", "string"),
        FieldDef::new("stp_enabled", "bool"),
        FieldDef::new("forward_delay", "int"),
    ];
    store.insert_gene(bridge_stp);

    let mut bridge_uplink = gene("bridge_uplink", GeneFamily::Configuration, BlastRadius::Low);
    bridge_uplink.takes = vec![
        FieldDef::new("bridge_name", "string"),
        FieldDef::new("uplink", "string"),
    ];
    store.insert_gene(bridge_uplink);

    let mut mac_preserve = gene("mac_preserve", GeneFamily::Configuration, BlastRadius::Low);
    mac_preserve.takes = vec![
        FieldDef::new("device", "string"),
        FieldDef::optional("source_mac", "string"),
        FieldDef::optional("send_arp", "bool"),
    ];
    store.insert_gene(mac_preserve);

    let mut vlan_create = gene("vlan_create", GeneFamily::Configuration, BlastRadius::Low);
    vlan_create.takes = vec![
        FieldDef::new("parent", "string"),
        FieldDef::new("vlan_id", "int"),
    ];
    store.insert_gene(vlan_create);

    let mut bond_create = gene("bond_create", GeneFamily::Configuration, BlastRadius::Low);
    bond_create.takes = vec![
        FieldDef::new("bond_name", "string"),
        FieldDef::optional("mode", "string"),
        FieldDef::new("members", "string[]"),
    ];
    store.insert_gene(bond_create);

    store.insert_gene(diagnostic(
        "check_connectivity",
        &[("bridge_create", Timescale::Convergence)],
    ));
    store.insert_gene(diagnostic(
        "check_mac_stability",
        &[
            ("bridge_create", Timescale::Convergence),
            ("mac_preserve", Timescale::Convergence),
        ],
    ));
    store.insert_gene(diagnostic(
        "check_link_state",
        &[("bridge_create", Timescale::Resilience)],
    ));
    store.insert_gene(diagnostic(
        "check_bond_state",
        &[("bond_create", Timescale::Convergence)],
    ));

    store
        .insert_pathway(PathwayContract {
            name: "configure_bridge_with_stp".into(),
            risk: BlastRadius::Low,
            does: "Create a bridge and enable STP on it.".into(),
            takes: vec![
                FieldDef::new("bridge_name", "string"),
                FieldDef::new("interfaces", "string[]"),
                FieldDef::new("stp_enabled", "bool"),
                FieldDef::new("forward_delay", "int"),
            ],
            steps: vec![
                locus_step(
                    "bridge_create",
                    &[("bridge_name", "{bridge_name}"), ("interfaces", "{interfaces}")],
                ),
                locus_step(
                    "bridge_stp",
                    &[
                        ("bridge_name", "{bridge_name}"),
                        ("stp_enabled", "{stp_enabled}"),
                        ("forward_delay", "{forward_delay}"),
                    ],
                ),
            ],
            requires: vec![StepDependency { step: 2, needs: 1 }],
            verify: vec![],
            verify_within: None,
            on_failure: OnFailure::RollbackAll,
        })
        .unwrap();

    store
        .insert_pathway(PathwayContract {
            name: "provision_management_bridge".into(),
            risk: BlastRadius::Medium,
            does: "Full management bridge: create, STP, uplink.".into(),
            takes: vec![
                FieldDef::new("bridge_name", "string"),
                FieldDef::new("interfaces", "string[]"),
                FieldDef::new("uplink", "string"),
                FieldDef::new("stp_enabled", "bool"),
                FieldDef::new("forward_delay", "int"),
            ],
            steps: vec![
                locus_step(
                    "bridge_create",
                    &[("bridge_name", "{bridge_name}"), ("interfaces", "{interfaces}")],
                ),
                locus_step(
                    "bridge_stp",
                    &[
                        ("bridge_name", "{bridge_name}"),
                        ("stp_enabled", "{stp_enabled}"),
                        ("forward_delay", "{forward_delay}"),
                    ],
                ),
                locus_step(
                    "bridge_uplink",
                    &[("bridge_name", "{bridge_name}"), ("uplink", "{uplink}")],
                ),
            ],
            requires: vec![
                StepDependency { step: 2, needs: 1 },
                StepDependency { step: 3, needs: 1 },
            ],
            verify: vec![],
            verify_within: None,
            on_failure: OnFailure::RollbackAll,
        })
        .unwrap();

    store
        .insert_pathway(PathwayContract {
            name: "health_check_bridge".into(),
            risk: BlastRadius::None,
            does: "Connectivity and MAC stability sweep over one bridge.".into(),
            takes: vec![FieldDef::new("bridge_name", "string")],
            steps: vec![
                locus_step("check_connectivity", &[("bridge_name", "{bridge_name}")]),
                locus_step("check_mac_stability", &[("bridge_name", "{bridge_name}")]),
            ],
            requires: vec![],
            verify: vec![],
            verify_within: None,
            on_failure: OnFailure::ReportPartial,
        })
        .unwrap();

    store.insert_topology(TopologyContract {
        name: "standard_site".into(),
        does: "Management bridge, storage bond, VLAN segmentation.".into(),
        takes: vec![
            FieldDef::new("bridge_name", "string"),
            FieldDef::new("interfaces", "string[]"),
            FieldDef::new("bond_name", "string"),
            FieldDef::new("bond_mode", "string"),
            FieldDef::new("bond_members", "string[]"),
            FieldDef::new("vlans", "int[]"),
        ],
        has: vec![
            TopologyResource {
                name: "management".into(),
                resource_type: "bridge".into(),
                properties: params(&[("stp", "enabled")]),
            },
            TopologyResource {
                name: "storage".into(),
                resource_type: "bond".into(),
                properties: params(&[("mode", "{bond_mode}"), ("members", "{bond_members}")]),
            },
            TopologyResource {
                name: "vm_traffic".into(),
                resource_type: "vlan_bridges".into(),
                properties: params(&[("trunk", "storage"), ("vlans", "{vlans}")]),
            },
        ],
        verify: vec![],
        verify_within: None,
        on_failure: OnFailure::PreserveWhatWorks,
    });

    store
}

/// Contract set with `mac_preserve` forced to high risk, for shadow-mode
/// scenarios.
pub fn network_contracts_high_risk_mac() -> ContractStore {
    let mut store = network_contracts();
    let mut mac = gene("mac_preserve", GeneFamily::Configuration, BlastRadius::High);
    mac.takes = vec![
        FieldDef::new("device", "string"),
        FieldDef::optional("source_mac", "string"),
    ];
    store.insert_gene(mac);
    store
}

/// Contract set where `bridge_create` declares a verify diagnostic.
pub fn contracts_with_verify(within: &str) -> ContractStore {
    let mut store = network_contracts();
    let mut bridge_create = gene("bridge_create", GeneFamily::Configuration, BlastRadius::Low);
    bridge_create.takes = vec![
        FieldDef::new("bridge_name", "string"),
        FieldDef::new("interfaces", "string[]"),
    ];
    bridge_create.verify = vec![VerifySpec {
        locus: "check_connectivity".into(),
        params: params(&[("bridge_name", "{bridge_name}")]),
    }];
    bridge_create.verify_within = Some(within.to_string());
    store.insert_gene(bridge_create);
    store
}

fn copy_seed_genes(dest_root: &Path) {
    let src = manifest_path("genes");
    let dest = dest_root.join("genes");
    std::fs::create_dir_all(&dest).unwrap();
    for entry in std::fs::read_dir(src).unwrap() {
        let path = entry.unwrap().path();
        if path.is_file() {
            std::fs::copy(&path, dest.join(path.file_name().unwrap())).unwrap();
        }
    }
}

/// Project with contracts installed but no seeds registered.
pub fn testbed_unseeded(contracts: ContractStore) -> TestBed {
    symbiont::telemetry::init();
    let dir = TempDir::new().unwrap();
    copy_seed_genes(dir.path());
    let kernel = MockNetKernel::new();
    let project = Project::open(
        dir.path(),
        contracts,
        Box::new(kernel.clone()),
        Arc::new(FixtureMutationEngine::new(manifest_path("fixtures"))),
    )
    .unwrap();
    TestBed {
        dir,
        project,
        kernel,
    }
}

/// Fully seeded project over the standard contract set.
pub async fn testbed() -> TestBed {
    testbed_with(network_contracts()).await
}

pub async fn testbed_with(contracts: ContractStore) -> TestBed {
    let bed = testbed_unseeded(contracts);
    bed.project.init_seeds().await.unwrap();
    bed
}

/// Read a seed gene's source from the repo tree.
pub fn seed_source(name: &str) -> String {
    std::fs::read_to_string(manifest_path("genes").join(name)).unwrap()
}

pub const THROWING_GENE: &str = "fn execute(input) { throw \"x\"; }";
