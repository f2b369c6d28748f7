//! Topology engine: dependency-ordered decomposition and execution.

mod common;

use common::{network_contracts, seed_source, testbed, testbed_unseeded};
use serde_json::json;

fn site_input() -> String {
    json!({
        "bridge_name": "mgmt0",
        "interfaces": ["eth0"],
        "bond_name": "bond0",
        "bond_mode": "802.3ad",
        "bond_members": ["eth2", "eth3"],
        "vlans": [100, 200]
    })
    .to_string()
}

#[tokio::test]
async fn standard_site_deploys_in_dependency_order() {
    let bed = testbed().await;
    let orch = &bed.project.orchestrator;

    let outputs = orch.run_topology("standard_site", &site_input()).await.unwrap();
    // Bridge pathway (2 steps) + bond + two VLANs.
    assert_eq!(outputs.len(), 5);

    let bridge = bed.kernel.bridge("mgmt0").unwrap();
    assert_eq!(bridge["stp_enabled"], json!(true));

    let bond = bed.kernel.bond("bond0").unwrap();
    assert_eq!(bond["mode"], json!("802.3ad"));
    assert_eq!(bond["members"], json!(["eth2", "eth3"]));

    // VLANs landed on the bond the trunk reference resolved to.
    assert!(bed.kernel.vlan("bond0", 100).is_some());
    assert!(bed.kernel.vlan("bond0", 200).is_some());
}

#[tokio::test]
async fn preserve_what_works_keeps_partial_state_and_aggregates() {
    let bed = testbed_unseeded(network_contracts());
    let orch = &bed.project.orchestrator;

    // Only bond_create is seeded: the management bridge resource will
    // exhaust, the bond must still deploy.
    {
        let mut registry = orch.registry().write().await;
        let bond = registry
            .register(&seed_source("bond_create_v1.gene"), "bond_create", 0, None)
            .unwrap();
        drop(registry);
        orch.phenotype().write().await.promote("bond_create", &bond);
    }

    let err = orch
        .run_topology("standard_site", &site_input())
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("partially failed"));
    assert!(message.contains("management"));

    // The bond survived the bridge failure.
    assert!(bed.kernel.bond("bond0").is_some());
    assert!(bed.kernel.bridge("mgmt0").is_none());
}

#[tokio::test]
async fn unknown_topology_is_a_contract_error() {
    let bed = testbed().await;
    let err = bed
        .project
        .orchestrator
        .run_topology("ghost_site", "{}")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown topology"));
}
