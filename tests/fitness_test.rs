//! Two-family feedback: diagnostics observing the world move the
//! fitness of the configuration alleles that shaped it.

mod common;

use common::testbed;
use serde_json::json;
use symbiont::arena;
use symbiont::contract::Timescale;

fn provision_input() -> String {
    json!({
        "bridge_name": "br0",
        "interfaces": ["eth0"],
        "uplink": "eth1",
        "stp_enabled": true,
        "forward_delay": 15
    })
    .to_string()
}

#[tokio::test]
async fn healthy_diagnostic_feeds_positive_convergence() {
    let bed = testbed().await;
    let orch = &bed.project.orchestrator;

    orch.run_pathway("provision_management_bridge", &provision_input())
        .await
        .unwrap();
    orch.run_pathway("health_check_bridge", &json!({"bridge_name": "br0"}).to_string())
        .await
        .unwrap();

    let dominant = {
        let phenotype = orch.phenotype().read().await;
        phenotype.get_dominant("bridge_create").unwrap().to_string()
    };
    let registry = orch.registry().read().await;
    let allele = registry.get(&dominant).unwrap();
    let convergence: Vec<_> = allele
        .fitness_records
        .iter()
        .filter(|r| r.timescale == Timescale::Convergence)
        .collect();
    assert!(!convergence.is_empty());
    assert!(convergence.iter().all(|r| r.success));
    assert!(convergence
        .iter()
        .any(|r| r.source_locus == "check_connectivity"));
}

#[tokio::test]
async fn unhealthy_diagnostic_reduces_config_fitness() {
    let bed = testbed().await;
    let orch = &bed.project.orchestrator;

    orch.run_pathway("provision_management_bridge", &provision_input())
        .await
        .unwrap();

    let health_input = json!({"bridge_name": "br0"}).to_string();
    orch.run_pathway("health_check_bridge", &health_input)
        .await
        .unwrap();

    let dominant = {
        let phenotype = orch.phenotype().read().await;
        phenotype.get_dominant("bridge_create").unwrap().to_string()
    };
    let healthy_fitness = {
        let registry = orch.registry().read().await;
        arena::compute_fitness(registry.get(&dominant).unwrap())
    };

    // Take the bridge port down; the connectivity check turns unhealthy.
    bed.kernel.inject_link_failure("eth0");
    orch.run_pathway("health_check_bridge", &health_input)
        .await
        .unwrap();

    let registry = orch.registry().read().await;
    let unhealthy_fitness = arena::compute_fitness(registry.get(&dominant).unwrap());
    assert!(unhealthy_fitness < healthy_fitness);
}

#[tokio::test]
async fn mac_flapping_records_negative_feedback() {
    let bed = testbed().await;
    let orch = &bed.project.orchestrator;

    orch.run_pathway("provision_management_bridge", &provision_input())
        .await
        .unwrap();
    bed.kernel
        .inject_mac_flapping("br0", "de:ad:be:ef:00:01", &["eth0", "eth1"])
        .unwrap();
    orch.run_pathway("health_check_bridge", &json!({"bridge_name": "br0"}).to_string())
        .await
        .unwrap();

    let dominant = {
        let phenotype = orch.phenotype().read().await;
        phenotype.get_dominant("bridge_create").unwrap().to_string()
    };
    let registry = orch.registry().read().await;
    let allele = registry.get(&dominant).unwrap();
    assert!(allele.fitness_records.iter().any(|r| !r.success));

    // check_mac_stability also feeds mac_preserve.
    drop(registry);
    let mac_dominant = {
        let phenotype = orch.phenotype().read().await;
        phenotype.get_dominant("mac_preserve").unwrap().to_string()
    };
    let registry = orch.registry().read().await;
    let mac_allele = registry.get(&mac_dominant).unwrap();
    assert!(mac_allele
        .fitness_records
        .iter()
        .any(|r| r.source_locus == "check_mac_stability" && !r.success));
}

#[tokio::test]
async fn feedback_timescale_override_routes_to_resilience() {
    let bed = testbed().await;
    let orch = &bed.project.orchestrator;

    orch.run_pathway("provision_management_bridge", &provision_input())
        .await
        .unwrap();

    orch.set_feedback_timescale(Some(Timescale::Resilience));
    orch.run_pathway("health_check_bridge", &json!({"bridge_name": "br0"}).to_string())
        .await
        .unwrap();
    orch.set_feedback_timescale(None);

    let dominant = {
        let phenotype = orch.phenotype().read().await;
        phenotype.get_dominant("bridge_create").unwrap().to_string()
    };
    let registry = orch.registry().read().await;
    let allele = registry.get(&dominant).unwrap();
    assert!(allele
        .fitness_records
        .iter()
        .all(|r| r.timescale == Timescale::Resilience));
}

#[tokio::test]
async fn regression_detector_tracks_executed_alleles() {
    let bed = testbed().await;
    let orch = &bed.project.orchestrator;

    orch.execute_locus(
        "bridge_create",
        &json!({"bridge_name": "br0", "interfaces": []}).to_string(),
    )
    .await
    .unwrap();

    let dominant = {
        let phenotype = orch.phenotype().read().await;
        phenotype.get_dominant("bridge_create").unwrap().to_string()
    };
    let detector = orch.regression_detector().read().await;
    let history = detector.get_history(&dominant).unwrap();
    assert_eq!(history.samples, 1);
    assert!(history.peak_fitness > 0.0);
}
