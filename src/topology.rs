//! Topology engine: decompose declared resources into pathway/gene calls.
//!
//! A topology declares *what* resources should exist. The engine figures
//! out *how*: resolve references, order resources by their inter-resource
//! dependencies (Kahn's algorithm), and map each resource through the
//! domain's injected resource-type mapper.
//!
//! Composition hierarchy: topology → pathway → locus → allele.

use std::collections::{HashMap, VecDeque};

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::contract::{OnFailure, TopologyContract, TopologyResource};
use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;

/// What a decomposed resource executes as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyAction {
    Pathway,
    Gene,
    LoopGene,
}

/// One resolved execution step produced by decomposition.
#[derive(Debug, Clone)]
pub struct TopologyStep {
    /// Resource name from the has block (e.g. `management`).
    pub resource_name: String,
    pub action: TopologyAction,
    /// Pathway or gene name to execute.
    pub target: String,
    pub input_json: String,
    /// Per-item inputs when `action` is `LoopGene`.
    pub loop_items: Vec<String>,
}

/// Maps one resource of a known type to an execution step. Injected by
/// the kernel so the engine stays domain-agnostic.
pub type ResourceMapper = fn(&TopologyResource, &Map<String, Value>) -> Result<TopologyStep>;

/// Resolve a `{reference}` property value from topology input, or return
/// the literal.
pub fn resolve_value(value: &str, data: &Map<String, Value>) -> Value {
    let re = Regex::new(r"^\{(\w+)\}$").expect("static pattern");
    if let Some(captures) = re.captures(value) {
        let key = &captures[1];
        if let Some(found) = data.get(key) {
            return found.clone();
        }
    }
    Value::String(value.to_string())
}

/// Dependency edges from inter-resource references: a property whose
/// literal value equals another resource's name makes this resource
/// depend on it.
fn build_dependency_graph(resources: &[TopologyResource]) -> HashMap<String, Vec<String>> {
    let names: Vec<&str> = resources.iter().map(|r| r.name.as_str()).collect();
    let mut depends_on: HashMap<String, Vec<String>> = HashMap::new();
    for resource in resources {
        for value in resource.properties.values() {
            if value != &resource.name && names.contains(&value.as_str()) {
                depends_on
                    .entry(resource.name.clone())
                    .or_default()
                    .push(value.clone());
            }
        }
    }
    depends_on
}

/// Kahn's algorithm. A cycle is a fatal topology error.
fn topological_sort<'a>(
    resources: &'a [TopologyResource],
    depends_on: &HashMap<String, Vec<String>>,
) -> Result<Vec<&'a TopologyResource>> {
    let by_name: HashMap<&str, &TopologyResource> =
        resources.iter().map(|r| (r.name.as_str(), r)).collect();
    let mut in_degree: HashMap<&str, usize> =
        resources.iter().map(|r| (r.name.as_str(), 0)).collect();
    let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();

    for (node, deps) in depends_on {
        in_degree.insert(node.as_str(), deps.len());
        for dep in deps {
            reverse.entry(dep.as_str()).or_default().push(node.as_str());
        }
    }

    let mut queue: VecDeque<&str> = resources
        .iter()
        .map(|r| r.name.as_str())
        .filter(|name| in_degree[name] == 0)
        .collect();
    let mut ordered = Vec::with_capacity(resources.len());

    while let Some(name) = queue.pop_front() {
        ordered.push(by_name[name]);
        if let Some(dependents) = reverse.get(name) {
            for dependent in dependents {
                let degree = in_degree.get_mut(dependent).expect("known node");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if ordered.len() != resources.len() {
        let seen: Vec<&str> = ordered.iter().map(|r| r.name.as_str()).collect();
        let stuck: Vec<&str> = resources
            .iter()
            .map(|r| r.name.as_str())
            .filter(|n| !seen.contains(n))
            .collect();
        return Err(Error::Topology(format!(
            "circular dependency among resources: {}",
            stuck.join(", ")
        )));
    }
    Ok(ordered)
}

/// Decompose a topology into ordered execution steps:
/// resolve references, build the dependency graph, sort, then apply the
/// domain mapper per resource.
pub fn decompose(
    topology: &TopologyContract,
    input_json: &str,
    mappers: &HashMap<String, ResourceMapper>,
) -> Result<Vec<TopologyStep>> {
    let data: Map<String, Value> = serde_json::from_str(input_json)?;
    let depends_on = build_dependency_graph(&topology.has);
    let ordered = topological_sort(&topology.has, &depends_on)?;

    let mut steps = Vec::with_capacity(ordered.len());
    for resource in ordered {
        let mapper = mappers.get(&resource.resource_type).ok_or_else(|| {
            Error::Topology(format!(
                "unknown resource type '{}' for resource '{}'",
                resource.resource_type, resource.name
            ))
        })?;
        steps.push(mapper(resource, &data)?);
    }
    Ok(steps)
}

/// Execute a topology step by step.
///
/// `preserve what works` captures per-resource errors, keeps going, and
/// raises an aggregate at the end; any other policy re-raises on the
/// first error. Verify diagnostics are scheduled after full success.
pub async fn execute_topology(
    topology: &TopologyContract,
    input_json: &str,
    orchestrator: &Orchestrator,
) -> Result<Vec<String>> {
    let mappers = orchestrator.kernel_mappers();
    let steps = decompose(topology, input_json, &mappers)?;
    let mut outputs = Vec::new();
    let mut errors = Vec::new();
    let preserve = topology.on_failure == OnFailure::PreserveWhatWorks;

    for step in &steps {
        info!(
            resource = %step.resource_name,
            action = ?step.action,
            target = %step.target,
            "topology step"
        );
        let result = run_step(step, orchestrator).await;
        match result {
            Ok(mut step_outputs) => outputs.append(&mut step_outputs),
            Err(e) => {
                let msg = format!("resource '{}' failed: {e}", step.resource_name);
                warn!("{msg}");
                if preserve {
                    errors.push(msg);
                } else {
                    return Err(Error::Topology(msg));
                }
            }
        }
    }

    if !errors.is_empty() {
        return Err(Error::Topology(format!(
            "topology partially failed ({} error(s)): {}",
            errors.len(),
            errors.join("; ")
        )));
    }

    orchestrator
        .schedule_verify_block(&topology.verify, topology.verify_within.as_deref(), input_json);
    Ok(outputs)
}

async fn run_step(step: &TopologyStep, orchestrator: &Orchestrator) -> Result<Vec<String>> {
    match step.action {
        TopologyAction::Pathway => orchestrator.run_pathway(&step.target, &step.input_json).await,
        TopologyAction::Gene => {
            let result = orchestrator.execute_locus(&step.target, &step.input_json).await?;
            match result {
                Some((output, _)) => Ok(vec![output]),
                None => Err(Error::Topology(format!(
                    "all alleles exhausted for {}",
                    step.target
                ))),
            }
        }
        TopologyAction::LoopGene => {
            let mut outputs = Vec::with_capacity(step.loop_items.len());
            for item_input in &step.loop_items {
                let result = orchestrator.execute_locus(&step.target, item_input).await?;
                match result {
                    Some((output, _)) => outputs.push(output),
                    None => {
                        return Err(Error::Topology(format!(
                            "all alleles exhausted for {}",
                            step.target
                        )))
                    }
                }
            }
            Ok(outputs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn resource(name: &str, rtype: &str, props: &[(&str, &str)]) -> TopologyResource {
        TopologyResource {
            name: name.to_string(),
            resource_type: rtype.to_string(),
            properties: props
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        }
    }

    fn topology(resources: Vec<TopologyResource>) -> TopologyContract {
        TopologyContract {
            name: "site".into(),
            does: String::new(),
            takes: vec![],
            has: resources,
            verify: vec![],
            verify_within: None,
            on_failure: OnFailure::PreserveWhatWorks,
        }
    }

    fn passthrough(resource: &TopologyResource, _data: &Map<String, Value>) -> Result<TopologyStep> {
        Ok(TopologyStep {
            resource_name: resource.name.clone(),
            action: TopologyAction::Gene,
            target: resource.resource_type.clone(),
            input_json: "{}".into(),
            loop_items: vec![],
        })
    }

    fn mappers_for(types: &[&str]) -> HashMap<String, ResourceMapper> {
        types
            .iter()
            .map(|t| ((*t).to_string(), passthrough as ResourceMapper))
            .collect()
    }

    #[test]
    fn resolve_value_handles_refs_and_literals() {
        let mut data = Map::new();
        data.insert("uplink".into(), Value::String("eth1".into()));
        assert_eq!(resolve_value("{uplink}", &data), Value::String("eth1".into()));
        assert_eq!(resolve_value("eth9", &data), Value::String("eth9".into()));
        // Unknown refs stay literal.
        assert_eq!(resolve_value("{missing}", &data), Value::String("{missing}".into()));
    }

    #[test]
    fn dependencies_order_resources() {
        let topo = topology(vec![
            resource("vm_traffic", "vlan_set", &[("trunk", "storage")]),
            resource("storage", "bond", &[]),
        ]);
        let steps = decompose(&topo, "{}", &mappers_for(&["vlan_set", "bond"])).unwrap();
        let order: Vec<&str> = steps.iter().map(|s| s.resource_name.as_str()).collect();
        assert_eq!(order, vec!["storage", "vm_traffic"]);
    }

    #[test]
    fn cycle_is_fatal() {
        let topo = topology(vec![
            resource("a", "bond", &[("peer", "b")]),
            resource("b", "bond", &[("peer", "a")]),
        ]);
        let err = decompose(&topo, "{}", &mappers_for(&["bond"])).unwrap_err();
        assert!(matches!(err, Error::Topology(_)));
    }

    #[test]
    fn unknown_resource_type_is_fatal() {
        let topo = topology(vec![resource("a", "volcano", &[])]);
        let err = decompose(&topo, "{}", &mappers_for(&["bond"])).unwrap_err();
        assert!(matches!(err, Error::Topology(_)));
    }

    #[test]
    fn independent_resources_keep_declaration_order() {
        let topo = topology(vec![
            resource("first", "bond", &[]),
            resource("second", "bond", &[]),
            resource("third", "bond", &[]),
        ]);
        let steps = decompose(&topo, "{}", &mappers_for(&["bond"])).unwrap();
        let order: Vec<&str> = steps.iter().map(|s| s.resource_name.as_str()).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }
}
