//! Pathway engine: ordered step composition with late-bound inputs.
//!
//! Execution is fusion-aware: the fused gene runs first when one exists,
//! and the pathway decomposes back to individual steps if it fails. Step
//! inputs are built from parameter maps whose `{field}` references
//! resolve against the pathway's original input.

use std::collections::BTreeMap;

use futures_util::future::BoxFuture;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::info;

use crate::contract::{PathwayContract, PathwayStepSpec};
use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;

/// Build a step input object from parameter bindings. `{field}` values
/// resolve from `data` (undefined references are dropped); literals that
/// read as JSON scalars keep their type, everything else stays a string.
pub fn resolve_binding_object(
    params: &BTreeMap<String, String>,
    data: &Map<String, Value>,
) -> Map<String, Value> {
    let re = Regex::new(r"^\{(\w+)\}$").expect("static pattern");
    let mut resolved = Map::new();
    for (name, value) in params {
        if let Some(captures) = re.captures(value) {
            if let Some(found) = data.get(&captures[1]) {
                resolved.insert(name.clone(), found.clone());
            }
        } else {
            resolved.insert(name.clone(), literal_value(value));
        }
    }
    resolved
}

fn literal_value(text: &str) -> Value {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ (Value::Number(_) | Value::Bool(_))) => value,
        _ => Value::String(text.to_string()),
    }
}

/// Execute a pathway, returning the list of step outputs.
pub async fn execute_pathway(
    contract: &PathwayContract,
    input_json: &str,
    orchestrator: &Orchestrator,
) -> Result<Vec<String>> {
    if let Some(output) = orchestrator
        .try_fused_execution(&contract.name, input_json)
        .await
    {
        return Ok(vec![output]);
    }

    let data: Map<String, Value> = serde_json::from_str(input_json)?;
    let mut run = PathwayRun {
        contract,
        orchestrator,
        outputs: Vec::new(),
        step_outputs: vec![None; contract.steps.len()],
        used_shas: Vec::new(),
    };

    for index in 0..contract.steps.len() {
        let step = &contract.steps[index];
        match run.run_step(step, &data).await {
            Ok(last_output) => run.step_outputs[index] = last_output,
            Err(e) => {
                orchestrator.fusion_record_failure(&contract.name).await;
                return Err(e);
            }
        }
    }

    let used_shas = run.used_shas;
    let outputs = run.outputs;
    if let Some(fingerprint) = orchestrator
        .fusion_record_success(&contract.name, &used_shas)
        .await
    {
        info!(pathway = %contract.name, "fusion threshold reached");
        orchestrator
            .fuse_pathway(&contract.name, &used_shas, &fingerprint)
            .await;
    }

    Ok(outputs)
}

struct PathwayRun<'a> {
    contract: &'a PathwayContract,
    orchestrator: &'a Orchestrator,
    outputs: Vec<String>,
    /// Last output per declared step, for conditional field reads.
    step_outputs: Vec<Option<String>>,
    used_shas: Vec<String>,
}

impl PathwayRun<'_> {
    fn run_step<'a>(
        &'a mut self,
        step: &'a PathwayStepSpec,
        data: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(self.run_step_inner(step, data))
    }

    async fn run_step_inner(
        &mut self,
        step: &PathwayStepSpec,
        data: &Map<String, Value>,
    ) -> Result<Option<String>> {
        match step {
            PathwayStepSpec::Locus { locus, params } => {
                let input = Value::Object(resolve_binding_object(params, data)).to_string();
                self.run_locus(locus, &input).await.map(Some)
            }
            PathwayStepSpec::Composed { pathway, params } => {
                let input = Value::Object(resolve_binding_object(params, data)).to_string();
                let sub_outputs = self.orchestrator.run_pathway(pathway, &input).await?;
                let last = sub_outputs.last().cloned();
                self.outputs.extend(sub_outputs);
                Ok(last)
            }
            PathwayStepSpec::For {
                variable,
                iterable,
                body,
            } => {
                let field = iterable.trim_start_matches('{').trim_end_matches('}');
                let items = data
                    .get(field)
                    .and_then(Value::as_array)
                    .cloned()
                    .ok_or_else(|| Error::Pathway {
                        pathway: self.contract.name.clone(),
                        step: format!("for {variable}"),
                        reason: format!("input field '{field}' is not an iterable"),
                    })?;
                let mut last = None;
                for item in items {
                    let mut bound = data.clone();
                    bound.insert(variable.clone(), item);
                    last = self.run_step(body, &bound).await?;
                }
                Ok(last)
            }
            PathwayStepSpec::Conditional {
                step: earlier,
                field,
                branches,
            } => {
                let Some(Some(earlier_output)) =
                    earlier.checked_sub(1).and_then(|i| self.step_outputs.get(i))
                else {
                    return Ok(None);
                };
                let value: Value = serde_json::from_str(earlier_output).unwrap_or(Value::Null);
                let observed = branch_key(value.get(field.as_str()).unwrap_or(&Value::Null));
                let chosen = branches
                    .iter()
                    .find(|(literal, _)| literal == &observed)
                    .map(|(_, body)| body.clone());
                match chosen {
                    Some(body) => self.run_step(&body, data).await,
                    None => Ok(None),
                }
            }
        }
    }

    async fn run_locus(&mut self, locus: &str, input: &str) -> Result<String> {
        let result = self
            .orchestrator
            .execute_locus(locus, input)
            .await
            .map_err(|e| Error::Pathway {
                pathway: self.contract.name.clone(),
                step: locus.to_string(),
                reason: e.to_string(),
            })?;
        match result {
            Some((output, sha)) => {
                self.outputs.push(output.clone());
                self.used_shas.push(sha);
                Ok(output)
            }
            None => Err(Error::Pathway {
                pathway: self.contract.name.clone(),
                step: locus.to_string(),
                reason: "all alleles exhausted".into(),
            }),
        }
    }
}

fn branch_key(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn references_resolve_from_input() {
        let resolved = resolve_binding_object(
            &params(&[("bridge_name", "{bridge_name}"), ("mode", "fast")]),
            &data(json!({"bridge_name": "br0", "interfaces": ["eth0"]})),
        );
        assert_eq!(resolved["bridge_name"], json!("br0"));
        assert_eq!(resolved["mode"], json!("fast"));
    }

    #[test]
    fn undefined_references_are_dropped() {
        let resolved = resolve_binding_object(
            &params(&[("uplink", "{uplink}")]),
            &data(json!({"bridge_name": "br0"})),
        );
        assert!(resolved.is_empty());
    }

    #[test]
    fn scalar_literals_keep_their_type() {
        let resolved = resolve_binding_object(
            &params(&[("forward_delay", "15"), ("stp_enabled", "true"), ("name", "br0")]),
            &data(json!({})),
        );
        assert_eq!(resolved["forward_delay"], json!(15));
        assert_eq!(resolved["stp_enabled"], json!(true));
        assert_eq!(resolved["name"], json!("br0"));
    }

    #[test]
    fn references_preserve_value_shapes() {
        let resolved = resolve_binding_object(
            &params(&[("interfaces", "{interfaces}"), ("delay", "{forward_delay}")]),
            &data(json!({"interfaces": ["eth0", "eth1"], "forward_delay": 15})),
        );
        assert_eq!(resolved["interfaces"], json!(["eth0", "eth1"]));
        assert_eq!(resolved["delay"], json!(15));
    }

    #[test]
    fn branch_keys_stringify_scalars() {
        assert_eq!(branch_key(&json!("up")), "up");
        assert_eq!(branch_key(&json!(true)), "true");
        assert_eq!(branch_key(&json!(3)), "3");
        assert_eq!(branch_key(&Value::Null), "null");
    }
}
