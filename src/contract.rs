//! Contract data model and store.
//!
//! Contracts describe what a locus, pathway, or topology promises. The
//! surface-syntax parser is an external collaborator; these serde types are
//! the boundary it must produce, so a frontend can hand contracts over as
//! JSON files or build them programmatically.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Whether a gene acts on the world or observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneFamily {
    Configuration,
    Diagnostic,
}

/// Blast radius of a locus, driving the transactional/shadow policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BlastRadius {
    None,
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

/// Fitness timescale a diagnostic observation lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timescale {
    Immediate,
    Convergence,
    Resilience,
}

impl Timescale {
    pub fn as_str(self) -> &'static str {
        match self {
            Timescale::Immediate => "immediate",
            Timescale::Convergence => "convergence",
            Timescale::Resilience => "resilience",
        }
    }
}

/// A field in a takes/gives block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub description: String,
}

fn default_true() -> bool {
    true
}

impl FieldDef {
    pub fn new(name: &str, field_type: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type: field_type.to_string(),
            required: true,
            optional: false,
            description: String::new(),
        }
    }

    pub fn optional(name: &str, field_type: &str) -> Self {
        Self {
            optional: true,
            ..Self::new(name, field_type)
        }
    }
}

/// A verification step: diagnostic locus plus parameter bindings.
///
/// Parameter values are literals or `{field}` references resolved against
/// the originating request's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifySpec {
    pub locus: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// A feeds declaration: where a diagnostic's outcome lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSpec {
    pub target_locus: String,
    pub timescale: Timescale,
}

/// Parsed gene contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneContract {
    pub name: String,
    pub family: GeneFamily,
    #[serde(default)]
    pub risk: BlastRadius,
    #[serde(default)]
    pub does: String,
    #[serde(default)]
    pub takes: Vec<FieldDef>,
    #[serde(default)]
    pub gives: Vec<FieldDef>,
    #[serde(default)]
    pub before: Vec<String>,
    #[serde(default)]
    pub after: Vec<String>,
    #[serde(default)]
    pub fails_when: Vec<String>,
    #[serde(default)]
    pub unhealthy_when: Vec<String>,
    #[serde(default)]
    pub verify: Vec<VerifySpec>,
    #[serde(default)]
    pub verify_within: Option<String>,
    #[serde(default)]
    pub feeds: Vec<FeedSpec>,
}

impl GeneContract {
    pub fn new(name: &str, family: GeneFamily, risk: BlastRadius) -> Self {
        Self {
            name: name.to_string(),
            family,
            risk,
            does: String::new(),
            takes: Vec::new(),
            gives: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            fails_when: Vec::new(),
            unhealthy_when: Vec::new(),
            verify: Vec::new(),
            verify_within: None,
            feeds: Vec::new(),
        }
    }

    /// Human-readable contract context for mutation prompts.
    pub fn prompt_context(&self) -> String {
        let mut sections = vec![format!("Locus: {}", self.name)];
        if !self.does.is_empty() {
            sections.push(format!("Description:\n{}", self.does));
        }
        if !self.takes.is_empty() {
            sections.push(format!("Input fields:\n{}", field_lines(&self.takes)));
        }
        if !self.gives.is_empty() {
            sections.push(format!("Output fields:\n{}", field_lines(&self.gives)));
        }
        if !self.fails_when.is_empty() {
            let lines: Vec<String> = self.fails_when.iter().map(|c| format!("  - {c}")).collect();
            sections.push(format!("Failure modes:\n{}", lines.join("\n")));
        }
        sections.join("\n\n")
    }
}

fn field_lines(fields: &[FieldDef]) -> String {
    fields
        .iter()
        .map(|f| {
            let opt = if f.optional { " (optional)" } else { "" };
            format!("  {}: {}{}", f.name, f.field_type, opt)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// One step of a pathway. Closed set of variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PathwayStepSpec {
    /// Execute a locus with bound parameters.
    Locus {
        locus: String,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
    /// Execute another pathway (`-> name` in the surface syntax).
    Composed {
        pathway: String,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
    /// Bind `variable` over an iterable referenced from the pathway input
    /// and run the body once per item.
    For {
        variable: String,
        iterable: String,
        body: Box<PathwayStepSpec>,
    },
    /// Read `field` from an earlier step's output and run the branch whose
    /// literal value matches. No match is a no-op.
    Conditional {
        step: usize,
        field: String,
        branches: Vec<(String, PathwayStepSpec)>,
    },
}

/// A declared partial order between steps: `step` needs `needs` (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDependency {
    pub step: usize,
    pub needs: usize,
}

/// What to do when a pathway or topology fails partway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    RollbackAll,
    ReportPartial,
    PreserveWhatWorks,
}

/// Parsed pathway contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathwayContract {
    pub name: String,
    #[serde(default)]
    pub risk: BlastRadius,
    #[serde(default)]
    pub does: String,
    #[serde(default)]
    pub takes: Vec<FieldDef>,
    pub steps: Vec<PathwayStepSpec>,
    #[serde(default)]
    pub requires: Vec<StepDependency>,
    #[serde(default)]
    pub verify: Vec<VerifySpec>,
    #[serde(default)]
    pub verify_within: Option<String>,
    pub on_failure: OnFailure,
}

/// A declared resource in a topology's has block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyResource {
    pub name: String,
    pub resource_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Parsed topology contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyContract {
    pub name: String,
    #[serde(default)]
    pub does: String,
    #[serde(default)]
    pub takes: Vec<FieldDef>,
    pub has: Vec<TopologyResource>,
    #[serde(default)]
    pub verify: Vec<VerifySpec>,
    #[serde(default)]
    pub verify_within: Option<String>,
    pub on_failure: OnFailure,
}

/// On-disk shape of a single contract file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "contract", rename_all = "snake_case")]
enum ContractFile {
    Gene(GeneContract),
    Pathway(PathwayContract),
    Topology(TopologyContract),
}

/// Holds every known contract, keyed by name.
#[derive(Debug, Default)]
pub struct ContractStore {
    genes: BTreeMap<String, GeneContract>,
    pathways: BTreeMap<String, PathwayContract>,
    topologies: BTreeMap<String, TopologyContract>,
}

impl ContractStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_gene(&mut self, contract: GeneContract) {
        self.genes.insert(contract.name.clone(), contract);
    }

    /// Insert a pathway after validating its dependency declarations:
    /// every `step N needs M` must have `M < N` and both steps must exist.
    pub fn insert_pathway(&mut self, contract: PathwayContract) -> Result<()> {
        let count = contract.steps.len();
        for dep in &contract.requires {
            if dep.step == 0 || dep.step > count || dep.needs == 0 || dep.needs > count {
                return Err(Error::ContractLoad(format!(
                    "pathway '{}': dependency references unknown step ({} needs {})",
                    contract.name, dep.step, dep.needs
                )));
            }
            if dep.needs >= dep.step {
                return Err(Error::ContractLoad(format!(
                    "pathway '{}': step {} cannot need later step {}",
                    contract.name, dep.step, dep.needs
                )));
            }
        }
        for step in &contract.steps {
            match step {
                PathwayStepSpec::Conditional { step: idx, branches, .. } => {
                    if *idx == 0 || *idx > count {
                        return Err(Error::ContractLoad(format!(
                            "pathway '{}': conditional references unknown step {}",
                            contract.name, idx
                        )));
                    }
                    for (_, body) in branches {
                        validate_body(&contract.name, body)?;
                    }
                }
                PathwayStepSpec::For { body, .. } => validate_body(&contract.name, body)?,
                PathwayStepSpec::Locus { .. } | PathwayStepSpec::Composed { .. } => {}
            }
        }
        self.pathways.insert(contract.name.clone(), contract);
        Ok(())
    }

    pub fn insert_topology(&mut self, contract: TopologyContract) {
        self.topologies.insert(contract.name.clone(), contract);
    }

    pub fn gene(&self, name: &str) -> Option<&GeneContract> {
        self.genes.get(name)
    }

    pub fn pathway(&self, name: &str) -> Option<&PathwayContract> {
        self.pathways.get(name)
    }

    pub fn topology(&self, name: &str) -> Option<&TopologyContract> {
        self.topologies.get(name)
    }

    pub fn known_loci(&self) -> Vec<String> {
        self.genes.keys().cloned().collect()
    }

    pub fn known_pathways(&self) -> Vec<String> {
        self.pathways.keys().cloned().collect()
    }

    pub fn known_topologies(&self) -> Vec<String> {
        self.topologies.keys().cloned().collect()
    }

    /// Load one serialized contract file produced by a parser frontend.
    pub fn load_json_file(&mut self, path: &Path) -> Result<String> {
        let text = std::fs::read_to_string(path)?;
        let file: ContractFile = serde_json::from_str(&text)
            .map_err(|e| Error::ContractLoad(format!("{}: {e}", path.display())))?;
        Ok(match file {
            ContractFile::Gene(c) => {
                let name = c.name.clone();
                self.insert_gene(c);
                name
            }
            ContractFile::Pathway(c) => {
                let name = c.name.clone();
                self.insert_pathway(c)?;
                name
            }
            ContractFile::Topology(c) => {
                let name = c.name.clone();
                self.insert_topology(c);
                name
            }
        })
    }

    /// Load every `*.json` contract under a directory tree.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        if !dir.exists() {
            return Ok(0);
        }
        let mut loaded = 0;
        let mut paths: Vec<_> = walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
            .map(|e| e.path().to_path_buf())
            .collect();
        paths.sort();
        for path in paths {
            self.load_json_file(&path)?;
            loaded += 1;
        }
        Ok(loaded)
    }
}

fn validate_body(pathway: &str, body: &PathwayStepSpec) -> Result<()> {
    match body {
        PathwayStepSpec::Locus { .. } | PathwayStepSpec::Composed { .. } => Ok(()),
        _ => Err(Error::ContractLoad(format!(
            "pathway '{pathway}': loop and conditional bodies must be locus or composed steps"
        ))),
    }
}

/// Check that a gene's output honors the wire contract: a JSON object
/// carrying a boolean `success` field.
pub fn validate_output(output_json: &str) -> bool {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(output_json) else {
        return false;
    };
    let Some(obj) = value.as_object() else {
        return false;
    };
    matches!(obj.get("success"), Some(serde_json::Value::Bool(_)))
}

/// Structural compatibility for cross-domain pool pulls: every required
/// (non-optional) field in `a`'s takes/gives must appear in `b` with the
/// same type string.
pub fn contracts_compatible(a: &GeneContract, b: &GeneContract) -> bool {
    fields_compat(&a.takes, &b.takes) && fields_compat(&a.gives, &b.gives)
}

fn fields_compat(a_fields: &[FieldDef], b_fields: &[FieldDef]) -> bool {
    let b_map: BTreeMap<&str, &FieldDef> =
        b_fields.iter().map(|f| (f.name.as_str(), f)).collect();
    for f in a_fields {
        if !f.required || f.optional {
            continue;
        }
        match b_map.get(f.name.as_str()) {
            Some(other) if other.field_type == f.field_type => {}
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gene(name: &str, takes: Vec<FieldDef>, gives: Vec<FieldDef>) -> GeneContract {
        GeneContract {
            takes,
            gives,
            ..GeneContract::new(name, GeneFamily::Configuration, BlastRadius::Low)
        }
    }

    #[test]
    fn validate_output_accepts_success_bool() {
        assert!(validate_output(r#"{"success": true}"#));
        assert!(validate_output(r#"{"success": false, "error": "x"}"#));
    }

    #[test]
    fn validate_output_rejects_bad_shapes() {
        assert!(!validate_output("not json"));
        assert!(!validate_output("[1, 2]"));
        assert!(!validate_output(r#"{"ok": true}"#));
        assert!(!validate_output(r#"{"success": "yes"}"#));
    }

    #[test]
    fn identical_contracts_compatible() {
        let a = gene("x", vec![FieldDef::new("name", "string")], vec![FieldDef::new("success", "bool")]);
        let b = gene("y", vec![FieldDef::new("name", "string")], vec![FieldDef::new("success", "bool")]);
        assert!(contracts_compatible(&a, &b));
    }

    #[test]
    fn missing_required_field_incompatible() {
        let a = gene(
            "x",
            vec![FieldDef::new("name", "string"), FieldDef::new("count", "int")],
            vec![],
        );
        let b = gene("y", vec![FieldDef::new("name", "string")], vec![]);
        assert!(!contracts_compatible(&a, &b));
    }

    #[test]
    fn type_mismatch_incompatible() {
        let a = gene("x", vec![FieldDef::new("count", "int")], vec![]);
        let b = gene("y", vec![FieldDef::new("count", "string")], vec![]);
        assert!(!contracts_compatible(&a, &b));
    }

    #[test]
    fn extra_optional_fields_still_compatible() {
        let a = gene(
            "x",
            vec![FieldDef::new("name", "string"), FieldDef::optional("delay", "int")],
            vec![],
        );
        let b = gene("y", vec![FieldDef::new("name", "string")], vec![]);
        assert!(contracts_compatible(&a, &b));
    }

    #[test]
    fn dependency_validation_rejects_forward_edges() {
        let mut store = ContractStore::new();
        let contract = PathwayContract {
            name: "p".into(),
            risk: BlastRadius::Low,
            does: String::new(),
            takes: vec![],
            steps: vec![
                PathwayStepSpec::Locus { locus: "a".into(), params: BTreeMap::new() },
                PathwayStepSpec::Locus { locus: "b".into(), params: BTreeMap::new() },
            ],
            requires: vec![StepDependency { step: 1, needs: 2 }],
            verify: vec![],
            verify_within: None,
            on_failure: OnFailure::RollbackAll,
        };
        assert!(store.insert_pathway(contract).is_err());
    }

    #[test]
    fn dependency_validation_rejects_unknown_steps() {
        let mut store = ContractStore::new();
        let contract = PathwayContract {
            name: "p".into(),
            risk: BlastRadius::Low,
            does: String::new(),
            takes: vec![],
            steps: vec![PathwayStepSpec::Locus { locus: "a".into(), params: BTreeMap::new() }],
            requires: vec![StepDependency { step: 3, needs: 1 }],
            verify: vec![],
            verify_within: None,
            on_failure: OnFailure::RollbackAll,
        };
        assert!(store.insert_pathway(contract).is_err());
    }

    #[test]
    fn contract_file_round_trip() {
        let contract = gene("bridge_create", vec![FieldDef::new("bridge_name", "string")], vec![]);
        let json = serde_json::to_string(&ContractFile::Gene(contract)).unwrap();
        let parsed: ContractFile = serde_json::from_str(&json).unwrap();
        match parsed {
            ContractFile::Gene(g) => assert_eq!(g.name, "bridge_create"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn load_dir_discovers_serialized_contracts() {
        let dir = tempfile::tempdir().unwrap();
        let contract = gene("bridge_create", vec![], vec![]);
        std::fs::write(
            dir.path().join("bridge_create.json"),
            serde_json::to_string(&ContractFile::Gene(contract)).unwrap(),
        )
        .unwrap();

        let mut store = ContractStore::new();
        assert_eq!(store.load_dir(dir.path()).unwrap(), 1);
        assert!(store.gene("bridge_create").is_some());
        assert_eq!(store.known_loci(), vec!["bridge_create"]);
    }

    #[test]
    fn malformed_contract_file_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        let mut store = ContractStore::new();
        assert!(matches!(
            store.load_json_file(&path),
            Err(Error::ContractLoad(_))
        ));
    }
}
