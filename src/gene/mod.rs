//! Gene loading and sandboxed execution.
//!
//! Genes are source strings in a small deterministic script dialect. The
//! loader parses the source, enforces the module allowlist before
//! anything runs, and checks for the `execute` entry point. Execution
//! happens on a blocking thread under a wall-clock timeout, with the
//! interpreter's fuel budget as the hard stop; the kernel is reachable
//! only through the injected SDK handle.

pub mod interp;
pub mod lexer;
pub mod parser;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::safety::SafeKernel;
use interp::Interpreter;
use parser::Program;

pub use interp::DEFAULT_FUEL;
pub use parser::SDK_HANDLE;

/// Modules a gene may `use`. Everything else fails at load time.
pub const ALLOWED_MODULES: &[&str] = &["json", "math", "text", "hash", "time"];

/// Default wall-clock budget per gene call.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Script-level failures, pre-taxonomy.
#[derive(Debug)]
pub enum ScriptError {
    /// Lexing or parsing failed.
    Parse(String),
    /// A runtime exception; catchable by the gene's `try`/`catch`.
    Thrown(String),
    /// Instruction budget exhausted. Never catchable.
    Fuel,
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptError::Parse(msg) => write!(f, "parse error: {msg}"),
            ScriptError::Thrown(msg) => write!(f, "{msg}"),
            ScriptError::Fuel => write!(f, "instruction budget exhausted"),
        }
    }
}

/// A loaded, executable gene.
#[derive(Debug, Clone)]
pub struct Gene {
    program: Arc<Program>,
}

/// Parse and validate a gene source. Import violations and a missing or
/// malformed `execute` entry point are load errors — nothing runs.
pub fn load_gene(source: &str) -> Result<Gene> {
    let tokens = lexer::tokenize(source).map_err(|e| Error::GeneLoad(e.to_string()))?;
    let program = parser::parse(&tokens).map_err(|e| Error::GeneLoad(e.to_string()))?;

    for module in &program.imports {
        if !ALLOWED_MODULES.contains(&module.as_str()) {
            return Err(Error::GeneImport(format!(
                "gene cannot use '{module}' — allowed modules: {}",
                ALLOWED_MODULES.join(", ")
            )));
        }
    }

    let execute = program
        .functions
        .get("execute")
        .ok_or_else(|| Error::GeneLoad("gene defines no execute function".into()))?;
    if execute.params.len() != 1 {
        return Err(Error::GeneLoad(format!(
            "execute must take exactly one parameter, takes {}",
            execute.params.len()
        )));
    }

    Ok(Gene {
        program: Arc::new(program),
    })
}

/// Call a loaded gene with an input JSON string under a wall-clock
/// timeout. Returns the gene's output JSON string.
pub async fn call_gene(
    gene: &Gene,
    sdk: SafeKernel,
    input_json: &str,
    timeout: Duration,
) -> Result<String> {
    let program = gene.program.clone();
    let input = input_json.to_string();

    let task = tokio::task::spawn_blocking(move || {
        let mut interpreter = Interpreter::new(&program, &sdk, DEFAULT_FUEL);
        interpreter.run(&input)
    });

    let joined = tokio::time::timeout(timeout, task)
        .await
        .map_err(|_| Error::GeneTimeout(timeout.as_secs()))?
        .map_err(|e| Error::GeneRuntime(format!("gene execution aborted: {e}")))?;

    match joined {
        Ok(Value::String(output)) => Ok(output),
        Ok(other) => Err(Error::GeneRuntime(format!(
            "execute returned a non-string value: {other}"
        ))),
        Err(ScriptError::Thrown(message)) => Err(Error::GeneRuntime(message)),
        Err(ScriptError::Fuel) => Err(Error::GeneRuntime("instruction budget exhausted".into())),
        Err(ScriptError::Parse(message)) => Err(Error::GeneLoad(message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{shared, MockNetKernel};
    use serde_json::json;

    fn sdk() -> SafeKernel {
        SafeKernel::new(shared(MockNetKernel::new()), None)
    }

    async fn run(source: &str, input: &str) -> Result<String> {
        let gene = load_gene(source)?;
        call_gene(&gene, sdk(), input, Duration::from_secs(5)).await
    }

    #[test]
    fn echo_gene_round_trips() {
        let output = tokio_test::block_on(run("fn execute(input) { return input; }", "{\"a\": 1}"))
            .unwrap();
        assert_eq!(output, "{\"a\": 1}");
    }

    #[tokio::test]
    async fn json_parse_and_dump() {
        let source = r#"
use json;

fn execute(input) {
    let data = json::parse(input);
    let name = data["bridge_name"];
    return json::dump({ "success": true, "bridge": name });
}
"#;
        let output = run(source, r#"{"bridge_name": "br0"}"#).await.unwrap();
        let value: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["bridge"], json!("br0"));
    }

    #[tokio::test]
    async fn sdk_calls_reach_the_kernel() {
        let mock = MockNetKernel::new();
        let safe = SafeKernel::new(shared(mock.clone()), None);
        let source = r#"
use json;

fn execute(input) {
    let data = json::parse(input);
    sdk.create_bridge(data["bridge_name"], data["interfaces"]);
    return json::dump({ "success": true });
}
"#;
        let gene = load_gene(source).unwrap();
        let output = call_gene(
            &gene,
            safe,
            r#"{"bridge_name": "br0", "interfaces": ["eth0"]}"#,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(output.contains("true"));
        assert!(mock.bridge("br0").is_some());
    }

    #[tokio::test]
    async fn kernel_errors_are_catchable() {
        let source = r#"
use json;

fn execute(input) {
    try {
        sdk.get_device_mac("ghost0");
        return json::dump({ "success": true });
    } catch (e) {
        return json::dump({ "success": false, "error": e });
    }
}
"#;
        let output = run(source, "{}").await.unwrap();
        let value: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["success"], json!(false));
        assert!(value["error"].as_str().unwrap().contains("ghost0"));
    }

    #[tokio::test]
    async fn import_violation_fails_before_execution() {
        let err = load_gene("use filesystem;\nfn execute(input) { return input; }").unwrap_err();
        assert!(matches!(err, Error::GeneImport(_)));
    }

    #[tokio::test]
    async fn missing_execute_is_a_load_error() {
        let err = load_gene("fn main(input) { return input; }").unwrap_err();
        assert!(matches!(err, Error::GeneLoad(_)));
    }

    #[tokio::test]
    async fn thrown_errors_surface_as_runtime_failures() {
        let err = run("fn execute(input) { throw \"boom\"; }", "{}")
            .await
            .unwrap_err();
        match err {
            Error::GeneRuntime(msg) => assert_eq!(msg, "boom"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_string_return_is_rejected() {
        let err = run("fn execute(input) { return 42; }", "{}").await.unwrap_err();
        assert!(matches!(err, Error::GeneRuntime(_)));
    }

    #[tokio::test]
    async fn runaway_loop_hits_fuel_limit() {
        let source = r#"
fn execute(input) {
    let total = 0;
    for i in range(1000000) {
        for j in range(1000000) {
            total = total + 1;
        }
    }
    return str(total);
}
"#;
        let err = run(source, "{}").await.unwrap_err();
        assert!(matches!(err, Error::GeneRuntime(_)));
    }

    #[tokio::test]
    async fn helper_functions_and_control_flow() {
        let source = r#"
use json;

fn classify(n) {
    if n >= 10 { return "big"; }
    else if n >= 5 { return "medium"; }
    return "small";
}

fn execute(input) {
    let data = json::parse(input);
    let sizes = [];
    for n in data["numbers"] {
        sizes = push(sizes, classify(n));
    }
    return json::dump({ "success": true, "sizes": sizes });
}
"#;
        let output = run(source, r#"{"numbers": [1, 7, 12]}"#).await.unwrap();
        let value: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["sizes"], json!(["small", "medium", "big"]));
    }

    #[tokio::test]
    async fn object_grouping_idiom() {
        // The shape diagnostics use: group FDB entries by MAC, then find
        // MACs appearing on more than one port.
        let source = r#"
use json;

fn execute(input) {
    let data = json::parse(input);
    let by_mac = {};
    for entry in data["fdb"] {
        let mac = entry["mac"];
        let ports = [];
        if has(by_mac, mac) {
            ports = by_mac[mac];
        }
        if !contains(ports, entry["port"]) {
            ports = push(ports, entry["port"]);
        }
        by_mac[mac] = ports;
    }
    let flapping = [];
    for mac in by_mac {
        if len(by_mac[mac]) > 1 {
            flapping = push(flapping, mac);
        }
    }
    return json::dump({ "success": true, "flapping": flapping });
}
"#;
        let input = r#"{"fdb": [
            {"mac": "aa", "port": "eth0"},
            {"mac": "aa", "port": "eth1"},
            {"mac": "bb", "port": "eth0"}
        ]}"#;
        let output = run(source, input).await.unwrap();
        let value: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["flapping"], json!(["aa"]));
    }
}
