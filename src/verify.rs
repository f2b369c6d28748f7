//! Verify scheduler: delayed diagnostic invocation.
//!
//! After a configuration gene (or pathway or topology) succeeds, its
//! contract's verify block lists diagnostics to run after a delay,
//! against the live kernel. Results route through the normal `feeds`
//! mechanism, so fitness lands on the right timescale. A diagnostic
//! failure is logged and swallowed — the verify schedule never
//! escalates.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use regex::Regex;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::contract::VerifySpec;
use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;
use crate::pathway::resolve_binding_object;

/// Parse a duration in the `N s`, `N m`, `N h` grammar.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let re = Regex::new(r"^(\d+(?:\.\d+)?)\s*([smh])$").expect("static pattern");
    let captures = re
        .captures(text.trim())
        .ok_or_else(|| Error::ContractLoad(format!("unrecognized duration: '{text}'")))?;
    let quantity: f64 = captures[1]
        .parse()
        .map_err(|_| Error::ContractLoad(format!("unrecognized duration: '{text}'")))?;
    let seconds = match &captures[2] {
        "s" => quantity,
        "m" => quantity * 60.0,
        "h" => quantity * 3600.0,
        _ => unreachable!("pattern admits smh only"),
    };
    Ok(Duration::from_secs_f64(seconds))
}

/// Owns the set of pending verify timers. Scheduling is non-blocking;
/// timers fire on background tasks and call back into the orchestrator.
#[derive(Default)]
pub struct VerifyScheduler {
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl VerifyScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule verify steps to fire after `delay`. Params resolve
    /// against the originating request's input when the timer fires.
    pub fn schedule(
        &self,
        steps: &[VerifySpec],
        delay: Duration,
        input_json: &str,
        orchestrator: Weak<Orchestrator>,
    ) {
        let data: Map<String, Value> = serde_json::from_str(input_json).unwrap_or_default();

        for step in steps {
            let step = step.clone();
            let data = data.clone();
            let orchestrator = orchestrator.clone();
            let pending = self.pending.clone();
            pending.fetch_add(1, Ordering::SeqCst);

            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                run_step(&step, &data, &orchestrator).await;
                pending.fetch_sub(1, Ordering::SeqCst);
            });
            self.handles.lock().push(handle);
        }
    }

    /// Block until every currently-pending timer has completed, waiting
    /// at most `timeout` per timer. Used by single-shot invocations
    /// before state is saved.
    pub async fn wait(&self, timeout: Duration) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = tokio::time::timeout(timeout, handle).await;
        }
    }

    /// Outstanding timer count (for tests).
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

async fn run_step(step: &VerifySpec, data: &Map<String, Value>, orchestrator: &Weak<Orchestrator>) {
    let Some(orchestrator) = orchestrator.upgrade() else {
        return;
    };
    let resolved = Value::Object(resolve_binding_object(&step.params, data)).to_string();
    info!(locus = %step.locus, "running scheduled diagnostic");
    match orchestrator.execute_locus(&step.locus, &resolved).await {
        Ok(Some(_)) => {}
        Ok(None) => warn!(locus = %step.locus, "scheduled diagnostic returned no result"),
        Err(e) => warn!(locus = %step.locus, error = %e, "scheduled diagnostic failed"),
    }
}
