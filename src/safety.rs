//! Safety layer: transactions, undo logging, and the blast-radius policy.
//!
//! Risk drives how an execution is wrapped:
//!
//! | risk          | transaction | shadow first |
//! |---------------|-------------|--------------|
//! | none          | no          | no           |
//! | low, medium   | yes         | no           |
//! | high, critical| yes         | yes          |

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::contract::BlastRadius;
use crate::error::{Error, Result};
use crate::kernel::{OpKind, SharedKernel};

/// Shadow successes required before a high/critical allele runs live.
pub const SHADOW_PROMOTION_THRESHOLD: u32 = 3;

pub fn requires_transaction(risk: BlastRadius) -> bool {
    risk >= BlastRadius::Low
}

pub fn requires_shadow(risk: BlastRadius) -> bool {
    risk >= BlastRadius::High
}

type UndoThunk = Box<dyn FnOnce() -> Result<()> + Send>;

struct UndoAction {
    label: String,
    undo: UndoThunk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Open,
    Committed,
    RolledBack,
}

/// Per-execution undo log. Commit and rollback are terminal and mutually
/// exclusive: one or the other, never both.
pub struct Transaction {
    locus: String,
    risk: BlastRadius,
    actions: Vec<UndoAction>,
    state: TxnState,
}

impl Transaction {
    pub fn new(locus: &str, risk: BlastRadius) -> Self {
        Self {
            locus: locus.to_string(),
            risk,
            actions: Vec::new(),
            state: TxnState::Open,
        }
    }

    pub fn locus(&self) -> &str {
        &self.locus
    }

    pub fn risk(&self) -> BlastRadius {
        self.risk
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    pub fn is_committed(&self) -> bool {
        self.state == TxnState::Committed
    }

    pub fn is_rolled_back(&self) -> bool {
        self.state == TxnState::RolledBack
    }

    /// Append an undo entry for a successful mutating operation.
    pub fn record(&mut self, label: impl Into<String>, undo: UndoThunk) -> Result<()> {
        if self.state != TxnState::Open {
            return Err(Error::TransactionClosed(self.locus.clone()));
        }
        self.actions.push(UndoAction {
            label: label.into(),
            undo,
        });
        Ok(())
    }

    /// Discard the undo log; the execution's effects stand.
    pub fn commit(&mut self) -> Result<()> {
        if self.state != TxnState::Open {
            return Err(Error::TransactionClosed(self.locus.clone()));
        }
        self.actions.clear();
        self.state = TxnState::Committed;
        Ok(())
    }

    /// Invoke undo thunks in LIFO order. A failing thunk is reported and
    /// skipped; the rest of the stack still unwinds. Returns the labels
    /// of successfully undone actions, newest first.
    pub fn rollback(&mut self) -> Result<Vec<String>> {
        if self.state != TxnState::Open {
            return Err(Error::TransactionClosed(self.locus.clone()));
        }
        self.state = TxnState::RolledBack;
        let mut undone = Vec::with_capacity(self.actions.len());
        while let Some(action) = self.actions.pop() {
            match (action.undo)() {
                Ok(()) => {
                    debug!(locus = %self.locus, action = %action.label, "undid action");
                    undone.push(action.label);
                }
                Err(e) => {
                    warn!(locus = %self.locus, action = %action.label, error = %e, "undo failed");
                }
            }
        }
        Ok(undone)
    }
}

pub type SharedTransaction = Arc<Mutex<Transaction>>;

/// Wraps the shared kernel for one gene execution. Read operations pass
/// straight through; mutating operations append an undo entry to the
/// transaction after they succeed. An operation that throws leaves no
/// trace in the log — that attempt never happened.
#[derive(Clone)]
pub struct SafeKernel {
    kernel: SharedKernel,
    txn: Option<SharedTransaction>,
}

impl SafeKernel {
    pub fn new(kernel: SharedKernel, txn: Option<SharedTransaction>) -> Self {
        Self { kernel, txn }
    }

    /// Dispatch one kernel operation under the safety policy.
    pub fn call(&self, op: &str, args: &[Value]) -> Result<Value> {
        let spec = self
            .kernel
            .lock()
            .op_spec(op)
            .ok_or_else(|| Error::Kernel(format!("unknown operation '{op}'")))?;

        match spec.kind {
            OpKind::Read => self.kernel.lock().invoke(op, args),
            OpKind::Mutating { takes_snapshot } => {
                let (snapshot, output) = {
                    let mut kernel = self.kernel.lock();
                    let snapshot = if takes_snapshot {
                        kernel.snapshot(op, args)?
                    } else {
                        Value::Null
                    };
                    let output = kernel.invoke(op, args)?;
                    (snapshot, output)
                };

                if let Some(txn) = &self.txn {
                    let kernel = self.kernel.clone();
                    let op_name = op.to_string();
                    let undo_args: Vec<Value> = args.to_vec();
                    let label = action_label(op, args);
                    txn.lock().record(
                        label,
                        Box::new(move || kernel.lock().undo(&op_name, &snapshot, &undo_args)),
                    )?;
                }
                Ok(output)
            }
        }
    }

    pub fn describe_operations(&self) -> Vec<String> {
        self.kernel.lock().describe_operations()
    }
}

fn action_label(op: &str, args: &[Value]) -> String {
    match args.first().and_then(Value::as_str) {
        Some(first) => format!("{op}({first})"),
        None => op.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{shared, MockNetKernel};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_txn() -> Transaction {
        Transaction::new("bridge_create", BlastRadius::Low)
    }

    #[test]
    fn policy_table() {
        assert!(!requires_transaction(BlastRadius::None));
        assert!(requires_transaction(BlastRadius::Low));
        assert!(requires_transaction(BlastRadius::Medium));
        assert!(requires_transaction(BlastRadius::High));
        assert!(requires_transaction(BlastRadius::Critical));

        assert!(!requires_shadow(BlastRadius::None));
        assert!(!requires_shadow(BlastRadius::Medium));
        assert!(requires_shadow(BlastRadius::High));
        assert!(requires_shadow(BlastRadius::Critical));
    }

    #[test]
    fn rollback_runs_lifo() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut txn = noop_txn();
        for i in 1..=3 {
            let log = log.clone();
            txn.record(format!("action {i}"), Box::new(move || {
                log.lock().push(format!("undo {i}"));
                Ok(())
            }))
            .unwrap();
        }

        let undone = txn.rollback().unwrap();
        assert_eq!(*log.lock(), vec!["undo 3", "undo 2", "undo 1"]);
        assert_eq!(undone, vec!["action 3", "action 2", "action 1"]);
        assert!(txn.is_rolled_back());
    }

    #[test]
    fn commit_clears_log_and_is_terminal() {
        let mut txn = noop_txn();
        txn.record("action 1", Box::new(|| Ok(()))).unwrap();
        txn.commit().unwrap();
        assert!(txn.is_committed());
        assert_eq!(txn.action_count(), 0);

        assert!(matches!(txn.rollback(), Err(Error::TransactionClosed(_))));
        assert!(matches!(txn.commit(), Err(Error::TransactionClosed(_))));
        assert!(matches!(
            txn.record("late", Box::new(|| Ok(()))),
            Err(Error::TransactionClosed(_))
        ));
    }

    #[test]
    fn rollback_survives_undo_errors() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut txn = noop_txn();
        let c1 = counter.clone();
        txn.record("good 1", Box::new(move || {
            c1.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();
        txn.record("bad", Box::new(|| Err(Error::Kernel("oops".into()))))
            .unwrap();
        let c2 = counter.clone();
        txn.record("good 2", Box::new(move || {
            c2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

        let undone = txn.rollback().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(undone, vec!["good 2", "good 1"]);
    }

    #[test]
    fn safe_kernel_records_undo_for_mutations() {
        let mock = MockNetKernel::new();
        let kernel = shared(mock.clone());
        let txn = Arc::new(Mutex::new(noop_txn()));
        let safe = SafeKernel::new(kernel, Some(txn.clone()));

        safe.call("create_bridge", &[json!("br0"), json!(["eth0"])]).unwrap();
        assert_eq!(txn.lock().action_count(), 1);
        assert!(mock.bridge("br0").is_some());

        txn.lock().rollback().unwrap();
        assert!(mock.bridge("br0").is_none());
    }

    #[test]
    fn safe_kernel_restores_snapshots() {
        let mock = MockNetKernel::new();
        let kernel = shared(mock.clone());
        {
            let mut k = kernel.lock();
            k.invoke("create_bridge", &[json!("br0"), json!(["eth0"])]).unwrap();
        }
        let original_mac = mock.device_mac("br0").unwrap();

        let txn = Arc::new(Mutex::new(Transaction::new("mac_preserve", BlastRadius::Low)));
        let safe = SafeKernel::new(kernel, Some(txn.clone()));
        safe.call("set_device_mac", &[json!("br0"), json!("aa:bb:cc:dd:ee:ff")]).unwrap();
        assert_eq!(mock.device_mac("br0").unwrap(), "aa:bb:cc:dd:ee:ff");

        txn.lock().rollback().unwrap();
        assert_eq!(mock.device_mac("br0").unwrap(), original_mac);
    }

    #[test]
    fn reads_leave_no_trace() {
        let mock = MockNetKernel::new();
        let kernel = shared(mock.clone());
        {
            let mut k = kernel.lock();
            k.invoke("create_bridge", &[json!("br0"), json!(["eth0"])]).unwrap();
        }
        let txn = Arc::new(Mutex::new(noop_txn()));
        let safe = SafeKernel::new(kernel, Some(txn.clone()));
        safe.call("get_bridge", &[json!("br0")]).unwrap();
        safe.call("get_interface_state", &[json!("eth0")]).unwrap();
        assert_eq!(txn.lock().action_count(), 0);
    }

    #[test]
    fn failed_op_records_nothing() {
        let mock = MockNetKernel::new();
        let kernel = shared(mock.clone());
        let txn = Arc::new(Mutex::new(noop_txn()));
        let safe = SafeKernel::new(kernel, Some(txn.clone()));

        // Creating the same bridge twice fails the second time.
        safe.call("create_bridge", &[json!("br0"), json!([])]).unwrap();
        assert!(safe.call("create_bridge", &[json!("br0"), json!([])]).is_err());
        assert_eq!(txn.lock().action_count(), 1);
    }

    #[test]
    fn without_transaction_mutations_pass_through() {
        let mock = MockNetKernel::new();
        let kernel = shared(mock.clone());
        let safe = SafeKernel::new(kernel, None);
        safe.call("create_bridge", &[json!("br0"), json!([])]).unwrap();
        assert!(mock.bridge("br0").is_some());
    }
}
