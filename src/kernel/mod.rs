//! Kernel interface: the capability surface a gene uses to act on the
//! world.
//!
//! The engine never special-cases a domain. A kernel describes its
//! operations, marks the mutating ones with undo metadata for the safety
//! layer, and exposes resource tracking for pathway-level rollback.

pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::topology::ResourceMapper;

pub use mock::MockNetKernel;

/// How the safety layer must treat one kernel operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Passes straight through; never recorded in the undo log.
    Read,
    /// Recorded in the undo log after a successful invocation. When
    /// `takes_snapshot` is set, the kernel captures pre-state first and
    /// the snapshot is handed back to `undo`.
    Mutating { takes_snapshot: bool },
}

/// Declared metadata for one kernel operation.
#[derive(Debug, Clone)]
pub struct OpSpec {
    pub name: &'static str,
    pub kind: OpKind,
}

impl OpSpec {
    pub const fn read(name: &'static str) -> Self {
        Self {
            name,
            kind: OpKind::Read,
        }
    }

    pub const fn mutating(name: &'static str) -> Self {
        Self {
            name,
            kind: OpKind::Mutating {
                takes_snapshot: false,
            },
        }
    }

    pub const fn mutating_with_snapshot(name: &'static str) -> Self {
        Self {
            name,
            kind: OpKind::Mutating {
                takes_snapshot: true,
            },
        }
    }
}

/// A domain's capability surface. Object-safe so the engine can hold any
/// domain behind `Box<dyn Kernel>`; operations are dispatched by name with
/// JSON values at the boundary.
pub trait Kernel: Send {
    /// Short domain identifier (e.g. `network`).
    fn domain_name(&self) -> &str;

    /// Clear all state.
    fn reset(&mut self);

    /// Fresh kernel of the same domain for shadow execution. The shadow
    /// observes none of the live state.
    fn create_shadow(&self) -> Box<dyn Kernel>;

    /// Human-readable operation signatures, for mutation prompts.
    fn describe_operations(&self) -> Vec<String>;

    /// Domain context handed to the mutation engine.
    fn mutation_prompt_context(&self) -> String;

    /// Safety metadata for an operation, or `None` if unknown.
    fn op_spec(&self, op: &str) -> Option<OpSpec>;

    /// Invoke an operation.
    fn invoke(&mut self, op: &str, args: &[Value]) -> Result<Value>;

    /// Capture the pre-state a later `undo` needs. Only called for
    /// operations declaring `takes_snapshot`.
    fn snapshot(&mut self, op: &str, args: &[Value]) -> Result<Value>;

    /// Reverse a previously successful operation.
    fn undo(&mut self, op: &str, snapshot: &Value, args: &[Value]) -> Result<()>;

    fn track_resource(&mut self, resource_type: &str, name: &str);

    fn untrack_resource(&mut self, resource_type: &str, name: &str);

    fn tracked_resources(&self) -> Vec<(String, String)>;

    /// Delete a tracked resource by domain type. Used by pathway-level
    /// rollback only.
    fn delete_resource(&mut self, resource_type: &str, name: &str) -> Result<()>;

    /// Resource-type mappers for topology decomposition.
    fn resource_mappers(&self) -> HashMap<String, ResourceMapper>;
}

/// The kernel is shared between the main execution flow and verify-timer
/// callbacks; a mutex serializes access.
pub type SharedKernel = Arc<Mutex<Box<dyn Kernel>>>;

pub fn shared(kernel: impl Kernel + 'static) -> SharedKernel {
    Arc::new(Mutex::new(Box::new(kernel)))
}

// --- Argument extraction helpers for name-dispatched operations ---

pub fn arg_str<'a>(op: &str, args: &'a [Value], idx: usize) -> Result<&'a str> {
    args.get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Kernel(format!("{op}: argument {idx} must be a string")))
}

pub fn arg_bool(op: &str, args: &[Value], idx: usize) -> Result<bool> {
    args.get(idx)
        .and_then(Value::as_bool)
        .ok_or_else(|| Error::Kernel(format!("{op}: argument {idx} must be a boolean")))
}

pub fn arg_i64(op: &str, args: &[Value], idx: usize) -> Result<i64> {
    args.get(idx)
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Kernel(format!("{op}: argument {idx} must be an integer")))
}

pub fn arg_str_list(op: &str, args: &[Value], idx: usize) -> Result<Vec<String>> {
    let list = args
        .get(idx)
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Kernel(format!("{op}: argument {idx} must be a list")))?;
    list.iter()
        .map(|v| {
            v.as_str()
                .map(ToString::to_string)
                .ok_or_else(|| Error::Kernel(format!("{op}: argument {idx} must be a list of strings")))
        })
        .collect()
}
