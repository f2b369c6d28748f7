//! Tree-walking evaluator for gene scripts.
//!
//! Values are JSON values; the kernel is reachable only through the SDK
//! handle, and every kernel error surfaces as a catchable script
//! exception. An instruction fuel budget bounds runaway loops — the
//! wall-clock timeout in the loader cannot interrupt a blocking thread,
//! the fuel check can.

use std::collections::HashMap;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::parser::{BinaryOp, Expr, Function, Program, Stmt, UnaryOp};
use super::ScriptError;
use crate::registry::unix_now;
use crate::safety::SafeKernel;

/// Default instruction budget per gene call.
pub const DEFAULT_FUEL: u64 = 5_000_000;

const MAX_CALL_DEPTH: usize = 64;
const MAX_RANGE: i64 = 1_000_000;

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

pub struct Interpreter<'a> {
    program: &'a Program,
    sdk: &'a SafeKernel,
    fuel: u64,
    depth: usize,
}

type Scope = HashMap<String, Value>;

impl<'a> Interpreter<'a> {
    pub fn new(program: &'a Program, sdk: &'a SafeKernel, fuel: u64) -> Self {
        Self {
            program,
            sdk,
            fuel,
            depth: 0,
        }
    }

    /// Run the gene's `execute` entry point with the input JSON string.
    pub fn run(&mut self, input_json: &str) -> Result<Value, ScriptError> {
        let execute = self
            .program
            .functions
            .get("execute")
            .ok_or_else(|| ScriptError::Thrown("gene defines no execute function".into()))?;
        self.call_function(execute, vec![Value::String(input_json.to_string())])
    }

    fn charge(&mut self) -> Result<(), ScriptError> {
        if self.fuel == 0 {
            return Err(ScriptError::Fuel);
        }
        self.fuel -= 1;
        Ok(())
    }

    fn call_function(&mut self, function: &Function, args: Vec<Value>) -> Result<Value, ScriptError> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(ScriptError::Thrown("call depth exceeded".into()));
        }
        self.depth += 1;
        let mut scope = Scope::new();
        for (i, param) in function.params.iter().enumerate() {
            scope.insert(param.clone(), args.get(i).cloned().unwrap_or(Value::Null));
        }
        let result = self.exec_block(&function.body, &mut scope);
        self.depth -= 1;
        match result? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::Null),
        }
    }

    fn exec_block(&mut self, body: &[Stmt], scope: &mut Scope) -> Result<Flow, ScriptError> {
        for stmt in body {
            match self.exec_stmt(stmt, scope)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, scope: &mut Scope) -> Result<Flow, ScriptError> {
        self.charge()?;
        match stmt {
            Stmt::Let { name, value } => {
                let value = self.eval(value, scope)?;
                scope.insert(name.clone(), value);
                Ok(Flow::Normal)
            }
            Stmt::Assign { target, value } => {
                let value = self.eval(value, scope)?;
                self.assign(target, value, scope)?;
                Ok(Flow::Normal)
            }
            Stmt::Expr(expr) => {
                self.eval(expr, scope)?;
                Ok(Flow::Normal)
            }
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval(expr, scope)?,
                    None => Value::Null,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Throw(expr) => {
                let value = self.eval(expr, scope)?;
                Err(ScriptError::Thrown(stringify(&value)))
            }
            Stmt::If {
                condition,
                then_body,
                else_body,
            } => {
                if truthy(&self.eval(condition, scope)?) {
                    self.exec_block(then_body, scope)
                } else {
                    self.exec_block(else_body, scope)
                }
            }
            Stmt::For {
                variable,
                iterable,
                body,
            } => {
                let items = match self.eval(iterable, scope)? {
                    Value::Array(items) => items,
                    Value::Object(map) => map.keys().cloned().map(Value::String).collect(),
                    other => {
                        return Err(ScriptError::Thrown(format!(
                            "cannot iterate over {}",
                            type_name(&other)
                        )))
                    }
                };
                for item in items {
                    scope.insert(variable.clone(), item);
                    match self.exec_block(body, scope)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Try {
                body,
                error_name,
                catch_body,
            } => match self.exec_block(body, scope) {
                Ok(flow) => Ok(flow),
                Err(ScriptError::Thrown(message)) => {
                    scope.insert(error_name.clone(), Value::String(message));
                    self.exec_block(catch_body, scope)
                }
                Err(other) => Err(other),
            },
        }
    }

    fn assign(&mut self, target: &Expr, value: Value, scope: &mut Scope) -> Result<(), ScriptError> {
        match target {
            Expr::Ident(name) => {
                scope.insert(name.clone(), value);
                Ok(())
            }
            Expr::Index { .. } => {
                let (root, path) = self.index_path(target, scope)?;
                let slot = scope
                    .get_mut(&root)
                    .ok_or_else(|| ScriptError::Thrown(format!("unknown variable '{root}'")))?;
                let mut pending = Some(value);
                let mut cursor = slot;
                for (i, key) in path.iter().enumerate() {
                    let last = i == path.len() - 1;
                    match key {
                        Value::String(key) => {
                            let map = cursor.as_object_mut().ok_or_else(|| {
                                ScriptError::Thrown("string index into non-object".into())
                            })?;
                            if last {
                                map.insert(key.clone(), pending.take().expect("one insertion"));
                                return Ok(());
                            }
                            cursor = map.get_mut(key).ok_or_else(|| {
                                ScriptError::Thrown(format!("missing key '{key}'"))
                            })?;
                        }
                        Value::Number(index) => {
                            let index = index.as_u64().ok_or_else(|| {
                                ScriptError::Thrown("array index must be non-negative".into())
                            })? as usize;
                            let items = cursor.as_array_mut().ok_or_else(|| {
                                ScriptError::Thrown("numeric index into non-array".into())
                            })?;
                            if index >= items.len() {
                                return Err(ScriptError::Thrown(format!(
                                    "index {index} out of bounds"
                                )));
                            }
                            if last {
                                items[index] = pending.take().expect("one insertion");
                                return Ok(());
                            }
                            cursor = &mut items[index];
                        }
                        _ => {
                            return Err(ScriptError::Thrown(
                                "invalid index assignment target".into(),
                            ))
                        }
                    }
                }
                unreachable!("index path is never empty")
            }
            _ => Err(ScriptError::Thrown("invalid assignment target".into())),
        }
    }

    /// Flatten a nested index expression into its root variable and the
    /// evaluated key path.
    fn index_path(&mut self, expr: &Expr, scope: &mut Scope) -> Result<(String, Vec<Value>), ScriptError> {
        match expr {
            Expr::Ident(name) => Ok((name.clone(), Vec::new())),
            Expr::Index { base, index } => {
                let key = self.eval(index, scope)?;
                let (root, mut path) = self.index_path(base, scope)?;
                path.push(key);
                Ok((root, path))
            }
            _ => Err(ScriptError::Thrown("invalid index assignment target".into())),
        }
    }

    fn eval(&mut self, expr: &Expr, scope: &mut Scope) -> Result<Value, ScriptError> {
        self.charge()?;
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(value) => Ok(Value::Bool(*value)),
            Expr::Int(value) => Ok(Value::from(*value)),
            Expr::Float(value) => Ok(Value::from(*value)),
            Expr::Str(value) => Ok(Value::String(value.clone())),
            Expr::Ident(name) => scope
                .get(name)
                .cloned()
                .ok_or_else(|| ScriptError::Thrown(format!("unknown variable '{name}'"))),
            Expr::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, scope)?);
                }
                Ok(Value::Array(values))
            }
            Expr::Object(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), self.eval(value, scope)?);
                }
                Ok(Value::Object(map))
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand, scope)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                    UnaryOp::Neg => match as_number(&value) {
                        Some(n) => {
                            if value.is_i64() {
                                Ok(Value::from(-value.as_i64().unwrap_or_default()))
                            } else {
                                Ok(Value::from(-n))
                            }
                        }
                        None => Err(ScriptError::Thrown(format!(
                            "cannot negate {}",
                            type_name(&value)
                        ))),
                    },
                }
            }
            Expr::Binary { op, left, right } => self.eval_binary(*op, left, right, scope),
            Expr::Index { base, index } => {
                let base = self.eval(base, scope)?;
                let index = self.eval(index, scope)?;
                Ok(index_value(&base, &index))
            }
            Expr::Field { base, name } => {
                let base = self.eval(base, scope)?;
                Ok(base.get(name).cloned().unwrap_or(Value::Null))
            }
            Expr::Call { name, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, scope)?);
                }
                if let Some(function) = self.program.functions.get(name) {
                    let function = function.clone();
                    return self.call_function(&function, values);
                }
                builtin(name, &values)
            }
            Expr::ModuleCall { module, name, args } => {
                if !self.program.imports.iter().any(|m| m == module) {
                    return Err(ScriptError::Thrown(format!(
                        "module '{module}' not imported"
                    )));
                }
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, scope)?);
                }
                module_builtin(module, name, &values)
            }
            Expr::SdkCall { op, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, scope)?);
                }
                self.sdk
                    .call(op, &values)
                    .map_err(|e| ScriptError::Thrown(e.to_string()))
            }
        }
    }

    fn eval_binary(
        &mut self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        scope: &mut Scope,
    ) -> Result<Value, ScriptError> {
        // Short-circuit logic first.
        match op {
            BinaryOp::And => {
                let left = self.eval(left, scope)?;
                if !truthy(&left) {
                    return Ok(Value::Bool(false));
                }
                let right = self.eval(right, scope)?;
                return Ok(Value::Bool(truthy(&right)));
            }
            BinaryOp::Or => {
                let left = self.eval(left, scope)?;
                if truthy(&left) {
                    return Ok(Value::Bool(true));
                }
                let right = self.eval(right, scope)?;
                return Ok(Value::Bool(truthy(&right)));
            }
            _ => {}
        }

        let left = self.eval(left, scope)?;
        let right = self.eval(right, scope)?;
        match op {
            BinaryOp::Eq => Ok(Value::Bool(values_equal(&left, &right))),
            BinaryOp::NotEq => Ok(Value::Bool(!values_equal(&left, &right))),
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                compare(op, &left, &right)
            }
            BinaryOp::Add => add_values(&left, &right),
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Rem => arithmetic(op, &left, &right),
            BinaryOp::Div => {
                let (a, b) = both_numbers(&left, &right, "/")?;
                if b == 0.0 {
                    return Err(ScriptError::Thrown("division by zero".into()));
                }
                Ok(Value::from(a / b))
            }
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }
}

// --- Value helpers ---

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) if left.is_number() && right.is_number() => a == b,
        _ => left == right,
    }
}

fn both_numbers(left: &Value, right: &Value, op: &str) -> Result<(f64, f64), ScriptError> {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) if left.is_number() && right.is_number() => Ok((a, b)),
        _ => Err(ScriptError::Thrown(format!(
            "'{op}' needs numbers, got {} and {}",
            type_name(left),
            type_name(right)
        ))),
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ScriptError> {
    let ordering = match (left, right) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => {
            let (a, b) = both_numbers(left, right, "comparison")?;
            a.partial_cmp(&b)
                .ok_or_else(|| ScriptError::Thrown("incomparable numbers".into()))?
        }
    };
    let result = match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::LtEq => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::GtEq => ordering.is_ge(),
        _ => unreachable!(),
    };
    Ok(Value::Bool(result))
}

fn add_values(left: &Value, right: &Value) -> Result<Value, ScriptError> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
        (Value::String(a), b) => Ok(Value::String(format!("{a}{}", stringify(b)))),
        (a, Value::String(b)) => Ok(Value::String(format!("{}{b}", stringify(a)))),
        (Value::Array(a), Value::Array(b)) => {
            let mut merged = a.clone();
            merged.extend(b.iter().cloned());
            Ok(Value::Array(merged))
        }
        _ => arithmetic(BinaryOp::Add, left, right),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ScriptError> {
    let symbol = match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Rem => "%",
        _ => unreachable!(),
    };
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        return match op {
            BinaryOp::Add => Ok(Value::from(a.wrapping_add(b))),
            BinaryOp::Sub => Ok(Value::from(a.wrapping_sub(b))),
            BinaryOp::Mul => Ok(Value::from(a.wrapping_mul(b))),
            BinaryOp::Rem => {
                if b == 0 {
                    Err(ScriptError::Thrown("modulo by zero".into()))
                } else {
                    Ok(Value::from(a % b))
                }
            }
            _ => unreachable!(),
        };
    }
    let (a, b) = both_numbers(left, right, symbol)?;
    match op {
        BinaryOp::Add => Ok(Value::from(a + b)),
        BinaryOp::Sub => Ok(Value::from(a - b)),
        BinaryOp::Mul => Ok(Value::from(a * b)),
        BinaryOp::Rem => {
            if b == 0.0 {
                Err(ScriptError::Thrown("modulo by zero".into()))
            } else {
                Ok(Value::from(a % b))
            }
        }
        _ => unreachable!(),
    }
}

fn index_value(base: &Value, index: &Value) -> Value {
    match (base, index) {
        (Value::Object(map), Value::String(key)) => map.get(key).cloned().unwrap_or(Value::Null),
        (Value::Array(items), Value::Number(n)) => n
            .as_u64()
            .and_then(|i| items.get(i as usize))
            .cloned()
            .unwrap_or(Value::Null),
        (Value::String(s), Value::Number(n)) => n
            .as_u64()
            .and_then(|i| s.chars().nth(i as usize))
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// --- Builtins ---

fn expect_args(name: &str, args: &[Value], count: usize) -> Result<(), ScriptError> {
    if args.len() == count {
        Ok(())
    } else {
        Err(ScriptError::Thrown(format!(
            "{name}() takes {count} argument(s), got {}",
            args.len()
        )))
    }
}

fn expect_str<'a>(name: &str, args: &'a [Value], idx: usize) -> Result<&'a str, ScriptError> {
    args.get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| ScriptError::Thrown(format!("{name}(): argument {idx} must be a string")))
}

fn builtin(name: &str, args: &[Value]) -> Result<Value, ScriptError> {
    match name {
        "len" => {
            expect_args(name, args, 1)?;
            let length = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                other => {
                    return Err(ScriptError::Thrown(format!(
                        "len() of {}",
                        type_name(other)
                    )))
                }
            };
            Ok(Value::from(length as i64))
        }
        "str" => {
            expect_args(name, args, 1)?;
            Ok(Value::String(stringify(&args[0])))
        }
        "int" => {
            expect_args(name, args, 1)?;
            match &args[0] {
                Value::Number(n) => Ok(Value::from(n.as_f64().unwrap_or_default() as i64)),
                Value::Bool(b) => Ok(Value::from(i64::from(*b))),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| ScriptError::Thrown(format!("int(): cannot parse '{s}'"))),
                other => Err(ScriptError::Thrown(format!("int() of {}", type_name(other)))),
            }
        }
        "float" => {
            expect_args(name, args, 1)?;
            match &args[0] {
                Value::Number(n) => Ok(Value::from(n.as_f64().unwrap_or_default())),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::from)
                    .map_err(|_| ScriptError::Thrown(format!("float(): cannot parse '{s}'"))),
                other => Err(ScriptError::Thrown(format!(
                    "float() of {}",
                    type_name(other)
                ))),
            }
        }
        "abs" => {
            expect_args(name, args, 1)?;
            if let Some(i) = args[0].as_i64() {
                Ok(Value::from(i.abs()))
            } else if let Some(f) = args[0].as_f64() {
                Ok(Value::from(f.abs()))
            } else {
                Err(ScriptError::Thrown("abs() needs a number".into()))
            }
        }
        "min" | "max" => {
            let pool: Vec<f64> = number_pool(name, args)?;
            let result = if name == "min" {
                pool.iter().copied().fold(f64::INFINITY, f64::min)
            } else {
                pool.iter().copied().fold(f64::NEG_INFINITY, f64::max)
            };
            if result.fract() == 0.0 && result.abs() < 9e15 {
                Ok(Value::from(result as i64))
            } else {
                Ok(Value::from(result))
            }
        }
        "sum" => {
            let pool: Vec<f64> = number_pool(name, args)?;
            let total: f64 = pool.iter().sum();
            if total.fract() == 0.0 && total.abs() < 9e15 {
                Ok(Value::from(total as i64))
            } else {
                Ok(Value::from(total))
            }
        }
        "sorted" => {
            expect_args(name, args, 1)?;
            let mut items = args[0]
                .as_array()
                .cloned()
                .ok_or_else(|| ScriptError::Thrown("sorted() needs an array".into()))?;
            items.sort_by(|a, b| match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) if a.is_number() && b.is_number() => {
                    x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal)
                }
                _ => stringify(a).cmp(&stringify(b)),
            });
            Ok(Value::Array(items))
        }
        "range" => {
            let (start, end) = match args.len() {
                1 => (0, args[0].as_i64().unwrap_or(0)),
                2 => (args[0].as_i64().unwrap_or(0), args[1].as_i64().unwrap_or(0)),
                _ => return Err(ScriptError::Thrown("range() takes 1 or 2 arguments".into())),
            };
            if end - start > MAX_RANGE {
                return Err(ScriptError::Thrown("range() too large".into()));
            }
            Ok(Value::Array((start..end).map(Value::from).collect()))
        }
        "keys" => {
            expect_args(name, args, 1)?;
            let map = args[0]
                .as_object()
                .ok_or_else(|| ScriptError::Thrown("keys() needs an object".into()))?;
            Ok(Value::Array(map.keys().cloned().map(Value::String).collect()))
        }
        "values" => {
            expect_args(name, args, 1)?;
            let map = args[0]
                .as_object()
                .ok_or_else(|| ScriptError::Thrown("values() needs an object".into()))?;
            Ok(Value::Array(map.values().cloned().collect()))
        }
        "has" => {
            expect_args(name, args, 2)?;
            let map = args[0]
                .as_object()
                .ok_or_else(|| ScriptError::Thrown("has() needs an object".into()))?;
            let key = expect_str(name, args, 1)?;
            Ok(Value::Bool(map.contains_key(key)))
        }
        "get" => {
            // get(object, key, default) — missing keys fall back.
            if args.len() != 3 {
                return Err(ScriptError::Thrown("get() takes 3 arguments".into()));
            }
            let key = expect_str(name, args, 1)?;
            match args[0].as_object() {
                Some(map) => Ok(map.get(key).cloned().unwrap_or_else(|| args[2].clone())),
                None => Err(ScriptError::Thrown("get() needs an object".into())),
            }
        }
        "type_of" => {
            expect_args(name, args, 1)?;
            Ok(Value::String(type_name(&args[0]).to_string()))
        }
        "push" => {
            expect_args(name, args, 2)?;
            let mut items = args[0]
                .as_array()
                .cloned()
                .ok_or_else(|| ScriptError::Thrown("push() needs an array".into()))?;
            items.push(args[1].clone());
            Ok(Value::Array(items))
        }
        "contains" => {
            expect_args(name, args, 2)?;
            let found = match &args[0] {
                Value::String(s) => args[1].as_str().is_some_and(|needle| s.contains(needle)),
                Value::Array(items) => items.iter().any(|item| values_equal(item, &args[1])),
                Value::Object(map) => args[1].as_str().is_some_and(|key| map.contains_key(key)),
                other => {
                    return Err(ScriptError::Thrown(format!(
                        "contains() of {}",
                        type_name(other)
                    )))
                }
            };
            Ok(Value::Bool(found))
        }
        "join" => {
            expect_args(name, args, 2)?;
            let items = args[0]
                .as_array()
                .ok_or_else(|| ScriptError::Thrown("join() needs an array".into()))?;
            let sep = expect_str(name, args, 1)?;
            let parts: Vec<String> = items.iter().map(stringify).collect();
            Ok(Value::String(parts.join(sep)))
        }
        "split" => {
            expect_args(name, args, 2)?;
            let text = expect_str(name, args, 0)?;
            let sep = expect_str(name, args, 1)?;
            Ok(Value::Array(
                text.split(sep)
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            ))
        }
        "trim" => {
            expect_args(name, args, 1)?;
            Ok(Value::String(expect_str(name, args, 0)?.trim().to_string()))
        }
        "lower" => {
            expect_args(name, args, 1)?;
            Ok(Value::String(expect_str(name, args, 0)?.to_lowercase()))
        }
        "upper" => {
            expect_args(name, args, 1)?;
            Ok(Value::String(expect_str(name, args, 0)?.to_uppercase()))
        }
        _ => Err(ScriptError::Thrown(format!("unknown function '{name}'"))),
    }
}

fn number_pool(name: &str, args: &[Value]) -> Result<Vec<f64>, ScriptError> {
    let source: Vec<&Value> = if args.len() == 1 {
        match &args[0] {
            Value::Array(items) => items.iter().collect(),
            single => vec![single],
        }
    } else {
        args.iter().collect()
    };
    if source.is_empty() {
        return Err(ScriptError::Thrown(format!("{name}() of empty sequence")));
    }
    source
        .iter()
        .map(|v| {
            v.as_f64()
                .ok_or_else(|| ScriptError::Thrown(format!("{name}() needs numbers")))
        })
        .collect()
}

fn module_builtin(module: &str, name: &str, args: &[Value]) -> Result<Value, ScriptError> {
    match (module, name) {
        ("json", "parse") => {
            expect_args("json::parse", args, 1)?;
            let text = expect_str("json::parse", args, 0)?;
            serde_json::from_str(text)
                .map_err(|e| ScriptError::Thrown(format!("invalid json: {e}")))
        }
        ("json", "dump") => {
            expect_args("json::dump", args, 1)?;
            Ok(Value::String(args[0].to_string()))
        }
        ("math", "floor") => {
            expect_args("math::floor", args, 1)?;
            let n = args[0]
                .as_f64()
                .ok_or_else(|| ScriptError::Thrown("math::floor needs a number".into()))?;
            Ok(Value::from(n.floor() as i64))
        }
        ("math", "ceil") => {
            expect_args("math::ceil", args, 1)?;
            let n = args[0]
                .as_f64()
                .ok_or_else(|| ScriptError::Thrown("math::ceil needs a number".into()))?;
            Ok(Value::from(n.ceil() as i64))
        }
        ("math", "sqrt") => {
            expect_args("math::sqrt", args, 1)?;
            let n = args[0]
                .as_f64()
                .ok_or_else(|| ScriptError::Thrown("math::sqrt needs a number".into()))?;
            Ok(Value::from(n.sqrt()))
        }
        ("math", "pow") => {
            expect_args("math::pow", args, 2)?;
            let base = args[0]
                .as_f64()
                .ok_or_else(|| ScriptError::Thrown("math::pow needs numbers".into()))?;
            let exp = args[1]
                .as_f64()
                .ok_or_else(|| ScriptError::Thrown("math::pow needs numbers".into()))?;
            Ok(Value::from(base.powf(exp)))
        }
        ("text", "starts_with") => {
            expect_args("text::starts_with", args, 2)?;
            Ok(Value::Bool(
                expect_str("text::starts_with", args, 0)?
                    .starts_with(expect_str("text::starts_with", args, 1)?),
            ))
        }
        ("text", "ends_with") => {
            expect_args("text::ends_with", args, 2)?;
            Ok(Value::Bool(
                expect_str("text::ends_with", args, 0)?
                    .ends_with(expect_str("text::ends_with", args, 1)?),
            ))
        }
        ("text", "replace") => {
            expect_args("text::replace", args, 3)?;
            Ok(Value::String(expect_str("text::replace", args, 0)?.replace(
                expect_str("text::replace", args, 1)?,
                expect_str("text::replace", args, 2)?,
            )))
        }
        ("hash", "sha256") => {
            expect_args("hash::sha256", args, 1)?;
            let text = expect_str("hash::sha256", args, 0)?;
            Ok(Value::String(hex::encode(Sha256::digest(text.as_bytes()))))
        }
        ("time", "now") => {
            expect_args("time::now", args, 0)?;
            Ok(Value::from(unix_now()))
        }
        _ => Err(ScriptError::Thrown(format!(
            "unknown function '{module}::{name}'"
        ))),
    }
}
