//! Tree-walking evaluator for parsed scripts.
//!
//! All state a script can touch lives here: an arena of lexical scopes,
//! the environment view with its pending changes, captured console output
//! and registered test results. Nothing reaches the host except through
//! the builtins dispatched in [`Interpreter::call_global`].

use super::ast::*;
use super::error::{Result, ScriptError};
use super::value::{
    format_number, lookup, set_property, Builtin, Closure, RegexValue, ScopeId, Value,
    MAX_STRING_LEN,
};
use super::ScriptBudget;
use crate::assertion::{Expectation, PASSED};
use crate::model::{
    Environment, EnvironmentChange, HttpResponse, LogLevel, ScriptLog, TestResult,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use url::form_urlencoded;

const GLOBAL_SCOPE: ScopeId = 0;
const MAX_ARRAY_GAP: usize = 10_000;
const MAX_ARRAY_LEN: usize = 1 << 20;

const STRING_METHODS: &[&str] = &[
    "includes",
    "startsWith",
    "endsWith",
    "indexOf",
    "toUpperCase",
    "toLowerCase",
    "trim",
    "split",
    "slice",
    "substring",
    "replace",
    "toString",
];

const ARRAY_METHODS: &[&str] = &[
    "push", "pop", "includes", "indexOf", "join", "map", "filter", "find", "some", "every",
    "forEach", "slice",
];

struct Binding {
    value: Value,
    constant: bool,
}

#[derive(Default)]
struct Scope {
    vars: HashMap<String, Binding>,
    parent: Option<ScopeId>,
}

enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

/// Step, call-depth and wall-clock accounting for one execution.
struct Meter {
    steps: u64,
    max_steps: u64,
    depth: usize,
    max_depth: usize,
    deadline: Instant,
    time_limit_ms: u64,
}

impl Meter {
    fn new(budget: &ScriptBudget) -> Self {
        Meter {
            steps: 0,
            max_steps: budget.max_steps,
            depth: 0,
            max_depth: budget.max_call_depth,
            deadline: Instant::now() + Duration::from_millis(budget.time_limit_ms),
            time_limit_ms: budget.time_limit_ms,
        }
    }

    fn tick(&mut self) -> Result<()> {
        self.steps += 1;
        if self.steps > self.max_steps {
            return Err(ScriptError::BudgetExceeded(format!(
                "more than {} evaluation steps",
                self.max_steps
            )));
        }
        if self.steps % 256 == 0 && Instant::now() >= self.deadline {
            return Err(ScriptError::BudgetExceeded(format!(
                "ran longer than {} ms",
                self.time_limit_ms
            )));
        }
        Ok(())
    }

    fn enter(&mut self) -> Result<()> {
        if self.depth >= self.max_depth {
            return Err(ScriptError::BudgetExceeded(format!(
                "call depth above {}",
                self.max_depth
            )));
        }
        self.depth += 1;
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }
}

/// Everything a finished script produced.
pub struct Effects {
    pub logs: Vec<ScriptLog>,
    pub environment_changes: Vec<EnvironmentChange>,
    pub tests: Vec<TestResult>,
}

pub struct Interpreter<'a> {
    scopes: Vec<Scope>,
    meter: Meter,
    closures: usize,
    environment: Option<&'a Environment>,
    changes: Vec<EnvironmentChange>,
    logs: Vec<ScriptLog>,
    tests: Vec<TestResult>,
    response: Option<&'a HttpResponse>,
}

impl<'a> Interpreter<'a> {
    pub fn new(budget: &ScriptBudget, environment: Option<&'a Environment>) -> Self {
        let mut interpreter = Interpreter {
            scopes: vec![Scope::default()],
            meter: Meter::new(budget),
            closures: 0,
            environment,
            changes: Vec::new(),
            logs: Vec::new(),
            tests: Vec::new(),
            response: None,
        };
        interpreter.install_common();
        interpreter
    }

    fn namespace(paths: &[(&str, &'static str)]) -> Value {
        Value::object(
            paths
                .iter()
                .map(|(name, path)| (name.to_string(), Value::global(*path)))
                .collect(),
        )
    }

    fn install_common(&mut self) {
        self.define_global(
            "environment",
            Self::namespace(&[("get", "environment.get"), ("set", "environment.set")]),
        );
        self.define_global(
            "console",
            Self::namespace(&[
                ("log", "console.log"),
                ("info", "console.info"),
                ("warn", "console.warn"),
                ("error", "console.error"),
            ]),
        );
        self.define_global(
            "utils",
            Self::namespace(&[
                ("uuid", "utils.uuid"),
                ("base64Encode", "utils.base64Encode"),
                ("base64Decode", "utils.base64Decode"),
                ("urlEncode", "utils.urlEncode"),
                ("urlDecode", "utils.urlDecode"),
            ]),
        );
        self.define_global(
            "JSON",
            Self::namespace(&[("stringify", "JSON.stringify"), ("parse", "JSON.parse")]),
        );
        self.define_global(
            "Math",
            Self::namespace(&[
                ("floor", "Math.floor"),
                ("ceil", "Math.ceil"),
                ("round", "Math.round"),
                ("abs", "Math.abs"),
                ("min", "Math.min"),
                ("max", "Math.max"),
            ]),
        );
        self.define_global("Date", Self::namespace(&[("now", "Date.now")]));
        self.define_global(
            "Object",
            Self::namespace(&[("keys", "Object.keys"), ("values", "Object.values")]),
        );
        self.define_global("Array", Self::namespace(&[("isArray", "Array.isArray")]));
        for name in ["Error", "String", "Number", "parseInt", "parseFloat"] {
            self.define_global(name, Value::global(name));
        }
    }

    pub fn define_global(&mut self, name: &str, value: Value) {
        self.scopes[GLOBAL_SCOPE].vars.insert(
            name.to_string(),
            Binding {
                value,
                constant: false,
            },
        );
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.scopes[GLOBAL_SCOPE]
            .vars
            .get(name)
            .map(|b| b.value.clone())
    }

    /// Expose `response`, `test` and `expect` for the test phase.
    pub fn install_response(&mut self, response: &'a HttpResponse) {
        self.response = Some(response);
        let headers = response
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect();
        let object = Value::object(vec![
            ("status".into(), Value::Number(f64::from(response.status))),
            ("statusText".into(), Value::from(response.status_text.as_str())),
            ("headers".into(), Value::object(headers)),
            ("data".into(), Value::from_json(&response.data)),
            ("time".into(), Value::Number(response.time as f64)),
            ("size".into(), Value::Number(response.size as f64)),
            ("json".into(), Value::global("response.json")),
            ("text".into(), Value::global("response.text")),
            ("header".into(), Value::global("response.header")),
        ]);
        self.define_global("response", object);
        self.define_global("test", Value::global("test"));
        self.define_global("expect", Value::global("expect"));
    }

    /// Build `pm` out of whichever phase globals are installed.
    pub fn install_pm(&mut self) {
        let entries = ["environment", "request", "response", "test", "expect"]
            .into_iter()
            .filter_map(|name| self.global(name).map(|v| (name.to_string(), v)))
            .collect();
        self.define_global("pm", Value::object(entries));
    }

    pub fn run(&mut self, program: &[Statement]) -> Result<()> {
        self.exec_block(program, GLOBAL_SCOPE)?;
        Ok(())
    }

    pub fn into_effects(self) -> Effects {
        Effects {
            logs: self.logs,
            environment_changes: self.changes,
            tests: self.tests,
        }
    }

    // Scopes

    fn push_scope(&mut self, parent: ScopeId) -> ScopeId {
        self.scopes.push(Scope {
            vars: HashMap::new(),
            parent: Some(parent),
        });
        self.scopes.len() - 1
    }

    /// Run `f` in a fresh child scope, releasing it afterwards unless a
    /// closure may have captured it.
    fn with_scope<T>(
        &mut self,
        parent: ScopeId,
        f: impl FnOnce(&mut Self, ScopeId) -> Result<T>,
    ) -> Result<T> {
        let mark = self.scopes.len();
        let closures = self.closures;
        let scope = self.push_scope(parent);
        let result = f(self, scope);
        if self.closures == closures {
            self.scopes.truncate(mark);
        }
        result
    }

    fn declare(&mut self, scope: ScopeId, name: &str, value: Value, constant: bool) {
        self.scopes[scope]
            .vars
            .insert(name.to_string(), Binding { value, constant });
    }

    fn resolve_scope(&self, name: &str, scope: ScopeId) -> Option<ScopeId> {
        let mut cursor = Some(scope);
        while let Some(id) = cursor {
            if self.scopes[id].vars.contains_key(name) {
                return Some(id);
            }
            cursor = self.scopes[id].parent;
        }
        None
    }

    fn lookup_var(&self, name: &str, scope: ScopeId) -> Result<Value> {
        self.resolve_scope(name, scope)
            .and_then(|id| self.scopes[id].vars.get(name))
            .map(|b| b.value.clone())
            .ok_or_else(|| ScriptError::Reference(name.to_string()))
    }

    fn assign_var(&mut self, name: &str, value: Value, scope: ScopeId) -> Result<()> {
        let id = self
            .resolve_scope(name, scope)
            .ok_or_else(|| ScriptError::Reference(name.to_string()))?;
        match self.scopes[id].vars.get_mut(name) {
            Some(binding) if binding.constant => Err(ScriptError::type_error(format!(
                "Assignment to constant variable '{name}'"
            ))),
            Some(binding) => {
                binding.value = value;
                Ok(())
            }
            None => Err(ScriptError::Reference(name.to_string())),
        }
    }

    // Statements

    fn exec_block(&mut self, statements: &[Statement], scope: ScopeId) -> Result<Flow> {
        for statement in statements {
            match self.exec(statement, scope)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, statement: &Statement, scope: ScopeId) -> Result<Flow> {
        self.meter.tick()?;
        match statement {
            Statement::Let {
                name,
                value,
                constant,
            } => {
                let value = match value {
                    Some(expr) => self.eval(expr, scope)?,
                    None => Value::Undefined,
                };
                self.declare(scope, name, value, *constant);
                Ok(Flow::Normal)
            }
            Statement::Expression(expr) => {
                self.eval(expr, scope)?;
                Ok(Flow::Normal)
            }
            Statement::If {
                condition,
                then_branch,
                else_branch,
            } => {
                if self.eval(condition, scope)?.truthy() {
                    self.exec(then_branch, scope)
                } else if let Some(branch) = else_branch {
                    self.exec(branch, scope)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Statement::ForOf {
                name,
                iterable,
                body,
            } => self.exec_for_of(name, iterable, body, scope),
            Statement::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, scope)?,
                    None => Value::Undefined,
                };
                Ok(Flow::Return(value))
            }
            Statement::Break => Ok(Flow::Break),
            Statement::Continue => Ok(Flow::Continue),
            Statement::Throw(expr) => {
                let value = self.eval(expr, scope)?;
                let message = match value.get_property("message") {
                    Some(Value::String(message)) => message,
                    _ => value.to_display(),
                };
                Err(ScriptError::Thrown(message))
            }
            Statement::Block(statements) => {
                self.with_scope(scope, |this, inner| this.exec_block(statements, inner))
            }
        }
    }

    fn exec_for_of(
        &mut self,
        name: &str,
        iterable: &Expression,
        body: &Statement,
        scope: ScopeId,
    ) -> Result<Flow> {
        let items: Vec<Value> = match self.eval(iterable, scope)? {
            Value::Array(items) => items.borrow().clone(),
            Value::String(s) => s.chars().map(|c| Value::String(c.to_string())).collect(),
            other => {
                return Err(ScriptError::type_error(format!(
                    "{} is not iterable",
                    iterable_name(iterable, &other)
                )))
            }
        };

        for item in items {
            let flow = self.with_scope(scope, |this, inner| {
                this.declare(inner, name, item, false);
                this.exec(body, inner)
            })?;
            match flow {
                Flow::Break => break,
                Flow::Return(value) => return Ok(Flow::Return(value)),
                Flow::Normal | Flow::Continue => {}
            }
        }
        Ok(Flow::Normal)
    }

    // Expressions

    fn eval(&mut self, expr: &Expression, scope: ScopeId) -> Result<Value> {
        self.meter.tick()?;
        match expr {
            Expression::Number(n) => Ok(Value::Number(*n)),
            Expression::Str(s) => Ok(Value::String(s.clone())),
            Expression::Bool(b) => Ok(Value::Bool(*b)),
            Expression::Null => Ok(Value::Null),
            Expression::Undefined => Ok(Value::Undefined),
            Expression::Template(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        TemplateSegment::Text(text) => out.push_str(text),
                        TemplateSegment::Expr(expr) => {
                            out.push_str(&self.eval(expr, scope)?.to_display())
                        }
                    }
                }
                checked_string(out)
            }
            Expression::Regex { pattern, flags } => {
                Ok(Value::Regex(Rc::new(RegexValue::new(pattern, flags)?)))
            }
            Expression::Array(items) => {
                let values = items
                    .iter()
                    .map(|item| self.eval(item, scope))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::array(values))
            }
            Expression::Object(entries) => {
                let mut object = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    let value = self.eval(value, scope)?;
                    set_property(&mut object, key, value);
                }
                Ok(Value::object(object))
            }
            Expression::Identifier(name) => self.lookup_var(name, scope),
            Expression::Member { object, property } => {
                let target = self.eval(object, scope)?;
                self.get_member(&target, property, object)
            }
            Expression::Index { object, index } => {
                let target = self.eval(object, scope)?;
                let key = self.eval(index, scope)?;
                self.get_index(&target, &key, object)
            }
            Expression::Call { callee, args } => {
                let function = self.eval(callee, scope)?;
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg, scope))
                    .collect::<Result<Vec<_>>>()?;
                self.call_value(&function, args, callee)
            }
            Expression::Function(def) => {
                self.closures += 1;
                Ok(Value::Function(Rc::new(Closure {
                    def: def.clone(),
                    scope,
                })))
            }
            Expression::Unary { op, operand } => self.eval_unary(*op, operand, scope),
            Expression::Binary { op, left, right } => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                binary_op(*op, &left, &right)
            }
            Expression::Logical { op, left, right } => {
                let left = self.eval(left, scope)?;
                let short_circuit = match op {
                    LogicalOp::And => !left.truthy(),
                    LogicalOp::Or => left.truthy(),
                    LogicalOp::Nullish => !left.is_nullish(),
                };
                if short_circuit {
                    Ok(left)
                } else {
                    self.eval(right, scope)
                }
            }
            Expression::Conditional {
                condition,
                then_expr,
                else_expr,
            } => {
                if self.eval(condition, scope)?.truthy() {
                    self.eval(then_expr, scope)
                } else {
                    self.eval(else_expr, scope)
                }
            }
            Expression::Assign { op, target, value } => self.eval_assign(*op, target, value, scope),
        }
    }

    fn eval_unary(&mut self, op: UnaryOp, operand: &Expression, scope: ScopeId) -> Result<Value> {
        if op == UnaryOp::Typeof {
            // `typeof undeclared` is allowed and yields "undefined".
            if let Expression::Identifier(name) = operand {
                if self.resolve_scope(name, scope).is_none() {
                    return Ok(Value::from("undefined"));
                }
            }
        }
        let value = self.eval(operand, scope)?;
        Ok(match op {
            UnaryOp::Not => Value::Bool(!value.truthy()),
            UnaryOp::Negate => Value::Number(-value.to_number()),
            UnaryOp::Plus => Value::Number(value.to_number()),
            UnaryOp::Typeof => Value::from(value.type_of()),
        })
    }

    fn eval_assign(
        &mut self,
        op: AssignOp,
        target: &Expression,
        value: &Expression,
        scope: ScopeId,
    ) -> Result<Value> {
        let mut value = self.eval(value, scope)?;
        if op != AssignOp::Assign {
            let current = self.eval(target, scope)?;
            let binary = match op {
                AssignOp::Add => BinaryOp::Add,
                _ => BinaryOp::Sub,
            };
            value = binary_op(binary, &current, &value)?;
        }

        match target {
            Expression::Identifier(name) => self.assign_var(name, value.clone(), scope)?,
            Expression::Member { object, property } => {
                let target = self.eval(object, scope)?;
                set_member(&target, property, value.clone(), object)?;
            }
            Expression::Index { object, index } => {
                let target = self.eval(object, scope)?;
                let key = self.eval(index, scope)?;
                match (&target, &key) {
                    (Value::Array(items), Value::Number(n)) if *n >= 0.0 && n.fract() == 0.0 => {
                        let index = *n as usize;
                        let mut items = items.borrow_mut();
                        if index > items.len() + MAX_ARRAY_GAP {
                            return Err(ScriptError::type_error("array index out of range"));
                        }
                        if index >= items.len() {
                            check_array_len(index + 1)?;
                            items.resize(index + 1, Value::Undefined);
                        }
                        items[index] = value.clone();
                    }
                    _ => set_member(&target, &key.to_display(), value.clone(), object)?,
                }
            }
            _ => return Err(ScriptError::type_error("invalid assignment target")),
        }
        Ok(value)
    }

    fn get_member(&mut self, target: &Value, name: &str, source: &Expression) -> Result<Value> {
        Ok(match target {
            Value::Undefined | Value::Null => {
                return Err(ScriptError::type_error(format!(
                    "Cannot read properties of {} (reading '{name}'): {} is {}",
                    target.to_display(),
                    source.describe(),
                    target.to_display()
                )))
            }
            Value::Object(entries) => lookup(&entries.borrow(), name).unwrap_or(Value::Undefined),
            Value::Array(items) => match name {
                "length" => Value::Number(items.borrow().len() as f64),
                _ if ARRAY_METHODS.contains(&name) => Value::method(target.clone(), name),
                _ => Value::Undefined,
            },
            Value::String(s) => match name {
                "length" => Value::Number(s.chars().count() as f64),
                _ if STRING_METHODS.contains(&name) => Value::method(target.clone(), name),
                _ => Value::Undefined,
            },
            Value::Number(_) if matches!(name, "toFixed" | "toString") => {
                Value::method(target.clone(), name)
            }
            Value::Bool(_) if name == "toString" => Value::method(target.clone(), name),
            Value::Regex(re) => match name {
                "test" => Value::method(target.clone(), name),
                "source" => Value::from(re.source.as_str()),
                "flags" => Value::from(re.flags.as_str()),
                _ => Value::Undefined,
            },
            Value::Expectation(expectation) => Expectation::member(expectation, name)?,
            _ => Value::Undefined,
        })
    }

    fn get_index(&mut self, target: &Value, key: &Value, source: &Expression) -> Result<Value> {
        if let Value::Number(n) = key {
            if *n >= 0.0 && n.fract() == 0.0 {
                let index = *n as usize;
                match target {
                    Value::Array(items) => {
                        return Ok(items.borrow().get(index).cloned().unwrap_or(Value::Undefined))
                    }
                    Value::String(s) => {
                        return Ok(s
                            .chars()
                            .nth(index)
                            .map(|c| Value::String(c.to_string()))
                            .unwrap_or(Value::Undefined))
                    }
                    _ => {}
                }
            }
        }
        self.get_member(target, &key.to_display(), source)
    }

    // Calls

    fn call_value(
        &mut self,
        function: &Value,
        args: Vec<Value>,
        callee: &Expression,
    ) -> Result<Value> {
        match function {
            Value::Function(closure) => self.call_function(closure, args),
            Value::Builtin(builtin) => match builtin.as_ref() {
                Builtin::Global(path) => self.call_global(path, args),
                Builtin::Method { receiver, name } => self.call_method(receiver, name, args),
            },
            _ => Err(ScriptError::type_error(format!(
                "{} is not a function",
                callee.describe()
            ))),
        }
    }

    /// Call with a synthetic callee, used for callbacks.
    fn call_callback(&mut self, function: &Value, args: Vec<Value>) -> Result<Value> {
        self.call_value(function, args, &Expression::Identifier("callback".into()))
    }

    fn call_function(&mut self, closure: &Closure, args: Vec<Value>) -> Result<Value> {
        self.meter.enter()?;
        let def = closure.def.clone();
        let result = self.with_scope(closure.scope, |this, scope| {
            let mut args = args.into_iter();
            for param in &def.params {
                let value = args.next().unwrap_or(Value::Undefined);
                this.declare(scope, param, value, false);
            }
            match &def.body {
                FunctionBody::Expression(expr) => this.eval(expr, scope),
                FunctionBody::Block(statements) => match this.exec_block(statements, scope)? {
                    Flow::Return(value) => Ok(value),
                    _ => Ok(Value::Undefined),
                },
            }
        });
        self.meter.leave();
        result
    }

    fn call_global(&mut self, path: &str, args: Vec<Value>) -> Result<Value> {
        let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Undefined);
        let text = |i: usize| arg(i).to_display();

        Ok(match path {
            "environment.get" => {
                let key = text(0);
                let pending = self.changes.iter().rev().find(|c| c.key == key);
                match pending {
                    Some(change) => Value::from(change.value.as_str()),
                    None => self
                        .environment
                        .and_then(|env| env.lookup(&key))
                        .map(Value::from)
                        .unwrap_or(Value::Undefined),
                }
            }
            "environment.set" => {
                let key = text(0);
                let value = arg(1).inspect();
                info!(key = %key, "script requested environment change");
                self.changes.push(EnvironmentChange { key, value });
                Value::Undefined
            }
            "console.log" | "console.info" | "console.warn" | "console.error" => {
                let level = match path {
                    "console.info" => LogLevel::Info,
                    "console.warn" => LogLevel::Warn,
                    "console.error" => LogLevel::Error,
                    _ => LogLevel::Log,
                };
                let message = args.iter().map(Value::inspect).collect::<Vec<_>>().join(" ");
                debug!(level = ?level, "script console: {}", message);
                self.logs.push(ScriptLog { level, message });
                Value::Undefined
            }
            "utils.uuid" => Value::String(uuid::Uuid::new_v4().to_string()),
            "utils.base64Encode" => Value::String(STANDARD.encode(text(0))),
            "utils.base64Decode" => {
                let bytes = STANDARD
                    .decode(text(0).trim())
                    .map_err(|e| ScriptError::type_error(format!("invalid base64 input: {e}")))?;
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            }
            "utils.urlEncode" => {
                Value::String(form_urlencoded::byte_serialize(text(0).as_bytes()).collect())
            }
            "utils.urlDecode" => Value::String(url_decode(&text(0))),
            "JSON.stringify" => {
                let value = arg(0);
                if matches!(value, Value::Undefined | Value::Function(_) | Value::Builtin(_)) {
                    return Ok(Value::Undefined);
                }
                let json = value.to_json()?;
                let pretty = arg(2).to_number() > 0.0
                    || matches!(arg(2), Value::String(ref s) if !s.is_empty());
                let out = if pretty {
                    serde_json::to_string_pretty(&json)
                } else {
                    serde_json::to_string(&json)
                }
                .map_err(|e| ScriptError::type_error(e.to_string()))?;
                checked_string(out)?
            }
            "JSON.parse" => {
                let json: serde_json::Value = serde_json::from_str(&text(0))
                    .map_err(|e| ScriptError::Thrown(format!("SyntaxError: {e}")))?;
                Value::from_json(&json)
            }
            "Math.floor" => Value::Number(arg(0).to_number().floor()),
            "Math.ceil" => Value::Number(arg(0).to_number().ceil()),
            "Math.round" => Value::Number((arg(0).to_number() + 0.5).floor()),
            "Math.abs" => Value::Number(arg(0).to_number().abs()),
            "Math.min" | "Math.max" => {
                let is_min = path == "Math.min";
                let mut acc = if is_min { f64::INFINITY } else { f64::NEG_INFINITY };
                for value in &args {
                    let n = value.to_number();
                    if n.is_nan() {
                        return Ok(Value::Number(f64::NAN));
                    }
                    acc = if is_min { acc.min(n) } else { acc.max(n) };
                }
                Value::Number(acc)
            }
            "Date.now" => Value::Number(chrono::Utc::now().timestamp_millis() as f64),
            "Object.keys" | "Object.values" => {
                let keys = path == "Object.keys";
                match arg(0) {
                    Value::Object(entries) => Value::array(
                        entries
                            .borrow()
                            .iter()
                            .map(|(k, v)| if keys { Value::from(k.as_str()) } else { v.clone() })
                            .collect(),
                    ),
                    Value::Array(items) => Value::array(
                        items
                            .borrow()
                            .iter()
                            .enumerate()
                            .map(|(i, v)| if keys { Value::from(i.to_string()) } else { v.clone() })
                            .collect(),
                    ),
                    _ => Value::array(Vec::new()),
                }
            }
            "Array.isArray" => Value::Bool(matches!(arg(0), Value::Array(_))),
            "Error" => Value::object(vec![
                ("name".into(), Value::from("Error")),
                ("message".into(), Value::String(text(0))),
            ]),
            "String" => Value::String(if args.is_empty() { String::new() } else { text(0) }),
            "Number" => Value::Number(if args.is_empty() { 0.0 } else { arg(0).to_number() }),
            "parseInt" => Value::Number(parse_leading(&text(0), false)),
            "parseFloat" => Value::Number(parse_leading(&text(0), true)),
            "test" => {
                self.run_test(text(0), arg(1))?;
                Value::Undefined
            }
            "expect" => Value::Expectation(Rc::new(Expectation::new(arg(0)))),
            "response.json" => self
                .response
                .map(|r| Value::from_json(&r.data))
                .unwrap_or(Value::Undefined),
            "response.text" => self
                .response
                .map(|r| Value::String(r.body_text()))
                .unwrap_or(Value::Undefined),
            "response.header" => self
                .response
                .and_then(|r| r.header(&text(0)))
                .map(Value::from)
                .unwrap_or(Value::Undefined),
            other => return Err(ScriptError::type_error(format!("{other} is not a function"))),
        })
    }

    /// `test(name, fn)`: run `fn` now and record whether it threw.
    fn run_test(&mut self, name: String, body: Value) -> Result<()> {
        if !matches!(body, Value::Function(_) | Value::Builtin(_)) {
            return Err(ScriptError::type_error(format!(
                "test '{name}' needs a function as its second argument"
            )));
        }
        match self.call_callback(&body, Vec::new()) {
            Ok(_) => {
                debug!(test = %name, "script test passed");
                self.tests.push(TestResult::pass(name));
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                debug!(test = %name, error = %err, "script test failed");
                self.tests.push(TestResult::fail(name, err.message()));
            }
        }
        Ok(())
    }

    fn call_method(&mut self, receiver: &Value, name: &str, args: Vec<Value>) -> Result<Value> {
        match receiver {
            Value::Expectation(expectation) => {
                if name != PASSED {
                    expectation.check(name, &args)?;
                }
                Ok(receiver.clone())
            }
            Value::String(s) => string_method(s, name, &args),
            Value::Array(_) => self.array_method(receiver, name, args),
            Value::Number(n) => match name {
                "toFixed" => {
                    let digits = args.first().map(|v| v.to_number()).unwrap_or(0.0);
                    let digits = digits.clamp(0.0, 100.0) as usize;
                    Ok(Value::String(format!("{n:.digits$}")))
                }
                _ => Ok(Value::String(format_number(*n))),
            },
            Value::Regex(re) => {
                let subject = args.first().map(Value::to_display).unwrap_or_default();
                Ok(Value::Bool(re.regex.is_match(&subject)))
            }
            other => Ok(Value::String(other.to_display())),
        }
    }

    fn array_method(&mut self, receiver: &Value, name: &str, args: Vec<Value>) -> Result<Value> {
        let Value::Array(items) = receiver else {
            return Ok(Value::Undefined);
        };
        let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Undefined);

        match name {
            "push" => {
                let mut items = items.borrow_mut();
                check_array_len(items.len() + args.len())?;
                items.extend(args.iter().cloned());
                return Ok(Value::Number(items.len() as f64));
            }
            "pop" => return Ok(items.borrow_mut().pop().unwrap_or(Value::Undefined)),
            "includes" => {
                let needle = arg(0);
                return Ok(Value::Bool(
                    items.borrow().iter().any(|v| same_value_zero(v, &needle)),
                ));
            }
            "indexOf" => {
                let needle = arg(0);
                let index = items.borrow().iter().position(|v| v.strict_equals(&needle));
                return Ok(Value::Number(index.map_or(-1.0, |i| i as f64)));
            }
            "join" => {
                let separator = match arg(0) {
                    Value::Undefined => ",".to_string(),
                    other => other.to_display(),
                };
                let joined = items
                    .borrow()
                    .iter()
                    .map(|v| if v.is_nullish() { String::new() } else { v.to_display() })
                    .collect::<Vec<_>>()
                    .join(&separator);
                return checked_string(joined);
            }
            "slice" => {
                let items = items.borrow();
                let (start, end) = slice_bounds(items.len(), &arg(0), &arg(1));
                return Ok(Value::array(items[start..end.max(start)].to_vec()));
            }
            _ => {}
        }

        // Callback methods iterate over a snapshot so the callback may
        // mutate the array freely.
        let callback = arg(0);
        let snapshot: Vec<Value> = items.borrow().clone();
        let mut mapped = Vec::new();
        for (index, item) in snapshot.into_iter().enumerate() {
            let result =
                self.call_callback(&callback, vec![item.clone(), Value::Number(index as f64)])?;
            match name {
                "map" => mapped.push(result),
                "filter" if result.truthy() => mapped.push(item),
                "find" if result.truthy() => return Ok(item),
                "some" if result.truthy() => return Ok(Value::Bool(true)),
                "every" if !result.truthy() => return Ok(Value::Bool(false)),
                _ => {}
            }
        }
        Ok(match name {
            "map" | "filter" => Value::array(mapped),
            "some" => Value::Bool(false),
            "every" => Value::Bool(true),
            _ => Value::Undefined,
        })
    }
}

fn iterable_name(expr: &Expression, value: &Value) -> String {
    match expr {
        Expression::Identifier(_) | Expression::Member { .. } => expr.describe(),
        _ => value.repr(),
    }
}

fn check_array_len(len: usize) -> Result<()> {
    if len > MAX_ARRAY_LEN {
        return Err(ScriptError::BudgetExceeded(format!(
            "array longer than {MAX_ARRAY_LEN} elements"
        )));
    }
    Ok(())
}

fn checked_string(s: String) -> Result<Value> {
    if s.len() > MAX_STRING_LEN {
        return Err(ScriptError::BudgetExceeded(format!(
            "string longer than {MAX_STRING_LEN} bytes"
        )));
    }
    Ok(Value::String(s))
}

fn set_member(target: &Value, name: &str, value: Value, source: &Expression) -> Result<()> {
    match target {
        Value::Object(entries) => {
            set_property(&mut entries.borrow_mut(), name, value);
            Ok(())
        }
        Value::Array(items) if name == "length" => {
            let len = value.to_number();
            if len.is_nan() || len < 0.0 {
                return Err(ScriptError::type_error("Invalid array length"));
            }
            let mut items = items.borrow_mut();
            let len = (len as usize).min(items.len() + MAX_ARRAY_GAP);
            check_array_len(len)?;
            items.resize(len, Value::Undefined);
            Ok(())
        }
        other => Err(ScriptError::type_error(format!(
            "Cannot set property '{name}' of {} ({})",
            other.kind_name(),
            source.describe()
        ))),
    }
}

fn same_value_zero(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x == y || (x.is_nan() && y.is_nan()),
        _ => a.strict_equals(b),
    }
}

fn binary_op(op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
    use BinaryOp::*;
    let is_textual = |v: &Value| {
        !matches!(v, Value::Undefined | Value::Null | Value::Bool(_) | Value::Number(_))
    };

    Ok(match op {
        Add if is_textual(left) || is_textual(right) => {
            let mut out = left.to_display();
            out.push_str(&right.to_display());
            return checked_string(out);
        }
        Add => Value::Number(left.to_number() + right.to_number()),
        Sub => Value::Number(left.to_number() - right.to_number()),
        Mul => Value::Number(left.to_number() * right.to_number()),
        Div => Value::Number(left.to_number() / right.to_number()),
        Mod => Value::Number(left.to_number() % right.to_number()),
        Equal => Value::Bool(left.loose_equals(right)),
        NotEqual => Value::Bool(!left.loose_equals(right)),
        StrictEqual => Value::Bool(left.strict_equals(right)),
        StrictNotEqual => Value::Bool(!left.strict_equals(right)),
        Less | LessEqual | Greater | GreaterEqual => {
            let ordering = match (left, right) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => left.to_number().partial_cmp(&right.to_number()),
            };
            let result = ordering.is_some_and(|o| match op {
                Less => o.is_lt(),
                LessEqual => o.is_le(),
                Greater => o.is_gt(),
                _ => o.is_ge(),
            });
            Value::Bool(result)
        }
    })
}

/// Clamp JS-style `slice(start, end)` arguments to `0..=len`.
fn slice_bounds(len: usize, start: &Value, end: &Value) -> (usize, usize) {
    let clamp = |v: &Value, default: usize| -> usize {
        if matches!(v, Value::Undefined) {
            return default;
        }
        let n = v.to_number();
        if n.is_nan() {
            0
        } else if n < 0.0 {
            len.saturating_sub((-n) as usize)
        } else {
            (n as usize).min(len)
        }
    };
    (clamp(start, 0), clamp(end, len))
}

fn string_method(s: &str, name: &str, args: &[Value]) -> Result<Value> {
    let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Undefined);
    let text = |i: usize| arg(i).to_display();

    Ok(match name {
        "includes" => Value::Bool(s.contains(&text(0))),
        "startsWith" => Value::Bool(s.starts_with(&text(0))),
        "endsWith" => Value::Bool(s.ends_with(&text(0))),
        "indexOf" => {
            let needle = text(0);
            let index = s.find(&needle).map(|byte| s[..byte].chars().count() as f64);
            Value::Number(index.unwrap_or(-1.0))
        }
        "toUpperCase" => Value::String(s.to_uppercase()),
        "toLowerCase" => Value::String(s.to_lowercase()),
        "trim" => Value::String(s.trim().to_string()),
        "split" => {
            let parts: Vec<Value> = match arg(0) {
                Value::Undefined => vec![Value::from(s)],
                Value::Regex(re) => re.regex.split(s).map(Value::from).collect(),
                separator => {
                    let separator = separator.to_display();
                    if separator.is_empty() {
                        s.chars().map(|c| Value::String(c.to_string())).collect()
                    } else {
                        s.split(separator.as_str()).map(Value::from).collect()
                    }
                }
            };
            let parts = match arg(1) {
                Value::Undefined => parts,
                limit => parts.into_iter().take(limit.to_number().max(0.0) as usize).collect(),
            };
            check_array_len(parts.len())?;
            Value::array(parts)
        }
        "slice" => {
            let chars: Vec<char> = s.chars().collect();
            let (start, end) = slice_bounds(chars.len(), &arg(0), &arg(1));
            Value::String(chars[start..end.max(start)].iter().collect())
        }
        "substring" => {
            let chars: Vec<char> = s.chars().collect();
            let bound = |v: Value, default: usize| -> usize {
                if matches!(v, Value::Undefined) {
                    return default;
                }
                let n = v.to_number();
                if n.is_nan() || n < 0.0 {
                    0
                } else {
                    (n as usize).min(chars.len())
                }
            };
            let (a, b) = (bound(arg(0), 0), bound(arg(1), chars.len()));
            let (start, end) = if a <= b { (a, b) } else { (b, a) };
            Value::String(chars[start..end].iter().collect())
        }
        "replace" => {
            let replacement = text(1);
            match arg(0) {
                Value::Regex(re) if re.is_global() => {
                    Value::String(re.regex.replace_all(s, replacement.as_str()).into_owned())
                }
                Value::Regex(re) => {
                    Value::String(re.regex.replace(s, replacement.as_str()).into_owned())
                }
                pattern => Value::String(s.replacen(&pattern.to_display(), &replacement, 1)),
            }
        }
        _ => Value::from(s),
    })
}

/// Leading numeric prefix, as `parseInt`/`parseFloat` read it.
fn parse_leading(text: &str, float: bool) -> f64 {
    let trimmed = text.trim_start();
    let mut end = 0;
    let mut seen_dot = false;
    for (i, c) in trimmed.char_indices() {
        let ok = c.is_ascii_digit()
            || (i == 0 && (c == '-' || c == '+'))
            || (float && c == '.' && !seen_dot);
        if !ok {
            break;
        }
        seen_dot |= c == '.';
        end = i + c.len_utf8();
    }
    trimmed[..end].parse::<f64>().map_or(f64::NAN, |n| if float { n } else { n.trunc() })
}

/// Reverse of form-urlencoding: `+` is a space and `%XX` a byte.
fn url_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let byte = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match byte {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            byte => out.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parser::parse_program;
    use serde_json::json;
    use std::collections::HashMap as Map;

    fn run_with(source: &str, env: Option<&Environment>) -> (Result<()>, Effects) {
        let program = parse_program(source).unwrap();
        let mut interpreter = Interpreter::new(&ScriptBudget::default(), env);
        interpreter.install_pm();
        let result = interpreter.run(&program);
        (result, interpreter.into_effects())
    }

    fn logs(source: &str) -> Vec<String> {
        let (result, effects) = run_with(source, None);
        result.unwrap();
        effects.logs.into_iter().map(|l| l.message).collect()
    }

    #[test]
    fn test_arithmetic_and_strings() {
        assert_eq!(
            logs("console.log(1 + 2 * 3, '1' + 2, 7 % 4, -'3', 10 / 4)"),
            vec!["7 12 3 -3 2.5"]
        );
        assert_eq!(
            logs("const name = 'api'; console.log(`hello ${name.toUpperCase()}!`)"),
            vec!["hello API!"]
        );
    }

    #[test]
    fn test_closures_and_loops() {
        let out = logs(
            r#"
            function makeCounter() {
                let count = 0
                return () => { count += 1; return count }
            }
            const next = makeCounter()
            next(); next()
            let total = 0
            for (const n of [1, 2, 3, 4]) {
                if (n === 3) continue
                total += n
            }
            console.log(next(), total)
            "#,
        );
        assert_eq!(out, vec!["3 7"]);
    }

    #[test]
    fn test_array_and_object_helpers() {
        let out = logs(
            r#"
            const users = [{id: 1, name: "a"}, {id: 2, name: "b"}]
            const ids = users.map(u => u.id).filter(id => id > 1)
            console.log(ids, users.find(u => u.name === "a").id, Object.keys(users[0]).join("|"))
            console.log(JSON.stringify({a: [1, "x"], b: undefined}), [1, 2].includes(2))
            "#,
        );
        assert_eq!(out, vec!["[2] 1 id|name", "{\"a\":[1,\"x\"]} true"]);
    }

    #[test]
    fn test_const_reassignment_is_type_error() {
        let (result, _) = run_with("const a = 1; a = 2", None);
        assert!(matches!(result, Err(ScriptError::Type(_))));
    }

    #[test]
    fn test_reference_error() {
        let (result, _) = run_with("missing.value", None);
        assert_eq!(result, Err(ScriptError::Reference("missing".into())));
        assert_eq!(logs("console.log(typeof missing)"), vec!["undefined"]);
    }

    #[test]
    fn test_environment_overlay() {
        let env = Environment::new("dev").with_variable("token", "old");
        let (result, effects) = run_with(
            "environment.set('token', 'new'); pm.environment.set('n', 5); console.log(environment.get('token'), environment.get('n'), environment.get('x'))",
            Some(&env),
        );
        result.unwrap();
        assert_eq!(effects.logs[0].message, "new 5 undefined");
        assert_eq!(effects.environment_changes.len(), 2);
        assert_eq!(effects.environment_changes[1].value, "5");
        assert_eq!(env.lookup("token"), Some("old"));
    }

    #[test]
    fn test_utils() {
        let out = logs(
            "console.log(utils.base64Encode('user:pass'), utils.base64Decode('aGk='), utils.urlEncode('a b&c'), utils.urlDecode('a+b%26c'), utils.uuid().length)",
        );
        assert_eq!(out, vec!["dXNlcjpwYXNz hi a+b%26c a b&c 36"]);
    }

    #[test]
    fn test_string_methods() {
        let out = logs(
            r#"const s = "  Hello, World  ".trim()
            console.log(s.split(", ").length, s.slice(-5), s.substring(5, 0), s.indexOf("W"), s.replace(/o/g, "0"), s.startsWith("He"))"#,
        );
        assert_eq!(out, vec!["2 World Hello 7 Hell0, W0rld true"]);
    }

    #[test]
    fn test_step_budget() {
        let program = parse_program("let a = [1]; for (const x of a) { a.push(x) }").unwrap();
        // Iteration runs over a snapshot, so this terminates.
        let mut interpreter = Interpreter::new(&ScriptBudget::default(), None);
        interpreter.run(&program).unwrap();

        let shallow = ScriptBudget {
            max_call_depth: 16,
            ..ScriptBudget::default()
        };
        let program = parse_program("const f = () => f(); f()").unwrap();
        let mut interpreter = Interpreter::new(&shallow, None);
        assert!(matches!(interpreter.run(&program), Err(ScriptError::BudgetExceeded(_))));

        let budget = ScriptBudget {
            max_steps: 50,
            ..ScriptBudget::default()
        };
        let source = "let n = 0; for (const x of [1,2,3,4,5,6,7,8,9,10,11,12]) { n += x }";
        let program = parse_program(source).unwrap();
        let mut interpreter = Interpreter::new(&budget, None);
        assert!(matches!(interpreter.run(&program), Err(ScriptError::BudgetExceeded(_))));
    }

    #[test]
    fn test_array_growth_is_capped() {
        let steps = vec!["0"; 104].join(",");
        let grow = format!(
            "const a = []; for (const _ of [{steps}]) {{ a.length = a.length + 10000 }}
            a[a.length + 8575] = 1"
        );
        let (result, _) = run_with(&grow, None);
        result.unwrap();

        let (result, _) = run_with(&format!("{grow}; a.push(2)"), None);
        assert!(matches!(result, Err(ScriptError::BudgetExceeded(_))));

        let (result, _) = run_with(&format!("{grow}; a[a.length] = 2"), None);
        assert!(matches!(result, Err(ScriptError::BudgetExceeded(_))));

        let (result, _) = run_with(&format!("{grow}; a.length = a.length + 1"), None);
        assert!(matches!(result, Err(ScriptError::BudgetExceeded(_))));

        let doubling = vec!["0"; 21].join(",");
        let (result, _) = run_with(
            &format!("let s = 'x'; for (const _ of [{doubling}]) {{ s += s }} s.split('')"),
            None,
        );
        assert!(matches!(result, Err(ScriptError::BudgetExceeded(_))));
    }

    #[test]
    fn test_response_and_tests() {
        let response = HttpResponse {
            status: 200,
            status_text: "OK".into(),
            headers: Map::from([("Content-Type".to_string(), "application/json".to_string())]),
            data: json!({"id": 1}),
            time: 12,
            size: 40,
        };
        let program = parse_program(
            r#"
            test("status", () => expect(response.status).to.equal(200))
            test("json", () => { expect(response.json()).to.have.property("id", 1) })
            test("header", function () { pm.expect(pm.response.header("content-type")).to.include("json") })
            test("fails", () => expect(response.status).to.not.equal(200))
            test("throws", () => { throw new Error("boom") })
            "#,
        )
        .unwrap();
        let mut interpreter = Interpreter::new(&ScriptBudget::default(), None);
        interpreter.install_response(&response);
        interpreter.install_pm();
        interpreter.run(&program).unwrap();
        let tests = interpreter.into_effects().tests;

        let passed: Vec<bool> = tests.iter().map(|t| t.passed).collect();
        assert_eq!(passed, vec![true, true, true, false, false]);
        assert_eq!(tests[3].message.as_deref(), Some("Expected not 200 but got 200"));
        assert_eq!(tests[4].message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_parse_leading_numbers() {
        assert_eq!(parse_leading("42px", false), 42.0);
        assert_eq!(parse_leading("3.9", false), 3.0);
        assert_eq!(parse_leading("-1.5e", true), -1.5);
        assert!(parse_leading("abc", true).is_nan());
    }
}
