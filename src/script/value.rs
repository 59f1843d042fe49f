//! Runtime values of the script language.

use super::ast::FunctionDef;
use super::error::{Result, ScriptError};
use crate::assertion::Expectation;
use regex::Regex;
use serde_json::Value as Json;
use std::cell::RefCell;
use std::rc::Rc;

/// Nesting limit when walking values; deeper structures are treated as
/// circular.
const MAX_DEPTH: usize = 64;
/// Longest string a script may build.
pub(crate) const MAX_STRING_LEN: usize = 16 * 1024 * 1024;
/// Values visited by one rendering or JSON conversion before it gives up.
const MAX_RENDER_NODES: usize = 1_000_000;

pub type ArrayRef = Rc<RefCell<Vec<Value>>>;
/// Objects keep insertion order, like their JSON source.
pub type ObjectRef = Rc<RefCell<Vec<(String, Value)>>>;
pub type ScopeId = usize;

#[derive(Debug)]
pub struct RegexValue {
    pub regex: Regex,
    pub source: String,
    pub flags: String,
}

impl RegexValue {
    /// Compile a pattern; only the `i`, `m`, `s` and `g` flags are accepted.
    pub fn new(source: &str, flags: &str) -> Result<Self> {
        let mut inline = String::new();
        for flag in flags.chars() {
            match flag {
                'i' | 'm' | 's' => inline.push(flag),
                'g' => {}
                other => {
                    return Err(ScriptError::type_error(format!(
                        "invalid regular expression flag '{other}'"
                    )))
                }
            }
        }
        let pattern = if inline.is_empty() {
            source.to_string()
        } else {
            format!("(?{inline}){source}")
        };
        let regex = Regex::new(&pattern).map_err(|e| {
            ScriptError::type_error(format!("invalid regular expression /{source}/: {e}"))
        })?;
        Ok(RegexValue {
            regex,
            source: source.to_string(),
            flags: flags.to_string(),
        })
    }

    pub fn is_global(&self) -> bool {
        self.flags.contains('g')
    }
}

#[derive(Debug)]
pub struct Closure {
    pub def: Rc<FunctionDef>,
    pub scope: ScopeId,
}

/// Host-implemented callables.
#[derive(Debug, Clone)]
pub enum Builtin {
    /// A global function such as `JSON.parse`, named by its path.
    Global(&'static str),
    /// A method bound to its receiver, e.g. `"abc".toUpperCase`.
    Method { receiver: Value, name: String },
}

#[derive(Debug, Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(ArrayRef),
    Object(ObjectRef),
    Regex(Rc<RegexValue>),
    Function(Rc<Closure>),
    Builtin(Rc<Builtin>),
    Expectation(Rc<Expectation>),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl Value {
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn object(entries: Vec<(String, Value)>) -> Self {
        Value::Object(Rc::new(RefCell::new(entries)))
    }

    pub fn global(path: &'static str) -> Self {
        Value::Builtin(Rc::new(Builtin::Global(path)))
    }

    pub fn method(receiver: Value, name: &str) -> Self {
        Value::Builtin(Rc::new(Builtin::Method {
            receiver,
            name: name.to_string(),
        }))
    }

    pub fn from_json(json: &Json) -> Self {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::array(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// JSON form of the value. Functions and `undefined` are dropped from
    /// objects and become `null` inside arrays.
    pub fn to_json(&self) -> Result<Json> {
        let mut walk = Walk::default();
        Ok(self.to_json_in(&mut walk)?.unwrap_or(Json::Null))
    }

    fn to_json_in(&self, walk: &mut Walk) -> Result<Option<Json>> {
        walk.visits += 1;
        if walk.visits > MAX_RENDER_NODES {
            return Err(ScriptError::BudgetExceeded(format!(
                "value has more than {MAX_RENDER_NODES} nodes"
            )));
        }
        let json = match self {
            Value::Undefined | Value::Function(_) | Value::Builtin(_) => return Ok(None),
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => Json::String(s.clone()),
            Value::Array(items) => {
                walk.enter(container_ptr(self))?;
                let array: Vec<Json> = items
                    .borrow()
                    .iter()
                    .map(|v| Ok(v.to_json_in(walk)?.unwrap_or(Json::Null)))
                    .collect::<Result<_>>()?;
                walk.path.pop();
                Json::Array(array)
            }
            Value::Object(entries) => {
                walk.enter(container_ptr(self))?;
                let mut map = serde_json::Map::new();
                for (key, value) in entries.borrow().iter() {
                    if let Some(json) = value.to_json_in(walk)? {
                        map.insert(key.clone(), json);
                    }
                }
                walk.path.pop();
                Json::Object(map)
            }
            Value::Regex(_) | Value::Expectation(_) => Json::Object(serde_json::Map::new()),
        };
        Ok(Some(json))
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    /// Result of the `typeof` operator.
    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Function(_) | Value::Builtin(_) => "function",
            _ => "object",
        }
    }

    /// Finer-grained type name used by `expect(x).to.be.a(...)`.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Array(_) => "array",
            Value::Regex(_) => "regexp",
            other => other.type_of(),
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => *n,
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse().unwrap_or(f64::NAN)
                }
            }
            Value::Array(items) => {
                let items = items.borrow();
                match items.as_slice() {
                    [] => 0.0,
                    [single] => single.to_number(),
                    _ => f64::NAN,
                }
            }
            _ => f64::NAN,
        }
    }

    /// String conversion as performed by `+` and template literals.
    /// Arrays reached again while being rendered print as empty.
    pub fn to_display(&self) -> String {
        let mut render = Render::default();
        render.display(self);
        render.out
    }

    /// JSON-like rendering for assertion messages and console output.
    pub fn repr(&self) -> String {
        let mut render = Render::default();
        render.repr(self);
        render.out
    }

    /// Console formatting: strings bare, everything else as `repr`.
    pub fn inspect(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            other => other.repr(),
        }
    }

    pub fn get_property(&self, key: &str) -> Option<Value> {
        match self {
            Value::Object(entries) => lookup(&entries.borrow(), key),
            _ => None,
        }
    }

    /// Length of strings (in characters) and arrays.
    pub fn length(&self) -> Option<usize> {
        match self {
            Value::String(s) => Some(s.chars().count()),
            Value::Array(items) => Some(items.borrow().len()),
            _ => None,
        }
    }

    /// `===`
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Regex(a), Value::Regex(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => Rc::ptr_eq(a, b),
            (Value::Expectation(a), Value::Expectation(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// `==`
    pub fn loose_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_nullish() && b.is_nullish() => true,
            (a, b) if a.is_nullish() || b.is_nullish() => false,
            (Value::Number(_), Value::String(_))
            | (Value::String(_), Value::Number(_))
            | (Value::Bool(_), _)
            | (_, Value::Bool(_)) => self.to_number() == other.to_number(),
            _ => self.strict_equals(other),
        }
    }

    /// Structural equality: arrays element-wise, objects by key set.
    /// `NaN` equals itself here.
    pub fn deep_equal(&self, other: &Value) -> bool {
        self.deep_equal_at(other, 0, &mut 0)
    }

    fn deep_equal_at(&self, other: &Value, depth: usize, visits: &mut usize) -> bool {
        *visits += 1;
        if depth > MAX_DEPTH || *visits > MAX_RENDER_NODES {
            return false;
        }
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Array(a), Value::Array(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|(x, y)| x.deep_equal_at(y, depth + 1, visits))
            }
            (Value::Object(a), Value::Object(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter().all(|(key, x)| {
                        lookup(&b, key).is_some_and(|y| x.deep_equal_at(&y, depth + 1, visits))
                    })
            }
            (Value::Regex(a), Value::Regex(b)) => a.source == b.source && a.flags == b.flags,
            _ => self.strict_equals(other),
        }
    }
}

/// Property lookup in an ordered object; the last duplicate wins.
pub fn lookup(entries: &[(String, Value)], key: &str) -> Option<Value> {
    entries
        .iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

/// Identity of an array or object, used to spot cycles.
fn container_ptr(value: &Value) -> *const () {
    match value {
        Value::Array(items) => Rc::as_ptr(items) as *const (),
        Value::Object(entries) => Rc::as_ptr(entries) as *const (),
        _ => std::ptr::null(),
    }
}

/// Containers currently being walked, plus a count of every node seen.
#[derive(Default)]
struct Walk {
    path: Vec<*const ()>,
    visits: usize,
}

impl Walk {
    fn enter(&mut self, ptr: *const ()) -> Result<()> {
        if self.path.len() > MAX_DEPTH || self.path.contains(&ptr) {
            return Err(ScriptError::type_error("Converting circular structure to JSON"));
        }
        self.path.push(ptr);
        Ok(())
    }
}

/// String builder behind `to_display` and `repr`. Output stops growing at
/// `MAX_STRING_LEN` bytes or after `MAX_RENDER_NODES` visited values.
#[derive(Default)]
struct Render {
    out: String,
    walk: Walk,
}

impl Render {
    fn full(&self) -> bool {
        self.out.len() >= MAX_STRING_LEN || self.walk.visits >= MAX_RENDER_NODES
    }

    fn push(&mut self, text: &str) {
        if !self.full() {
            self.out.push_str(text);
        }
    }

    fn on_path(&self, value: &Value) -> bool {
        self.walk.path.contains(&container_ptr(value))
    }

    fn display(&mut self, value: &Value) {
        self.walk.visits += 1;
        if self.full() {
            return;
        }
        match value {
            Value::Undefined => self.push("undefined"),
            Value::Null => self.push("null"),
            Value::Bool(b) => self.push(if *b { "true" } else { "false" }),
            Value::Number(n) => self.push(&format_number(*n)),
            Value::String(s) => self.push(s),
            Value::Array(items) => {
                if self.walk.path.len() > MAX_DEPTH || self.on_path(value) {
                    return;
                }
                self.walk.path.push(container_ptr(value));
                for (i, item) in items.borrow().iter().enumerate() {
                    if self.full() {
                        break;
                    }
                    if i > 0 {
                        self.push(",");
                    }
                    if !item.is_nullish() {
                        self.display(item);
                    }
                }
                self.walk.path.pop();
            }
            Value::Object(entries) => {
                let text = match lookup(&entries.borrow(), "message") {
                    // Error objects print as `Name: message`.
                    Some(Value::String(message)) => match lookup(&entries.borrow(), "name") {
                        Some(Value::String(name)) => format!("{name}: {message}"),
                        _ => message,
                    },
                    _ => "[object Object]".into(),
                };
                self.push(&text);
            }
            Value::Regex(re) => self.push(&format!("/{}/{}", re.source, re.flags)),
            Value::Function(_) | Value::Builtin(_) => self.push("function () { [code] }"),
            Value::Expectation(_) => self.push("[object Expectation]"),
        }
    }

    fn repr(&mut self, value: &Value) {
        match value {
            Value::String(s) => {
                self.walk.visits += 1;
                self.push(&Json::String(s.clone()).to_string());
            }
            Value::Array(_) | Value::Object(_) if self.on_path(value) => {
                self.push("[Circular]");
            }
            Value::Array(_) | Value::Object(_) if self.walk.path.len() > 8 => self.push("..."),
            Value::Array(items) => {
                self.walk.visits += 1;
                self.walk.path.push(container_ptr(value));
                self.push("[");
                for (i, item) in items.borrow().iter().enumerate() {
                    if self.full() {
                        break;
                    }
                    if i > 0 {
                        self.push(",");
                    }
                    self.repr(item);
                }
                self.push("]");
                self.walk.path.pop();
            }
            Value::Object(entries) => {
                self.walk.visits += 1;
                self.walk.path.push(container_ptr(value));
                self.push("{");
                for (i, (key, item)) in entries.borrow().iter().enumerate() {
                    if self.full() {
                        break;
                    }
                    if i > 0 {
                        self.push(",");
                    }
                    self.push(&Json::String(key.clone()).to_string());
                    self.push(":");
                    self.repr(item);
                }
                self.push("}");
                self.walk.path.pop();
            }
            Value::Function(_) | Value::Builtin(_) => {
                self.walk.visits += 1;
                self.push("[Function]");
            }
            other => self.display(other),
        }
    }
}

/// Insert or overwrite a property, keeping the original position.
pub fn set_property(entries: &mut Vec<(String, Value)>, key: &str, value: Value) {
    match entries.iter_mut().rev().find(|(k, _)| k == key) {
        Some(entry) => entry.1 = value,
        None => entries.push((key.to_string(), value)),
    }
}

fn number_to_json(n: f64) -> Json {
    const MAX_SAFE: f64 = 9_007_199_254_740_991.0;
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_SAFE {
        Json::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Json::Null, Json::Number)
    }
}

/// Number formatting compatible with how scripts print numbers.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".into()
    } else if n.is_infinite() {
        String::from(if n > 0.0 { "Infinity" } else { "-Infinity" })
    } else if n == 0.0 {
        "0".into()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{n:.0}")
    } else {
        n.to_string()
    }
}
