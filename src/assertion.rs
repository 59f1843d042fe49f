//! Fluent `expect(actual)` assertions available to test scripts.
//!
//! Language chains (`to`, `be`, `have`, ...) return the same expectation,
//! `not` flips it, and every check either passes (returning the expectation
//! so calls can be chained) or fails with an
//! `Expected <expected> but got <actual>` message.

use crate::script::error::ScriptError;
use crate::script::value::{lookup, RegexValue, Value};
use std::rc::Rc;

const CHAIN_WORDS: &[&str] = &[
    "to", "be", "been", "is", "that", "which", "and", "has", "have", "with", "at", "of", "same",
    "does",
];

/// Checks that also fire on bare property access, e.g. `.to.be.true`.
const PROPERTY_CHECKS: &[&str] = &["true", "false", "null", "undefined", "ok"];

const CHECKS: &[&str] = &[
    "equal",
    "eql",
    "eq",
    "contain",
    "include",
    "includes",
    "match",
    "true",
    "false",
    "null",
    "undefined",
    "ok",
    "a",
    "an",
    "greaterThan",
    "above",
    "lessThan",
    "below",
    "property",
    "length",
    "lengthOf",
    "lengthGreaterThan",
    "lengthLessThan",
    "oneOf",
];

/// Method name bound after a property-style check already passed.
pub const PASSED: &str = "passed";

#[derive(Debug, Clone)]
pub struct Expectation {
    pub actual: Value,
    pub negated: bool,
}

struct Outcome {
    pass: bool,
    expected: String,
    actual: String,
}

impl Expectation {
    pub fn new(actual: Value) -> Self {
        Expectation {
            actual,
            negated: false,
        }
    }

    pub fn is_check(name: &str) -> bool {
        CHECKS.contains(&name)
    }

    /// Resolve `expectation.<name>`.
    pub fn member(this: &Rc<Expectation>, name: &str) -> Result<Value, ScriptError> {
        if name == "not" {
            return Ok(Value::Expectation(Rc::new(Expectation {
                actual: this.actual.clone(),
                negated: !this.negated,
            })));
        }
        if CHAIN_WORDS.contains(&name) {
            return Ok(Value::Expectation(this.clone()));
        }
        if PROPERTY_CHECKS.contains(&name) {
            this.check(name, &[])?;
            return Ok(Value::method(Value::Expectation(this.clone()), PASSED));
        }
        if Self::is_check(name) {
            return Ok(Value::method(Value::Expectation(this.clone()), name));
        }
        Ok(Value::Undefined)
    }

    /// Run the check `name` with `args`, honouring negation.
    pub fn check(&self, name: &str, args: &[Value]) -> Result<(), ScriptError> {
        let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Undefined);
        let actual = &self.actual;

        let outcome = match name {
            "equal" | "eql" | "eq" => {
                let expected = arg(0);
                Outcome {
                    pass: actual.deep_equal(&expected),
                    expected: expected.repr(),
                    actual: actual.repr(),
                }
            }
            "contain" | "include" | "includes" => self.contains(&arg(0)),
            "match" => self.matches(&arg(0))?,
            "true" => self.literal(Value::Bool(true)),
            "false" => self.literal(Value::Bool(false)),
            "null" => self.literal(Value::Null),
            "undefined" => self.literal(Value::Undefined),
            "ok" => Outcome {
                pass: actual.truthy(),
                expected: "truthy value".into(),
                actual: actual.repr(),
            },
            "a" | "an" => {
                let wanted = arg(0).to_display().to_lowercase();
                let kind = actual.kind_name();
                Outcome {
                    pass: kind == wanted,
                    expected: format!("a value of type {wanted}"),
                    actual: format!("{kind} {}", actual.repr()),
                }
            }
            "greaterThan" | "above" => self.compare(&arg(0), "greater than", |a, b| a > b),
            "lessThan" | "below" => self.compare(&arg(0), "less than", |a, b| a < b),
            "property" => self.property(&arg(0), args.get(1)),
            "length" | "lengthOf" => self.length(&arg(0), "length", |a, b| a == b),
            "lengthGreaterThan" => self.length(&arg(0), "length greater than", |a, b| a > b),
            "lengthLessThan" => self.length(&arg(0), "length less than", |a, b| a < b),
            "oneOf" => {
                let list = arg(0);
                let pass = match &list {
                    Value::Array(items) => items.borrow().iter().any(|v| actual.deep_equal(v)),
                    _ => {
                        return Err(ScriptError::type_error(
                            "oneOf expects an array of allowed values",
                        ))
                    }
                };
                Outcome {
                    pass,
                    expected: format!("one of {}", list.repr()),
                    actual: actual.repr(),
                }
            }
            other => {
                return Err(ScriptError::type_error(format!(
                    "expect(...).{other} is not a function"
                )))
            }
        };

        if outcome.pass != self.negated {
            return Ok(());
        }
        let not = if self.negated { "not " } else { "" };
        Err(ScriptError::Assertion(format!(
            "Expected {not}{} but got {}",
            outcome.expected, outcome.actual
        )))
    }

    fn literal(&self, expected: Value) -> Outcome {
        Outcome {
            pass: self.actual.strict_equals(&expected),
            expected: expected.repr(),
            actual: self.actual.repr(),
        }
    }

    fn contains(&self, needle: &Value) -> Outcome {
        let pass = match &self.actual {
            Value::String(haystack) => haystack.contains(&needle.to_display()),
            Value::Array(items) => items.borrow().iter().any(|v| v.deep_equal(needle)),
            Value::Object(entries) => {
                let entries = entries.borrow();
                match needle {
                    // Subset match: every expected property must be present and equal.
                    Value::Object(subset) => subset.borrow().iter().all(|(key, value)| {
                        lookup(&entries, key).is_some_and(|v| v.deep_equal(value))
                    }),
                    other => lookup(&entries, &other.to_display()).is_some(),
                }
            }
            _ => false,
        };
        Outcome {
            pass,
            expected: format!("value containing {}", needle.repr()),
            actual: self.actual.repr(),
        }
    }

    fn matches(&self, pattern: &Value) -> Result<Outcome, ScriptError> {
        let regex = match pattern {
            Value::Regex(re) => re.clone(),
            other => Rc::new(RegexValue::new(&other.to_display(), "")?),
        };
        let subject = self.actual.to_display();
        Ok(Outcome {
            pass: regex.regex.is_match(&subject),
            expected: format!("value matching /{}/{}", regex.source, regex.flags),
            actual: self.actual.repr(),
        })
    }

    fn compare(&self, bound: &Value, relation: &str, cmp: fn(f64, f64) -> bool) -> Outcome {
        let limit = bound.to_number();
        let pass = match &self.actual {
            Value::Number(n) => cmp(*n, limit),
            _ => false,
        };
        Outcome {
            pass,
            expected: format!("a number {relation} {}", bound.repr()),
            actual: self.actual.repr(),
        }
    }

    fn property(&self, name: &Value, expected: Option<&Value>) -> Outcome {
        let key = name.to_display();
        let found = match &self.actual {
            Value::Object(entries) => lookup(&entries.borrow(), &key),
            Value::Array(items) => {
                let items = items.borrow();
                if key == "length" {
                    Some(Value::Number(items.len() as f64))
                } else {
                    key.parse::<usize>().ok().and_then(|i| items.get(i).cloned())
                }
            }
            Value::String(s) if key == "length" => Some(Value::Number(s.chars().count() as f64)),
            _ => None,
        };
        let quoted = Value::String(key).repr();
        match expected {
            None => Outcome {
                pass: found.is_some(),
                expected: format!("property {quoted}"),
                actual: self.actual.repr(),
            },
            Some(value) => Outcome {
                pass: found.as_ref().is_some_and(|v| v.deep_equal(value)),
                expected: format!("property {quoted} equal to {}", value.repr()),
                actual: match found {
                    Some(v) => v.repr(),
                    None => format!("no property {quoted}"),
                },
            },
        }
    }

    fn length(&self, bound: &Value, relation: &str, cmp: fn(f64, f64) -> bool) -> Outcome {
        let wanted = bound.to_number();
        match self.actual.length() {
            Some(len) => Outcome {
                pass: cmp(len as f64, wanted),
                expected: format!("{relation} {}", bound.repr()),
                actual: format!("length {len}"),
            },
            None => Outcome {
                pass: false,
                expected: format!("{relation} {}", bound.repr()),
                actual: format!("{} without a length", self.actual.repr()),
            },
        }
    }
}
