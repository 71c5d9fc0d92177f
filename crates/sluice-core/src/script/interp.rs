//! Tree-walking evaluator with an operation budget and wall-clock deadline.
//!
//! Values are plain JSON. Property access on missing keys yields `null`
//! (optional-chaining semantics); referencing an unbound identifier is a
//! reference error. Unknown function names are reference errors too, so a
//! script probing for `fetch`, `require` or `eval` fails at call time.

use super::ast::{BinaryOp, Expr, Program, Stmt, UnaryOp};
use super::helpers;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sluice_error::ScriptError;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const MAX_CALL_DEPTH: usize = 64;
const DEADLINE_CHECK_INTERVAL: u64 = 1024;

/// Control-flow result of executing statements
enum Flow {
    Normal,
    Return(Value),
}

pub(super) struct Interpreter<'p> {
    program:  &'p Program,
    scopes:   Vec<HashMap<String, Value>>,
    now:      DateTime<Utc>,
    ops:      u64,
    max_ops:  u64,
    started:  Instant,
    deadline: Duration,
    depth:    usize,
}

impl<'p> Interpreter<'p> {
    pub(super) fn new(
        program: &'p Program,
        globals: HashMap<String, Value>,
        now: DateTime<Utc>,
        max_ops: u64,
        deadline: Duration,
    ) -> Self {
        Self {
            program,
            scopes: vec![globals],
            now,
            ops: 0,
            max_ops,
            started: Instant::now(),
            deadline,
            depth: 0,
        }
    }

    /// Run the top-level statements; the result is the value of a
    /// `return`, or the value of the last expression statement.
    pub(super) fn run(&mut self) -> Result<Value, ScriptError> {
        let mut last = Value::Null;
        let statements = self.program.statements.clone();
        for stmt in &statements {
            if let Stmt::Expr(expr) = stmt {
                last = self.eval(expr)?;
            } else if let Flow::Return(value) = self.exec(stmt)? {
                return Ok(value);
            }
        }
        Ok(last)
    }

    /// Call a user-defined function by name.
    pub(super) fn call_function(
        &mut self,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value, ScriptError> {
        let Some(def) = self.program.functions.get(name) else {
            return Err(ScriptError::Reference {
                identifier: name.to_string(),
            });
        };

        if self.depth >= MAX_CALL_DEPTH {
            return Err(ScriptError::Type {
                message: "maximum call depth exceeded".to_string(),
            });
        }

        let mut frame = HashMap::new();
        for (i, param) in def.params.iter().enumerate() {
            frame.insert(param.clone(), args.get(i).cloned().unwrap_or(Value::Null));
        }

        self.depth += 1;
        self.scopes.push(frame);
        let body = def.body.clone();
        let mut result = Value::Null;
        let mut flow_err = None;
        for stmt in &body {
            match self.exec(stmt) {
                Ok(Flow::Return(value)) => {
                    result = value;
                    break;
                },
                Ok(Flow::Normal) => {},
                Err(e) => {
                    flow_err = Some(e);
                    break;
                },
            }
        }
        self.scopes.pop();
        self.depth -= 1;

        match flow_err {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<Flow, ScriptError> {
        self.tick()?;
        match stmt {
            Stmt::Let { name, expr } => {
                let value = self.eval(expr)?;
                if let Some(scope) = self.scopes.last_mut() {
                    scope.insert(name.clone(), value);
                }
                Ok(Flow::Normal)
            },
            Stmt::Assign { name, expr } => {
                let value = self.eval(expr)?;
                for scope in self.scopes.iter_mut().rev() {
                    if let Some(slot) = scope.get_mut(name) {
                        *slot = value;
                        return Ok(Flow::Normal);
                    }
                }
                Err(ScriptError::Reference {
                    identifier: name.clone(),
                })
            },
            Stmt::If {
                cond,
                then_block,
                else_block,
            } => {
                let branch = if truthy(&self.eval(cond)?) {
                    then_block
                } else {
                    else_block
                };
                for stmt in branch {
                    if let Flow::Return(value) = self.exec(stmt)? {
                        return Ok(Flow::Return(value));
                    }
                }
                Ok(Flow::Normal)
            },
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(e) => self.eval(e)?,
                    None => Value::Null,
                };
                Ok(Flow::Return(value))
            },
            Stmt::Expr(expr) => {
                self.eval(expr)?;
                Ok(Flow::Normal)
            },
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, ScriptError> {
        self.tick()?;
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ident(name) => self.lookup(name),
            Expr::Member { object, property } => {
                // Namespace identifiers are not variables
                if let Expr::Ident(ns) = object.as_ref() {
                    if matches!(ns.as_str(), "JSON" | "Math" | "Object") {
                        return Err(ScriptError::Type {
                            message: format!("{ns}.{property} is not a value"),
                        });
                    }
                }
                let target = self.eval(object)?;
                Ok(member(&target, property))
            },
            Expr::Index { object, index } => {
                let target = self.eval(object)?;
                let idx = self.eval(index)?;
                Ok(index_value(&target, &idx))
            },
            Expr::Call { callee, args } => {
                let mut evaluated = Vec::with_capacity(args.len());
                for a in args {
                    evaluated.push(self.eval(a)?);
                }
                if let Some(result) = helpers::call(callee, &evaluated, self.now) {
                    return result;
                }
                if self.program.functions.contains_key(callee) {
                    return self.call_function(callee, evaluated);
                }
                Err(ScriptError::Reference {
                    identifier: callee.clone(),
                })
            },
            Expr::MethodCall {
                target,
                method,
                args,
            } => {
                let mut evaluated = Vec::with_capacity(args.len());
                for a in args {
                    evaluated.push(self.eval(a)?);
                }
                if let Expr::Ident(ns) = target.as_ref() {
                    if let Some(result) = helpers::namespace_call(ns, method, &evaluated) {
                        return result;
                    }
                }
                let receiver = self.eval(target)?;
                helpers::method_call(&receiver, method, &evaluated)
            },
            Expr::Unary { op, expr } => {
                let value = self.eval(expr)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                    UnaryOp::Neg => {
                        let n = value.as_f64().ok_or_else(|| ScriptError::Type {
                            message: "unary '-' expects a number".to_string(),
                        })?;
                        number(-n)
                    },
                }
            },
            Expr::Binary { op, left, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                binary(*op, &l, &r)
            },
            Expr::And { left, right } => {
                let l = self.eval(left)?;
                if truthy(&l) {
                    self.eval(right)
                } else {
                    Ok(l)
                }
            },
            Expr::Or { left, right } => {
                let l = self.eval(left)?;
                if truthy(&l) {
                    Ok(l)
                } else {
                    self.eval(right)
                }
            },
            Expr::Conditional { cond, then, alt } => {
                if truthy(&self.eval(cond)?) {
                    self.eval(then)
                } else {
                    self.eval(alt)
                }
            },
            Expr::Object(fields) => {
                let mut map = serde_json::Map::with_capacity(fields.len());
                for (key, value_expr) in fields {
                    map.insert(key.clone(), self.eval(value_expr)?);
                }
                Ok(Value::Object(map))
            },
            Expr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?);
                }
                Ok(Value::Array(out))
            },
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, ScriptError> {
        for scope in self.scopes.iter().rev() {
            if let Some(value) = scope.get(name) {
                return Ok(value.clone());
            }
        }
        Err(ScriptError::Reference {
            identifier: name.to_string(),
        })
    }

    fn tick(&mut self) -> Result<(), ScriptError> {
        self.ops += 1;
        if self.ops > self.max_ops {
            return Err(ScriptError::BudgetExhausted {
                budget: self.max_ops,
            });
        }
        if self.ops % DEADLINE_CHECK_INTERVAL == 0 && self.started.elapsed() > self.deadline {
            return Err(ScriptError::Timeout {
                elapsed_ms: self.started.elapsed().as_millis() as u64,
            });
        }
        Ok(())
    }
}

/// JS-style truthiness
#[must_use]
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn member(target: &Value, property: &str) -> Value {
    match target {
        Value::Object(map) => map.get(property).cloned().unwrap_or(Value::Null),
        Value::String(s) if property == "length" => {
            Value::Number(serde_json::Number::from(s.chars().count() as u64))
        },
        Value::Array(items) if property == "length" => {
            Value::Number(serde_json::Number::from(items.len() as u64))
        },
        _ => Value::Null,
    }
}

fn index_value(target: &Value, index: &Value) -> Value {
    match (target, index) {
        (Value::Array(items), Value::Number(n)) => n
            .as_f64()
            .and_then(|f| {
                if f >= 0.0 {
                    items.get(f as usize).cloned()
                } else {
                    None
                }
            })
            .unwrap_or(Value::Null),
        (Value::Object(map), Value::String(key)) => {
            map.get(key).cloned().unwrap_or(Value::Null)
        },
        _ => Value::Null,
    }
}

fn number(n: f64) -> Result<Value, ScriptError> {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| ScriptError::Type {
            message: "arithmetic produced a non-finite number".to_string(),
        })
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, ScriptError> {
    match op {
        BinaryOp::Add => match (l, r) {
            (Value::String(_), _) | (_, Value::String(_)) => Ok(Value::String(format!(
                "{}{}",
                helpers::stringify(l),
                helpers::stringify(r)
            ))),
            _ => {
                let (a, b) = numeric_pair(l, r, "+")?;
                number(a + b)
            },
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let (a, b) = numeric_pair(l, r, op_symbol(op))?;
            let out = match op {
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => a % b,
            };
            number(out)
        },
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(l, r))),
        BinaryOp::NotEq => Ok(Value::Bool(!loose_eq(l, r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => compare(op, l, r),
    }
}

fn op_symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Rem => "%",
        _ => "?",
    }
}

fn numeric_pair(l: &Value, r: &Value, op: &str) -> Result<(f64, f64), ScriptError> {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(ScriptError::Type {
            message: format!("operator '{op}' expects numbers, got {l} and {r}"),
        }),
    }
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().zip(b.as_f64()).is_some_and(|(x, y)| x == y)
        },
        _ => l == r,
    }
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, ScriptError> {
    let ordering = match (l, r) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    let Some(ordering) = ordering else {
        return Err(ScriptError::Type {
            message: format!("cannot compare {l} with {r}"),
        });
    };
    let result = match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        _ => ordering.is_ge(),
    };
    Ok(Value::Bool(result))
}
