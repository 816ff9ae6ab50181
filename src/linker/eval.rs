//! WF-024: Reference evaluator for body IR.
//!
//! Runs a callable either from a linked unit or straight off the chains of a
//! snapshot, resolving aspect references as the linker would. Calls to names
//! that are not members are recorded in a trace; comparing traces is how
//! weaving equivalence is checked.

use super::graph::{ChainKey, ElementRef, ReferenceGraph};
use super::LinkedUnit;
use crate::model::snapshot::UnitSnapshot;
use crate::model::syntax::{BinOp, Expr, Stmt};
use rustc_hash::FxHashMap;
use std::fmt;
use thiserror::Error;

const MAX_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(String),
    Unit,
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Self::Int(n) => *n != 0,
            Self::Str(s) => !s.is_empty(),
            Self::Unit => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{}", n),
            Self::Str(s) => write!(f, "\"{}\"", s),
            Self::Unit => f.write_str("()"),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum EvalError {
    #[error("unknown callable '{0}'")]
    UnknownCallable(String),
    #[error("unbound name '{0}'")]
    Unbound(String),
    #[error("'{callee}' takes {expected} argument(s), got {got}")]
    Arity {
        callee: String,
        expected: usize,
        got: usize,
    },
    #[error("type error: {0}")]
    Type(String),
    #[error("call depth exceeded {0}")]
    Depth(usize),
    #[error("unresolved reference: {0}")]
    Reference(String),
}

/// Which representation calls resolve against.
enum Mode<'a> {
    Linked(&'a LinkedUnit),
    Chains(ReferenceGraph<'a>),
}

/// A frame's code: a linked form, or a chain element.
#[derive(Clone, Copy)]
enum Frame {
    Linked(usize),
    Element(ElementRef),
}

struct Machine<'a> {
    mode: Mode<'a>,
    trace: Vec<String>,
    depth: usize,
}

enum Flow {
    Next,
    Return(Value),
}

/// Call `callable` on a linked unit; returns the value and external trace.
pub fn call_linked(unit: &LinkedUnit, callable: &str, args: Vec<Value>) -> Result<(Value, Vec<String>), EvalError> {
    let mut m = Machine {
        mode: Mode::Linked(unit),
        trace: Vec::new(),
        depth: 0,
    };
    let frame = m.lookup(callable)?;
    let value = m.invoke(frame, callable, args)?;
    Ok((value, m.trace))
}

/// Call `callable` on an unlinked snapshot, following chains directly.
pub fn call_chain(
    snapshot: &UnitSnapshot,
    callable: &str,
    args: Vec<Value>,
) -> Result<(Value, Vec<String>), EvalError> {
    let graph = ReferenceGraph::new(snapshot).map_err(|e| EvalError::Reference(e.to_string()))?;
    let mut m = Machine {
        mode: Mode::Chains(graph),
        trace: Vec::new(),
        depth: 0,
    };
    let frame = m.lookup(callable)?;
    let value = m.invoke(frame, callable, args)?;
    Ok((value, m.trace))
}

impl<'a> Machine<'a> {
    /// Member callables only; `None` for external names.
    fn find(&self, callee: &str) -> Option<Frame> {
        match self.mode {
            Mode::Linked(unit) => unit
                .members
                .iter()
                .position(|m| m.body.is_some() && m.callable == callee)
                .map(Frame::Linked),
            Mode::Chains(ref graph) => graph.chains().iter().find_map(|key: &ChainKey| {
                let member = graph.member(key.member).ok()?;
                if member.callable(key.facet) != callee {
                    return None;
                }
                graph.last(*key).ok().map(Frame::Element)
            }),
        }
    }

    fn lookup(&self, callee: &str) -> Result<Frame, EvalError> {
        self.find(callee)
            .ok_or_else(|| EvalError::UnknownCallable(callee.to_string()))
    }

    fn code(&self, frame: Frame) -> Result<(Vec<String>, &'a [Stmt]), EvalError> {
        match (&self.mode, frame) {
            (Mode::Linked(unit), Frame::Linked(i)) => {
                let unit: &'a LinkedUnit = *unit;
                let member = &unit.members[i];
                let body = member
                    .body
                    .as_ref()
                    .ok_or_else(|| EvalError::UnknownCallable(member.callable.clone()))?;
                Ok((member.params.clone(), &body.stmts))
            }
            (Mode::Chains(graph), Frame::Element(e)) => {
                let element = graph.element(e).map_err(|err| EvalError::Reference(err.to_string()))?;
                let params = graph.params(e.key).map_err(|err| EvalError::Reference(err.to_string()))?;
                Ok((params, &element.body.stmts))
            }
            _ => Err(EvalError::Reference("frame does not match evaluation mode".to_string())),
        }
    }

    fn invoke(&mut self, frame: Frame, callee: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        if self.depth >= MAX_DEPTH {
            return Err(EvalError::Depth(MAX_DEPTH));
        }
        let (params, stmts) = self.code(frame)?;
        if params.len() != args.len() {
            return Err(EvalError::Arity {
                callee: callee.to_string(),
                expected: params.len(),
                got: args.len(),
            });
        }
        let mut env: FxHashMap<String, Value> = params.into_iter().zip(args).collect();
        self.depth += 1;
        let flow = self.block(frame, stmts, &mut env);
        self.depth -= 1;
        Ok(match flow? {
            Flow::Return(v) => v,
            Flow::Next => Value::Unit,
        })
    }

    fn block(&mut self, frame: Frame, stmts: &[Stmt], env: &mut FxHashMap<String, Value>) -> Result<Flow, EvalError> {
        for stmt in stmts {
            match stmt {
                Stmt::Let { name, value } => {
                    let v = self.expr(frame, value, env)?;
                    env.insert(name.clone(), v);
                }
                Stmt::Expr(value) => {
                    self.expr(frame, value, env)?;
                }
                Stmt::Return(value) => {
                    let v = match value {
                        Some(v) => self.expr(frame, v, env)?,
                        None => Value::Unit,
                    };
                    return Ok(Flow::Return(v));
                }
                Stmt::If {
                    cond,
                    then_branch,
                    else_branch,
                } => {
                    let branch = if self.expr(frame, cond, env)?.truthy() {
                        then_branch
                    } else {
                        else_branch
                    };
                    if let Flow::Return(v) = self.block(frame, branch, env)? {
                        return Ok(Flow::Return(v));
                    }
                }
            }
        }
        Ok(Flow::Next)
    }

    fn args(&mut self, frame: Frame, args: &[Expr], env: &mut FxHashMap<String, Value>) -> Result<Vec<Value>, EvalError> {
        args.iter().map(|a| self.expr(frame, a, env)).collect()
    }

    fn expr(&mut self, frame: Frame, expr: &Expr, env: &mut FxHashMap<String, Value>) -> Result<Value, EvalError> {
        match expr {
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Name(n) => env.get(n).cloned().ok_or_else(|| EvalError::Unbound(n.clone())),
            Expr::Binary { op, lhs, rhs } => {
                let l = self.expr(frame, lhs, env)?;
                let r = self.expr(frame, rhs, env)?;
                binary(*op, l, r)
            }
            Expr::Call { callee, args } => {
                let values = self.args(frame, args, env)?;
                match self.find(callee) {
                    Some(target) => self.invoke(target, callee, values),
                    None => {
                        let rendered: Vec<String> = values.iter().map(Value::to_string).collect();
                        self.trace.push(format!("{}({})", callee, rendered.join(", ")));
                        Ok(Value::Unit)
                    }
                }
            }
            Expr::Ref(r) => {
                let values = self.args(frame, &r.args, env)?;
                let (Mode::Chains(graph), Frame::Element(from)) = (&self.mode, frame) else {
                    return Err(EvalError::Reference(format!(
                        "aspect reference {} survived linking",
                        expr
                    )));
                };
                let target = graph
                    .resolve(from, r)
                    .map_err(|e| EvalError::Reference(e.to_string()))?;
                self.invoke(Frame::Element(target), &r.direction.to_string(), values)
            }
        }
    }
}

fn binary(op: BinOp, l: Value, r: Value) -> Result<Value, EvalError> {
    let bool_int = |b: bool| Value::Int(i64::from(b));
    match (op, l, r) {
        (BinOp::Add, Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(b))),
        (BinOp::Add, Value::Str(a), b) => Ok(Value::Str(format!("{}{}", a, plain(&b)))),
        (BinOp::Sub, Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_sub(b))),
        (BinOp::Mul, Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_mul(b))),
        (BinOp::Eq, a, b) => Ok(bool_int(a == b)),
        (BinOp::Lt, Value::Int(a), Value::Int(b)) => Ok(bool_int(a < b)),
        (BinOp::Gt, Value::Int(a), Value::Int(b)) => Ok(bool_int(a > b)),
        (op, a, b) => Err(EvalError::Type(format!("{} {} {}", a, op.symbol(), b))),
    }
}

fn plain(v: &Value) -> String {
    match v {
        Value::Str(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linker::{link_unit, LinkOptions};
    use crate::model::syntax::{Body, Facet};
    use crate::model::{DeclKind, Program};

    fn unit_with(bodies: &[(&str, &[&str], &str)]) -> UnitSnapshot {
        let mut p = Program::new();
        let ty = p.add_type("T");
        for (name, params, src) in bodies {
            let id = p.add_member(ty, name, DeclKind::Method).unwrap();
            let d = p.get_mut(id).unwrap();
            d.params = params.iter().map(|s| s.to_string()).collect();
            d.bodies = vec![(Facet::Body, Body::parse(src).unwrap())];
        }
        UnitSnapshot::from_program(&p, ty).unwrap()
    }

    #[test]
    fn test_wf024_external_calls_traced() {
        let snap = unit_with(&[("f", &["x"], "log(\"in\", x); return x + 1;")]);
        let (v, trace) = call_chain(&snap, "f", vec![Value::Int(4)]).unwrap();
        assert_eq!(v, Value::Int(5));
        assert_eq!(trace, vec!["log(\"in\", 4)"]);
    }

    #[test]
    fn test_wf024_member_calls_not_traced() {
        let snap = unit_with(&[
            ("f", &["x"], "return g(x) * 2;"),
            ("g", &["y"], "if y > 3 { return 1; } return 0;"),
        ]);
        let (v, trace) = call_chain(&snap, "f", vec![Value::Int(5)]).unwrap();
        assert_eq!(v, Value::Int(2));
        assert!(trace.is_empty());
    }

    #[test]
    fn test_wf024_depth_guard() {
        let snap = unit_with(&[("f", &["x"], "return f(x);")]);
        let err = call_chain(&snap, "f", vec![Value::Int(0)]).unwrap_err();
        assert_eq!(err, EvalError::Depth(MAX_DEPTH));
    }

    #[test]
    fn test_wf024_linked_matches_chain() {
        let snap = unit_with(&[("f", &["x"], "let s = \"v\" + x; log(s); return s;")]);
        let unit = link_unit(&snap, &LinkOptions::default()).unwrap();
        let a = call_chain(&snap, "f", vec![Value::Int(7)]).unwrap();
        let b = call_linked(&unit, "f", vec![Value::Int(7)]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.0, Value::Str("v7".to_string()));
    }

    #[test]
    fn test_wf024_arity_checked() {
        let snap = unit_with(&[("f", &["x"], "return x;")]);
        assert!(matches!(
            call_chain(&snap, "f", vec![]),
            Err(EvalError::Arity { expected: 1, got: 0, .. })
        ));
    }

    #[test]
    fn test_wf024_unknown_entry() {
        let snap = unit_with(&[]);
        assert_eq!(
            call_chain(&snap, "nope", vec![]).unwrap_err(),
            EvalError::UnknownCallable("nope".to_string())
        );
    }
}
