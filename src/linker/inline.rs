//! WF-023: Inlining — rewrite aspect references into calls or inlined bodies.
//!
//! Statement-level sites (`return r`, `let v = r`, `r;`) can take any
//! single-exit target: arguments are bound once, colliding locals renamed,
//! and the trailing return split off as the site's value. Inside a larger
//! expression only a target whose whole body is `return <expr>;` is inlined,
//! and only with trivial arguments.

use super::graph::ElementRef;
use super::Linker;
use crate::core::error::WeaveError;
use crate::model::syntax::{substitute_stmts, AspectReference, Expr, Stmt};
use crate::model::DeclFlags;
use rustc_hash::{FxHashMap, FxHashSet};

/// Names in use in the body being emitted.
struct Scope {
    used: FxHashSet<String>,
}

impl Scope {
    fn fresh(&mut self, base: &str) -> String {
        let mut n = 1;
        loop {
            let candidate = format!("{}_{}", base, n);
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// An inlined body: statements to run first, then the value of the site.
struct Inlined {
    prelude: Vec<Stmt>,
    value: Option<Expr>,
}

impl Linker<'_> {
    /// Emit the final body of one element.
    pub(super) fn rewrite_element(&mut self, e: ElementRef) -> Result<crate::model::syntax::Body, WeaveError> {
        let element = self.graph.element(e)?;
        let mut scope = Scope {
            used: element.body.names(),
        };
        scope.used.extend(self.graph.params(e.key)?);
        let mut stack = vec![e];
        let stmts = self.rewrite_stmts(e, &element.body.stmts, &mut scope, &mut stack)?;
        Ok(crate::model::syntax::Body::new(stmts))
    }

    fn rewrite_stmts(
        &mut self,
        ctx: ElementRef,
        stmts: &[Stmt],
        scope: &mut Scope,
        stack: &mut Vec<ElementRef>,
    ) -> Result<Vec<Stmt>, WeaveError> {
        let mut out = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            match stmt {
                Stmt::Return(Some(Expr::Ref(r))) => {
                    if let Some(inl) = self.try_inline(ctx, r, true, scope, stack)? {
                        out.extend(inl.prelude);
                        out.push(Stmt::Return(inl.value));
                        continue;
                    }
                }
                Stmt::Let {
                    name,
                    value: Expr::Ref(r),
                } => {
                    if let Some(inl) = self.try_inline(ctx, r, true, scope, stack)? {
                        out.extend(inl.prelude);
                        if let Some(value) = inl.value {
                            out.push(Stmt::Let {
                                name: name.clone(),
                                value,
                            });
                        }
                        continue;
                    }
                }
                Stmt::Expr(Expr::Ref(r)) => {
                    if let Some(inl) = self.try_inline(ctx, r, false, scope, stack)? {
                        out.extend(inl.prelude);
                        if let Some(value) = inl.value.filter(Expr::has_effects) {
                            out.push(Stmt::Expr(value));
                        }
                        continue;
                    }
                }
                _ => {}
            }
            out.push(match stmt {
                Stmt::Let { name, value } => Stmt::Let {
                    name: name.clone(),
                    value: self.rewrite_expr(ctx, value, stack)?,
                },
                Stmt::Expr(value) => Stmt::Expr(self.rewrite_expr(ctx, value, stack)?),
                Stmt::Return(value) => Stmt::Return(match value {
                    Some(v) => Some(self.rewrite_expr(ctx, v, stack)?),
                    None => None,
                }),
                Stmt::If {
                    cond,
                    then_branch,
                    else_branch,
                } => Stmt::If {
                    cond: self.rewrite_expr(ctx, cond, stack)?,
                    then_branch: self.rewrite_stmts(ctx, then_branch, scope, stack)?,
                    else_branch: self.rewrite_stmts(ctx, else_branch, scope, stack)?,
                },
            });
        }
        Ok(out)
    }

    /// Target of `r` as seen from `ctx`, and whether the site may inline it.
    fn inline_target(
        &self,
        ctx: ElementRef,
        r: &AspectReference,
        stack: &[ElementRef],
    ) -> Result<(ElementRef, bool), WeaveError> {
        let target = self.graph.effective(self.graph.resolve(ctx, r)?)?;
        let allowed = self.options.inlining
            && r.is_inlineable()
            && !stack.contains(&target)
            && !self
                .graph
                .element(target)?
                .flags
                .contains(DeclFlags::NOT_INLINEABLE);
        Ok((target, allowed))
    }

    fn check_arity(&self, target: ElementRef, r: &AspectReference) -> Result<Vec<String>, WeaveError> {
        let params = self.graph.params(target.key)?;
        if params.len() != r.args.len() {
            let member = self.graph.member(target.key.member)?;
            return Err(WeaveError::internal(format!(
                "reference to '{}' passes {} argument(s), expected {}",
                member.callable(target.key.facet),
                r.args.len(),
                params.len()
            )));
        }
        Ok(params)
    }

    fn try_inline(
        &mut self,
        ctx: ElementRef,
        r: &AspectReference,
        needs_value: bool,
        scope: &mut Scope,
        stack: &mut Vec<ElementRef>,
    ) -> Result<Option<Inlined>, WeaveError> {
        let (target, allowed) = self.inline_target(ctx, r, stack)?;
        if !allowed {
            return Ok(None);
        }
        let body = &self.graph.element(target)?.body;
        if !body.is_single_exit() {
            return Ok(None);
        }
        let has_value = matches!(body.stmts.last(), Some(Stmt::Return(Some(_))));
        if needs_value && !has_value {
            return Ok(None);
        }
        let params = self.check_arity(target, r)?;

        // Arguments are evaluated once, in order, in the caller's context.
        let mut prelude = Vec::new();
        let mut map: FxHashMap<String, Expr> = FxHashMap::default();
        for (param, arg) in params.iter().zip(&r.args) {
            let arg = self.rewrite_expr(ctx, arg, stack)?;
            if arg.is_trivial() {
                map.insert(param.clone(), arg);
            } else {
                let bound = scope.fresh(param);
                prelude.push(Stmt::Let {
                    name: bound.clone(),
                    value: arg,
                });
                map.insert(param.clone(), Expr::Name(bound));
            }
        }

        let mut renames: FxHashMap<String, String> = FxHashMap::default();
        for local in body.locals() {
            if scope.used.contains(&local) {
                renames.insert(local.clone(), scope.fresh(&local));
            } else {
                scope.used.insert(local);
            }
        }
        scope.used.extend(body.names());

        let substituted = substitute_stmts(&body.stmts, &map, &renames);
        stack.push(target);
        let mut stmts = self.rewrite_stmts(target, &substituted, scope, stack)?;
        stack.pop();

        let value = match stmts.last() {
            Some(Stmt::Return(_)) => match stmts.pop() {
                Some(Stmt::Return(v)) => v,
                _ => None,
            },
            _ => None,
        };
        prelude.extend(stmts);
        tracing::trace!(depth = stack.len(), "inlined chain element");
        Ok(Some(Inlined { prelude, value }))
    }

    fn rewrite_expr(&mut self, ctx: ElementRef, expr: &Expr, stack: &mut Vec<ElementRef>) -> Result<Expr, WeaveError> {
        Ok(match expr {
            Expr::Int(_) | Expr::Str(_) | Expr::Name(_) => expr.clone(),
            Expr::Binary { op, lhs, rhs } => Expr::Binary {
                op: *op,
                lhs: Box::new(self.rewrite_expr(ctx, lhs, stack)?),
                rhs: Box::new(self.rewrite_expr(ctx, rhs, stack)?),
            },
            Expr::Call { callee, args } => Expr::Call {
                callee: callee.clone(),
                args: args
                    .iter()
                    .map(|a| self.rewrite_expr(ctx, a, stack))
                    .collect::<Result<_, _>>()?,
            },
            Expr::Ref(r) => {
                let args: Vec<Expr> = r
                    .args
                    .iter()
                    .map(|a| self.rewrite_expr(ctx, a, stack))
                    .collect::<Result<_, _>>()?;
                let (target, allowed) = self.inline_target(ctx, r, stack)?;
                let params = self.check_arity(target, r)?;
                let body = &self.graph.element(target)?.body;
                if let (true, [Stmt::Return(Some(value))]) = (allowed, body.stmts.as_slice()) {
                    if args.iter().all(Expr::is_trivial) {
                        let map: FxHashMap<String, Expr> = params.into_iter().zip(args).collect();
                        stack.push(target);
                        let inlined = self.rewrite_expr(target, &value.substitute(&map), stack);
                        stack.pop();
                        return inlined;
                    }
                }
                Expr::Call {
                    callee: self.call_target(target)?,
                    args,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::core::registry::{AspectLayer, OrderedAspectLayer};
    use crate::linker::eval::{call_chain, call_linked, Value};
    use crate::linker::{link_unit, LinkOptions, LinkedUnit};
    use crate::model::snapshot::{Contribution, UnitSnapshot};
    use crate::model::syntax::{Body, Facet};
    use crate::model::transform::Transformation;
    use crate::model::{DeclFlags, DeclId, DeclKind, Program};
    use proptest::prelude::*;

    /// `T` with `f(x) { return x; }`, `g(y) { return y * 2; }`, and one
    /// override of `f` per entry.
    fn woven(source: &str, overrides: &[(&str, DeclFlags)]) -> UnitSnapshot {
        let mut p = Program::new();
        let ty = p.add_type("T");
        let f = p.add_member(ty, "f", DeclKind::Method).unwrap();
        {
            let d = p.get_mut(f).unwrap();
            d.params = vec!["x".to_string()];
            d.bodies = vec![(Facet::Body, Body::parse(source).unwrap())];
        }
        let g = p.add_member(ty, "g", DeclKind::Method).unwrap();
        {
            let d = p.get_mut(g).unwrap();
            d.params = vec!["y".to_string()];
            d.bodies = vec![(Facet::Body, Body::parse("return y * 2;").unwrap())];
        }
        let mut snap = UnitSnapshot::from_program(&p, ty).unwrap();
        for (i, (src, flags)) in overrides.iter().enumerate() {
            let fold = snap.fold(
                &OrderedAspectLayer {
                    layer: AspectLayer::primary(&format!("A{}", i + 1)),
                    order: i as u32,
                },
                vec![Contribution {
                    instance_target: f,
                    transformations: vec![Transformation::Override {
                        target: f,
                        facet: Facet::Body,
                        body: Body::parse(src).unwrap(),
                        flags: *flags,
                    }],
                }],
            );
            assert!(fold.fatal.is_none(), "{:?}", fold.fatal);
            snap = fold.snapshot;
        }
        snap
    }

    fn link(snap: &UnitSnapshot) -> LinkedUnit {
        link_unit(snap, &LinkOptions::default()).unwrap()
    }

    fn body_of(unit: &LinkedUnit, callable: &str) -> String {
        unit.callable(callable)
            .and_then(|m| m.body.as_ref())
            .map(|b| b.to_string())
            .unwrap_or_default()
    }

    #[test]
    fn test_wf023_single_inline_override_collapses() {
        let unit = link(&woven(
            "return x;",
            &[("log(\"a\"); return {{base|inline}}(x);", DeclFlags::empty())],
        ));
        assert_eq!(unit.synthetic_count(), 0);
        assert_eq!(body_of(&unit, "f"), "log(\"a\"); return x;");
    }

    #[test]
    fn test_wf023_two_plain_overrides_three_bodies() {
        let unit = link(&woven(
            "return x;",
            &[
                ("log(\"1\"); return {{base}}(x);", DeclFlags::empty()),
                ("log(\"2\"); return {{base}}(x);", DeclFlags::empty()),
            ],
        ));
        assert_eq!(body_of(&unit, "f"), "log(\"2\"); return f__A1(x);");
        assert_eq!(body_of(&unit, "f__A1"), "log(\"1\"); return f__source(x);");
        assert_eq!(body_of(&unit, "f__source"), "return x;");
        assert_eq!(unit.forms_of("f").len(), 3);
    }

    #[test]
    fn test_wf023_pure_forward_skipped() {
        let unit = link(&woven(
            "return x;",
            &[
                ("log(\"1\"); return {{base}}(x);", DeclFlags::empty()),
                ("return {{base}}(x);", DeclFlags::empty()),
                ("log(\"3\"); return {{base}}(x);", DeclFlags::empty()),
            ],
        ));
        assert_eq!(body_of(&unit, "f"), "log(\"3\"); return f__A1(x);");
        assert!(unit.callable("f__A2").is_none());
    }

    #[test]
    fn test_wf023_non_trivial_argument_bound_once() {
        let unit = link(&woven(
            "let t = x + 1; return t;",
            &[("return {{base|inline}}(next(x));", DeclFlags::empty())],
        ));
        assert_eq!(body_of(&unit, "f"), "let x_1 = next(x); let t = x_1 + 1; return t;");
    }

    #[test]
    fn test_wf023_colliding_local_renamed() {
        let unit = link(&woven(
            "let t = x * 3; return t;",
            &[("let t = 1; let r = {{base|inline}}(x); return r + t;", DeclFlags::empty())],
        ));
        assert_eq!(
            body_of(&unit, "f"),
            "let t = 1; let t_1 = x * 3; let r = t_1; return r + t;"
        );
    }

    #[test]
    fn test_wf023_multi_exit_target_not_inlined() {
        let unit = link(&woven(
            "if x > 1 { return 1; } return 2;",
            &[("return {{base|inline}}(x);", DeclFlags::empty())],
        ));
        assert_eq!(body_of(&unit, "f"), "return f__source(x);");
    }

    #[test]
    fn test_wf023_not_inlineable_element_called() {
        let unit = link(&woven(
            "return x;",
            &[
                ("log(\"1\"); return {{base}}(x);", DeclFlags::NOT_INLINEABLE),
                ("return {{base|inline}}(x) + 1;", DeclFlags::empty()),
            ],
        ));
        assert_eq!(body_of(&unit, "f"), "return f__A1(x) + 1;");
    }

    #[test]
    fn test_wf023_expression_inline() {
        let unit = link(&woven(
            "return x;",
            &[("return {{base|inline}}(x) + {{base|inline@g}}(x);", DeclFlags::empty())],
        ));
        assert_eq!(body_of(&unit, "f"), "return x + x * 2;");
    }

    #[test]
    fn test_wf023_inlining_disabled() {
        let snap = woven("return x;", &[("log(\"a\"); return {{base|inline}}(x);", DeclFlags::empty())]);
        let unit = link_unit(&snap, &LinkOptions { inlining: false }).unwrap();
        assert_eq!(body_of(&unit, "f"), "log(\"a\"); return f__source(x);");
    }

    #[test]
    fn test_wf023_statement_site_drops_pure_value() {
        let unit = link(&woven(
            "log(x); return x;",
            &[("{{base|inline}}(x); return 0;", DeclFlags::empty())],
        ));
        assert_eq!(body_of(&unit, "f"), "log(x); return 0;");
    }

    #[test]
    fn test_wf023_final_from_earlier_layer() {
        let unit = link(&woven(
            "return x;",
            &[
                ("if x > 98 { return 0; } return {{final}}(x + 1);", DeclFlags::empty()),
                ("log(\"2\"); return {{base}}(x);", DeclFlags::empty()),
            ],
        ));
        assert_eq!(body_of(&unit, "f__A1"), "if x > 98 { return 0; } return f(x + 1);");
        let (value, trace) = call_linked(&unit, "f", vec![Value::Int(98)]).unwrap();
        assert_eq!(value, Value::Int(0));
        assert_eq!(trace, vec!["log(\"2\")", "log(\"2\")"]);
    }

    #[test]
    fn test_wf023_arity_mismatch_is_internal() {
        let snap = woven("return x;", &[]);
        // A reference the fold would have rejected.
        let mut broken = snap.member_by_name("f").unwrap().clone();
        broken.chains[0].1[0].body = Body::parse("return {{self@g}}(1, 2);").unwrap();
        let g = snap.member_by_name("g").unwrap().clone();
        let snap = UnitSnapshot::from_members(DeclId::Source(0), "T", Vec::new(), vec![broken, g]);
        let err = link_unit(&snap, &LinkOptions::default()).unwrap_err();
        assert!(err.to_string().contains("expected 1"));
    }

    fn override_body(i: usize, inline: bool, pure: bool) -> String {
        let r = if inline { "{{base|inline}}" } else { "{{base}}" };
        if pure {
            format!("return {}(x);", r)
        } else {
            format!("let r = {}(x + {}); log(\"A{}\"); return r;", r, i, i)
        }
    }

    proptest! {
        /// Every non-forwarding layer runs exactly once per call, innermost
        /// first, and linking preserves the chain's value and trace.
        #[test]
        fn prop_wf023_exactly_once_ascending(
            layers in proptest::collection::vec((any::<bool>(), any::<bool>(), any::<bool>()), 1..7),
            arg in -50i64..50,
        ) {
            let bodies: Vec<(String, DeclFlags)> = layers
                .iter()
                .enumerate()
                .map(|(i, (inline, pure, pin))| {
                    let flags = if *pin { DeclFlags::NOT_DISCARDABLE } else { DeclFlags::empty() };
                    (override_body(i + 1, *inline, *pure), flags)
                })
                .collect();
            let refs: Vec<(&str, DeclFlags)> = bodies.iter().map(|(b, f)| (b.as_str(), *f)).collect();
            let snap = woven("log(\"source\"); return x * 2;", &refs);

            let (expected, chain_trace) = call_chain(&snap, "f", vec![Value::Int(arg)]).unwrap();
            let unit = link(&snap);
            let (value, trace) = call_linked(&unit, "f", vec![Value::Int(arg)]).unwrap();
            prop_assert_eq!(&value, &expected);
            prop_assert_eq!(&trace, &chain_trace);

            let mut want = vec!["log(\"source\")".to_string()];
            for (i, (_, pure, _)) in layers.iter().enumerate() {
                if !pure {
                    want.push(format!("log(\"A{}\")", i + 1));
                }
            }
            prop_assert_eq!(trace, want);

            let shift: i64 = layers
                .iter()
                .enumerate()
                .filter(|(_, (_, pure, _))| !pure)
                .map(|(i, _)| (i + 1) as i64)
                .sum();
            prop_assert_eq!(value, Value::Int((arg + shift) * 2));
        }
    }
}
