//! WF-020: Aspect reference graph — resolution of references to chain elements.
//!
//! Within one chain, `base` is the preceding element and `self` the element
//! itself. Across members, the referencing element's layer decides: `base`
//! is the last element strictly before it, `self` the last at or before it.
//! `original` and `final` are the first and last element of the target chain.

use crate::core::error::WeaveError;
use crate::model::snapshot::{ChainElement, MemberState, UnitSnapshot};
use crate::model::syntax::{AspectReference, Direction, Expr, Facet, Stmt};
use crate::model::{DeclFlags, DeclId};
use rustc_hash::{FxHashMap, FxHashSet};

/// One (member, facet) chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainKey {
    pub member: DeclId,
    pub facet: Facet,
}

/// One element of one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementRef {
    pub key: ChainKey,
    pub index: usize,
}

pub struct ReferenceGraph<'a> {
    snapshot: &'a UnitSnapshot,
    by_name: FxHashMap<&'a str, DeclId>,
    chains: Vec<ChainKey>,
    final_targets: FxHashSet<ElementRef>,
}

impl<'a> ReferenceGraph<'a> {
    pub fn new(snapshot: &'a UnitSnapshot) -> Result<Self, WeaveError> {
        let by_name = snapshot
            .members()
            .map(|m| (m.name.as_str(), m.id))
            .collect();
        let mut chains = Vec::new();
        for id in snapshot.layout() {
            if let Some(member) = snapshot.member(id) {
                chains.extend(member.chains.iter().map(|(facet, _)| ChainKey {
                    member: id,
                    facet: *facet,
                }));
            }
        }
        let mut graph = Self {
            snapshot,
            by_name,
            chains,
            final_targets: FxHashSet::default(),
        };

        let mut finals = FxHashSet::default();
        for e in graph.elements() {
            for r in graph.element(e)?.body.references() {
                if r.direction == Direction::Final {
                    finals.insert(graph.resolve(e, r)?);
                }
            }
        }
        graph.final_targets = finals;
        Ok(graph)
    }

    pub fn snapshot(&self) -> &'a UnitSnapshot {
        self.snapshot
    }

    /// Chains in layout order, facets in member order.
    pub fn chains(&self) -> &[ChainKey] {
        &self.chains
    }

    /// Every element of every chain.
    pub fn elements(&self) -> Vec<ElementRef> {
        let mut out = Vec::new();
        for key in &self.chains {
            let len = self.chain(*key).map(|c| c.len()).unwrap_or(0);
            out.extend((0..len).map(|index| ElementRef { key: *key, index }));
        }
        out
    }

    pub fn member(&self, id: DeclId) -> Result<&'a MemberState, WeaveError> {
        self.snapshot
            .member(id)
            .ok_or_else(|| WeaveError::internal(format!("member {} vanished from '{}'", id, self.snapshot.name)))
    }

    pub fn chain(&self, key: ChainKey) -> Result<&'a [ChainElement], WeaveError> {
        let member = self.member(key.member)?;
        member.chain(key.facet).ok_or_else(|| {
            WeaveError::internal(format!("'{}' has no {} chain", member.name, key.facet))
        })
    }

    pub fn element(&self, e: ElementRef) -> Result<&'a ChainElement, WeaveError> {
        self.chain(e.key)?.get(e.index).ok_or_else(|| {
            WeaveError::internal(format!(
                "chain element {} of {}.{} does not exist",
                e.index, e.key.member, e.key.facet
            ))
        })
    }

    pub fn last(&self, key: ChainKey) -> Result<ElementRef, WeaveError> {
        let len = self.chain(key)?.len();
        if len == 0 {
            return Err(WeaveError::internal(format!("empty chain for {}", key.member)));
        }
        Ok(ElementRef { key, index: len - 1 })
    }

    pub fn is_last(&self, e: ElementRef) -> bool {
        self.chain(e.key).map(|c| e.index + 1 == c.len()).unwrap_or(false)
    }

    pub fn params(&self, key: ChainKey) -> Result<Vec<String>, WeaveError> {
        Ok(self.member(key.member)?.facet_params(key.facet))
    }

    /// Resolve `r`, authored in element `from`, to the element it calls.
    pub fn resolve(&self, from: ElementRef, r: &AspectReference) -> Result<ElementRef, WeaveError> {
        let owner = self.member(from.key.member)?;
        let member = match r.member {
            Some(ref name) => *self.by_name.get(name.as_str()).ok_or_else(|| {
                WeaveError::internal(format!(
                    "reference in '{}' names unknown member '{}'",
                    owner.name, name
                ))
            })?,
            None => from.key.member,
        };
        let facet = r
            .facet
            .unwrap_or(if r.member.is_none() { from.key.facet } else { Facet::Body });
        let key = ChainKey { member, facet };
        let chain = self.chain(key)?;
        let missing = || {
            WeaveError::internal(format!(
                "{{{{{}}}}} from element {} of '{}' has no target",
                r.direction, from.index, owner.name
            ))
        };

        let index = if key == from.key {
            match r.direction {
                Direction::Base => from.index.checked_sub(1).ok_or_else(missing)?,
                Direction::Current => from.index,
                Direction::Original => 0,
                Direction::Final => chain.len().checked_sub(1).ok_or_else(missing)?,
            }
        } else {
            let at = self.element(from)?.order_key();
            match r.direction {
                Direction::Base => chain.iter().rposition(|e| e.order_key() < at).ok_or_else(missing)?,
                Direction::Current => chain.iter().rposition(|e| e.order_key() <= at).ok_or_else(missing)?,
                Direction::Original => {
                    if chain.is_empty() {
                        return Err(missing());
                    }
                    0
                }
                Direction::Final => chain.len().checked_sub(1).ok_or_else(missing)?,
            }
        };
        Ok(ElementRef { key, index })
    }

    /// The `base` reference of a pure forward: a body that is exactly
    /// `return {{base}}(params...);` on its own chain.
    pub fn forwarded_reference(&self, e: ElementRef) -> Result<Option<&'a AspectReference>, WeaveError> {
        if e.index == 0 {
            return Ok(None);
        }
        let element = self.element(e)?;
        let [Stmt::Return(Some(Expr::Ref(r)))] = element.body.stmts.as_slice() else {
            return Ok(None);
        };
        let member = self.member(e.key.member)?;
        let own_member = r.member.as_deref().map_or(true, |m| m == member.name);
        let own_facet = r.facet.map_or(true, |f| f == e.key.facet);
        let params = member.facet_params(e.key.facet);
        let passes_params = r.args.len() == params.len()
            && r.args
                .iter()
                .zip(&params)
                .all(|(a, p)| matches!(a, Expr::Name(n) if n == p));
        let pure = r.direction == Direction::Base && own_member && own_facet && passes_params;
        Ok(pure.then_some(r))
    }

    /// Not last, not a `final` target, not pinned, and a pure forward.
    pub fn is_discardable(&self, e: ElementRef) -> Result<bool, WeaveError> {
        if self.is_last(e) || self.final_targets.contains(&e) {
            return Ok(false);
        }
        if self.element(e)?.flags.contains(DeclFlags::NOT_DISCARDABLE) {
            return Ok(false);
        }
        Ok(self.forwarded_reference(e)?.is_some())
    }

    /// Follow discardable forwards to the element that does the work.
    pub fn effective(&self, mut e: ElementRef) -> Result<ElementRef, WeaveError> {
        let mut hops = 0;
        while self.is_discardable(e)? {
            let Some(r) = self.forwarded_reference(e)? else {
                break;
            };
            e = self.resolve(e, r)?;
            hops += 1;
            if hops > self.chain(e.key)?.len() {
                return Err(WeaveError::internal("forwarding loop in chain"));
            }
        }
        Ok(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::{AspectLayer, OrderedAspectLayer};
    use crate::model::snapshot::Contribution;
    use crate::model::syntax::Body;
    use crate::model::transform::Transformation;
    use crate::model::{DeclKind, Program};

    fn layer(aspect: &str, order: u32) -> OrderedAspectLayer {
        OrderedAspectLayer {
            layer: AspectLayer::primary(aspect),
            order,
        }
    }

    /// `f(x)` overridden once per body, in order; `g()` overridden by layer 1 only.
    fn snapshot(bodies: &[&str]) -> (UnitSnapshot, DeclId, DeclId) {
        let mut p = Program::new();
        let ty = p.add_type("T");
        let f = p.add_member(ty, "f", DeclKind::Method).unwrap();
        {
            let d = p.get_mut(f).unwrap();
            d.params = vec!["x".to_string()];
            d.bodies = vec![(Facet::Body, Body::parse("return x;").unwrap())];
        }
        let g = p.add_member(ty, "g", DeclKind::Method).unwrap();
        p.get_mut(g).unwrap().bodies = vec![(Facet::Body, Body::parse("return 1;").unwrap())];
        let mut snap = UnitSnapshot::from_program(&p, ty).unwrap();
        for (i, src) in bodies.iter().enumerate() {
            let mut ts = vec![Transformation::Override {
                target: f,
                facet: Facet::Body,
                body: Body::parse(src).unwrap(),
                flags: DeclFlags::empty(),
            }];
            if i == 1 {
                ts.push(Transformation::Override {
                    target: g,
                    facet: Facet::Body,
                    body: Body::parse("return {{base}}() + 1;").unwrap(),
                    flags: DeclFlags::empty(),
                });
            }
            let fold = snap.fold(
                &layer(&format!("A{}", i + 1), (i + 1) as u32),
                vec![Contribution {
                    instance_target: f,
                    transformations: ts,
                }],
            );
            snap = fold.snapshot;
        }
        (snap, f, g)
    }

    fn at(member: DeclId, index: usize) -> ElementRef {
        ElementRef {
            key: ChainKey {
                member,
                facet: Facet::Body,
            },
            index,
        }
    }

    fn first_ref(graph: &ReferenceGraph<'_>, e: ElementRef) -> AspectReference {
        graph.element(e).unwrap().body.references()[0].clone()
    }

    #[test]
    fn test_wf020_same_chain_directions() {
        let (snap, f, _) = snapshot(&[
            "log(\"1\"); return {{base}}(x);",
            "return {{original}}(x) + {{self}}(x) + {{final}}(x);",
            "log(\"3\"); return {{base}}(x);",
        ]);
        let graph = ReferenceGraph::new(&snap).unwrap();
        assert_eq!(graph.resolve(at(f, 1), &first_ref(&graph, at(f, 1))).unwrap(), at(f, 0));
        let refs: Vec<AspectReference> = graph
            .element(at(f, 2))
            .unwrap()
            .body
            .references()
            .into_iter()
            .cloned()
            .collect();
        assert_eq!(graph.resolve(at(f, 2), &refs[0]).unwrap(), at(f, 0));
        assert_eq!(graph.resolve(at(f, 2), &refs[1]).unwrap(), at(f, 2));
        assert_eq!(graph.resolve(at(f, 2), &refs[2]).unwrap(), at(f, 3));
    }

    #[test]
    fn test_wf020_final_from_earlier_layer_targets_last() {
        let (snap, f, _) = snapshot(&["return {{final}}(x);", "log(\"2\"); return {{base}}(x);"]);
        let graph = ReferenceGraph::new(&snap).unwrap();
        let r = first_ref(&graph, at(f, 1));
        assert_eq!(graph.resolve(at(f, 1), &r).unwrap(), at(f, 2));
    }

    #[test]
    fn test_wf020_cross_member_uses_layer_position() {
        let (snap, f, g) = snapshot(&[
            "return {{base@g}}() + x;",
            "return {{base}}(x);",
            "return {{self@g}}() + {{base@g}}() + x;",
        ]);
        let graph = ReferenceGraph::new(&snap).unwrap();
        // layer 1 sees g's source only
        let r = first_ref(&graph, at(f, 1));
        assert_eq!(graph.resolve(at(f, 1), &r).unwrap(), at(g, 0));
        // layer 3 sees g's layer-2 override for both self and base
        let refs: Vec<AspectReference> = graph
            .element(at(f, 3))
            .unwrap()
            .body
            .references()
            .into_iter()
            .cloned()
            .collect();
        assert_eq!(graph.resolve(at(f, 3), &refs[0]).unwrap(), at(g, 1));
        assert_eq!(graph.resolve(at(f, 3), &refs[1]).unwrap(), at(g, 1));
    }

    #[test]
    fn test_wf020_pure_forward_is_discardable() {
        let (snap, f, _) = snapshot(&[
            "log(\"1\"); return {{base}}(x);",
            "return {{base}}(x);",
            "log(\"3\"); return {{base}}(x);",
        ]);
        let graph = ReferenceGraph::new(&snap).unwrap();
        assert!(graph.is_discardable(at(f, 2)).unwrap());
        assert!(!graph.is_discardable(at(f, 1)).unwrap());
        assert_eq!(graph.effective(at(f, 2)).unwrap(), at(f, 1));
        assert_eq!(graph.effective(at(f, 1)).unwrap(), at(f, 1));
    }

    #[test]
    fn test_wf020_last_element_never_discardable() {
        let (snap, f, _) = snapshot(&["return {{base}}(x);"]);
        let graph = ReferenceGraph::new(&snap).unwrap();
        assert!(!graph.is_discardable(at(f, 1)).unwrap());
    }

    #[test]
    fn test_wf020_forward_with_other_args_is_not_pure() {
        let (snap, f, _) = snapshot(&["return {{base}}(x + 1);", "log(\"2\"); return {{base}}(x);"]);
        let graph = ReferenceGraph::new(&snap).unwrap();
        assert!(graph.forwarded_reference(at(f, 1)).unwrap().is_none());
    }
}
