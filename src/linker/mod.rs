//! WF-021: Linker — turn chains and aspect references into final members.
//!
//! Per unit: resolve every reference through the [`graph::ReferenceGraph`],
//! skip pure forwards, inline where the call site allows it, and materialize
//! each remaining target once under a collision-free synthetic name. The last
//! element of every chain is emitted under the public name.

pub mod emit;
pub mod eval;
pub mod graph;
pub mod inline;

use crate::core::error::WeaveError;
use crate::core::registry::AspectLayer;
use crate::model::snapshot::{ChainElement, MemberState, UnitSnapshot};
use crate::model::syntax::{Body, Facet};
use crate::model::{DeclFlags, DeclId, DeclKind, Modifiers};
use graph::{ElementRef, ReferenceGraph};
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkOptions {
    /// Honour `|inline` call sites.
    pub inlining: bool,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self { inlining: true }
    }
}

/// One emitted form: a field, a public callable, or a synthetic callable.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedMember {
    pub decl: DeclId,
    pub name: String,
    pub kind: DeclKind,
    /// `None` for fields.
    pub facet: Option<Facet>,
    pub callable: String,
    pub params: Vec<String>,
    pub synthetic: bool,
    /// Layer that contributed the body; `None` for source bodies.
    pub origin: Option<AspectLayer>,
    pub body: Option<Body>,
}

/// The frozen final members of one type.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedUnit {
    pub unit: DeclId,
    pub type_name: String,
    pub interfaces: Vec<String>,
    pub members: Vec<LinkedMember>,
}

impl LinkedUnit {
    pub fn callable(&self, name: &str) -> Option<&LinkedMember> {
        self.members
            .iter()
            .find(|m| m.facet.is_some() && m.callable == name)
    }

    pub fn synthetic_count(&self) -> usize {
        self.members.iter().filter(|m| m.synthetic).count()
    }

    /// Bodies emitted for one member, public form first.
    pub fn forms_of(&self, member: &str) -> Vec<&LinkedMember> {
        self.members.iter().filter(|m| m.name == member).collect()
    }

    pub fn render(&self) -> String {
        let mut out = format!("type {}", self.type_name);
        if !self.interfaces.is_empty() {
            out.push_str(&format!(" implements {}", self.interfaces.join(", ")));
        }
        out.push_str(" {\n");
        for m in &self.members {
            match m.body {
                None => out.push_str(&format!("    field {};\n", m.callable)),
                Some(ref body) => {
                    out.push_str(&format!("    fn {}({}) {{\n", m.callable, m.params.join(", ")));
                    out.push_str(&body.render(2));
                    out.push_str("    }\n");
                }
            }
        }
        out.push_str("}\n");
        out
    }

    /// Read the linked unit back as an unwoven source unit. Synthetic forms
    /// become ordinary methods placed after the member they came from.
    pub fn to_snapshot(&self) -> UnitSnapshot {
        let mut members: Vec<MemberState> = Vec::new();
        let mut public: FxHashMap<DeclId, usize> = FxHashMap::default();
        let mut next = 0u32;
        let mut fresh_id = || {
            next += 1;
            DeclId::Source(next)
        };

        for m in &self.members {
            let element = |body: &Body| ChainElement {
                layer: None,
                body: body.clone(),
                flags: DeclFlags::empty(),
            };
            if m.synthetic {
                let body = m.body.clone().unwrap_or_default();
                members.push(MemberState {
                    id: fresh_id(),
                    name: m.callable.clone(),
                    kind: DeclKind::Method,
                    params: m.params.clone(),
                    modifiers: Modifiers::PUBLIC,
                    flags: DeclFlags::empty(),
                    introduced_by: None,
                    replaced_by: None,
                    chains: vec![(Facet::Body, vec![element(&body)])],
                });
                continue;
            }
            match public.get(&m.decl) {
                Some(&slot) => {
                    if let (Some(facet), Some(body)) = (m.facet, &m.body) {
                        members[slot].chains.push((facet, vec![element(body)]));
                    }
                }
                None => {
                    public.insert(m.decl, members.len());
                    let chains = match (m.facet, &m.body) {
                        (Some(facet), Some(body)) => vec![(facet, vec![element(body)])],
                        _ => Vec::new(),
                    };
                    let params = if m.kind == DeclKind::Method {
                        m.params.clone()
                    } else {
                        Vec::new()
                    };
                    members.push(MemberState {
                        id: fresh_id(),
                        name: m.name.clone(),
                        kind: m.kind,
                        params,
                        modifiers: Modifiers::PUBLIC,
                        flags: DeclFlags::empty(),
                        introduced_by: None,
                        replaced_by: None,
                        chains,
                    });
                }
            }
        }
        UnitSnapshot::from_members(self.unit, &self.type_name, self.interfaces.clone(), members)
    }
}

/// Per-unit link state shared by the emission and inlining passes.
pub(crate) struct Linker<'a> {
    graph: ReferenceGraph<'a>,
    options: LinkOptions,
    names: FxHashMap<ElementRef, String>,
    emitted: FxHashMap<ElementRef, Body>,
    queue: Vec<ElementRef>,
}

/// Link one unit.
pub fn link_unit(snapshot: &UnitSnapshot, options: &LinkOptions) -> Result<LinkedUnit, WeaveError> {
    let _span = tracing::debug_span!("link", unit = %snapshot.name).entered();
    let graph = ReferenceGraph::new(snapshot)?;
    let names = emit::assign_names(&graph)?;
    let mut linker = Linker {
        graph,
        options: *options,
        names,
        emitted: FxHashMap::default(),
        queue: Vec::new(),
    };
    linker.seed_roots()?;
    linker.drain()?;
    let unit = linker.assemble()?;
    tracing::debug!(
        members = unit.members.len(),
        synthetic = unit.synthetic_count(),
        "unit linked"
    );
    Ok(unit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::OrderedAspectLayer;
    use crate::model::snapshot::Contribution;
    use crate::model::transform::Transformation;
    use crate::model::Program;

    fn layer(aspect: &str, order: u32) -> OrderedAspectLayer {
        OrderedAspectLayer {
            layer: AspectLayer::primary(aspect),
            order,
        }
    }

    /// `Calc` with `f(x) { return x; }`, a `total` property and a `count` field.
    fn woven(overrides: &[(&str, &str, DeclFlags)]) -> UnitSnapshot {
        let mut p = Program::new();
        let ty = p.add_type("Calc");
        let f = p.add_member(ty, "f", DeclKind::Method).unwrap();
        {
            let d = p.get_mut(f).unwrap();
            d.params = vec!["x".to_string()];
            d.bodies = vec![(Facet::Body, Body::parse("return x;").unwrap())];
        }
        let total = p.add_member(ty, "total", DeclKind::Property).unwrap();
        p.get_mut(total).unwrap().bodies = vec![
            (Facet::Get, Body::parse("return 5;").unwrap()),
            (Facet::Set, Body::parse("store(value);").unwrap()),
        ];
        p.add_member(ty, "count", DeclKind::Field).unwrap();
        let mut snap = UnitSnapshot::from_program(&p, ty).unwrap();
        for (i, (aspect, src, flags)) in overrides.iter().enumerate() {
            let fold = snap.fold(
                &layer(aspect, i as u32),
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
            assert!(fold.fatal.is_none());
            snap = fold.snapshot;
        }
        snap
    }

    fn body_of(unit: &LinkedUnit, callable: &str) -> String {
        unit.callable(callable)
            .and_then(|m| m.body.as_ref())
            .map(|b| b.to_string())
            .unwrap_or_default()
    }

    #[test]
    fn test_wf021_unwoven_unit_links_to_itself() {
        let unit = link_unit(&woven(&[]), &LinkOptions::default()).unwrap();
        assert_eq!(unit.synthetic_count(), 0);
        assert_eq!(body_of(&unit, "f"), "return x;");
        assert_eq!(body_of(&unit, "get_total"), "return 5;");
        assert_eq!(body_of(&unit, "set_total"), "store(value);");
        assert!(unit.members.iter().any(|m| m.facet.is_none() && m.name == "count"));
    }

    #[test]
    fn test_wf021_render() {
        let unit = link_unit(&woven(&[]), &LinkOptions::default()).unwrap();
        let text = unit.render();
        assert!(text.starts_with("type Calc {\n"));
        assert!(text.contains("    fn f(x) {\n        return x;\n    }\n"));
        assert!(text.contains("    field count;\n"));
    }

    #[test]
    fn test_wf021_not_discardable_always_materialized() {
        let snap = woven(&[
            ("Pin", "return {{base}}(x);", DeclFlags::NOT_DISCARDABLE),
            ("Log", "log(\"l\"); return {{base}}(x);", DeclFlags::empty()),
        ]);
        let unit = link_unit(&snap, &LinkOptions::default()).unwrap();
        assert_eq!(body_of(&unit, "f"), "log(\"l\"); return f__Pin(x);");
        assert_eq!(body_of(&unit, "f__Pin"), "return f__source(x);");
        assert_eq!(body_of(&unit, "f__source"), "return x;");
    }

    #[test]
    fn test_wf021_to_snapshot_roundtrip_is_idempotent() {
        let snap = woven(&[
            ("A", "log(\"a\"); return {{base}}(x);", DeclFlags::empty()),
            ("B", "log(\"b\"); return {{base}}(x) + 1;", DeclFlags::empty()),
        ]);
        let once = link_unit(&snap, &LinkOptions::default()).unwrap();
        let twice = link_unit(&once.to_snapshot(), &LinkOptions::default()).unwrap();
        assert_eq!(once.render(), twice.render());
        assert_eq!(twice.synthetic_count(), 0);
    }
}
