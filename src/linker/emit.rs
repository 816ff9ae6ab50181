//! WF-022: Emission — naming, materialization worklist, and final member order.

use super::graph::{ElementRef, ReferenceGraph};
use super::{LinkedMember, LinkedUnit, Linker};
use crate::core::error::WeaveError;
use crate::model::syntax::Facet;
use crate::model::DeclFlags;
use rustc_hash::{FxHashMap, FxHashSet};

/// Base synthetic name of one non-final element, before de-duplication.
fn synthetic_base(prefix: &str, member: &str, element: &crate::model::snapshot::ChainElement) -> String {
    match element.layer {
        None => format!("{}{}__source", prefix, member),
        Some(ref l) => match l.layer_name() {
            Some(layer) => format!("{}{}__{}_{}", prefix, member, l.aspect(), layer),
            None => format!("{}{}__{}", prefix, member, l.aspect()),
        },
    }
}

/// Names for every element: the public callable for the last element of a
/// chain, a synthetic name otherwise. Computed in layout order so the result
/// does not depend on which elements end up materialized.
pub(super) fn assign_names(graph: &ReferenceGraph<'_>) -> Result<FxHashMap<ElementRef, String>, WeaveError> {
    let mut taken: FxHashSet<String> = FxHashSet::default();
    for m in graph.snapshot().members() {
        if m.chains.is_empty() {
            taken.insert(m.name.clone());
        }
        for (facet, _) in &m.chains {
            taken.insert(m.callable(*facet));
        }
    }

    let mut names = FxHashMap::default();
    for key in graph.chains() {
        let member = graph.member(key.member)?;
        let chain = graph.chain(*key)?;
        for (index, element) in chain.iter().enumerate() {
            let e = ElementRef { key: *key, index };
            if index + 1 == chain.len() {
                names.insert(e, member.callable(key.facet));
                continue;
            }
            let base = synthetic_base(key.facet.prefix(), &member.name, element);
            let mut name = base.clone();
            let mut n = 2;
            while !taken.insert(name.clone()) {
                name = format!("{}_{}", base, n);
                n += 1;
            }
            names.insert(e, name);
        }
    }
    Ok(names)
}

impl Linker<'_> {
    /// Name to call for `target`; schedules it for materialization.
    pub(super) fn call_target(&mut self, target: ElementRef) -> Result<String, WeaveError> {
        let name = self
            .names
            .get(&target)
            .cloned()
            .ok_or_else(|| WeaveError::internal(format!("no name assigned to element {:?}", target)))?;
        if !self.emitted.contains_key(&target) {
            self.queue.push(target);
        }
        Ok(name)
    }

    /// The public form of every chain, plus every pinned element.
    pub(super) fn seed_roots(&mut self) -> Result<(), WeaveError> {
        for key in self.graph.chains().to_vec() {
            let chain = self.graph.chain(key)?;
            for (index, element) in chain.iter().enumerate() {
                let last = index + 1 == chain.len();
                if last || element.flags.contains(DeclFlags::NOT_DISCARDABLE) {
                    self.queue.push(ElementRef { key, index });
                }
            }
        }
        Ok(())
    }

    /// Materialize queued elements, each at most once.
    pub(super) fn drain(&mut self) -> Result<(), WeaveError> {
        while let Some(e) = self.queue.pop() {
            if self.emitted.contains_key(&e) {
                continue;
            }
            let body = self.rewrite_element(e)?;
            self.emitted.insert(e, body);
        }
        Ok(())
    }

    /// Final member list: layout order; per member, fields or public forms
    /// first (facet order), then synthetic forms by facet and chain position.
    pub(super) fn assemble(mut self) -> Result<LinkedUnit, WeaveError> {
        let snapshot = self.graph.snapshot();
        let mut members = Vec::new();
        for id in snapshot.layout() {
            let member = self.graph.member(id)?;
            if member.chains.is_empty() {
                members.push(LinkedMember {
                    decl: id,
                    name: member.name.clone(),
                    kind: member.kind,
                    facet: None,
                    callable: member.name.clone(),
                    params: Vec::new(),
                    synthetic: false,
                    origin: None,
                    body: None,
                });
                continue;
            }

            let mut synthetic = Vec::new();
            for (facet, chain) in &member.chains {
                let facet: Facet = *facet;
                let key = super::graph::ChainKey { member: id, facet };
                for (index, element) in chain.iter().enumerate() {
                    let e = ElementRef { key, index };
                    let Some(body) = self.emitted.remove(&e) else {
                        continue;
                    };
                    let form = LinkedMember {
                        decl: id,
                        name: member.name.clone(),
                        kind: member.kind,
                        facet: Some(facet),
                        callable: self.names.get(&e).cloned().unwrap_or_default(),
                        params: member.facet_params(facet),
                        synthetic: index + 1 != chain.len(),
                        origin: element.layer.as_ref().map(|l| l.layer.clone()),
                        body: Some(body),
                    };
                    if form.synthetic {
                        synthetic.push(form);
                    } else {
                        members.push(form);
                    }
                }
            }
            members.extend(synthetic);
        }

        Ok(LinkedUnit {
            unit: snapshot.unit,
            type_name: snapshot.name.clone(),
            interfaces: snapshot.interfaces.clone(),
            members,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::{AspectLayer, OrderedAspectLayer};
    use crate::model::snapshot::{ChainElement, UnitSnapshot};
    use crate::model::syntax::Body;

    fn element(layer: Option<(&str, Option<&str>)>) -> ChainElement {
        ChainElement {
            layer: layer.map(|(a, l)| OrderedAspectLayer {
                layer: AspectLayer::new(a, l),
                order: 0,
            }),
            body: Body::default(),
            flags: DeclFlags::empty(),
        }
    }

    #[test]
    fn test_wf022_synthetic_base_names() {
        assert_eq!(synthetic_base("", "f", &element(None)), "f__source");
        assert_eq!(synthetic_base("get_", "total", &element(Some(("Log", None)))), "get_total__Log");
        assert_eq!(
            synthetic_base("", "f", &element(Some(("Cache", Some("warm"))))),
            "f__Cache_warm"
        );
    }

    #[test]
    fn test_wf022_names_avoid_collisions() {
        use crate::model::{DeclId, DeclKind, Modifiers};
        use crate::model::snapshot::MemberState;
        let method = |id: u32, name: &str, chain: Vec<ChainElement>| MemberState {
            id: DeclId::Source(id),
            name: name.to_string(),
            kind: DeclKind::Method,
            params: Vec::new(),
            modifiers: Modifiers::PUBLIC,
            flags: DeclFlags::empty(),
            introduced_by: None,
            replaced_by: None,
            chains: vec![(Facet::Body, chain)],
        };
        let snap = UnitSnapshot::from_members(
            DeclId::Source(0),
            "T",
            Vec::new(),
            vec![
                method(1, "f__source", vec![element(None)]),
                method(2, "f", vec![element(None), element(Some(("A", None))), element(Some(("A", None)))]),
            ],
        );
        let graph = ReferenceGraph::new(&snap).unwrap();
        let names = assign_names(&graph).unwrap();
        let mut assigned: Vec<String> = names.values().cloned().collect();
        assigned.sort();
        assert_eq!(assigned, vec!["f", "f__A", "f__source", "f__source_2"]);
    }
}
