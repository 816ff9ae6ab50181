//! WF-010: Unit snapshots and the per-layer fold.
//!
//! A [`UnitSnapshot`] is the immutable view of one top-level type after some
//! prefix of the layer order. Members are `Arc`-shared, so folding a layer
//! clones only the members it touches. Each aspect instance's contribution is
//! applied to a trial copy and kept only if every transformation in it is
//! accepted.

use super::syntax::{AspectReference, Body, Direction, Facet};
use super::transform::{
    AppliedTransformation, InsertPosition, MemberSpec, Transformation, WhenExists,
};
use super::{DeclFlags, DeclId, DeclKind, Modifiers, Program};
use crate::core::diagnostics::DiagnosticCode;
use crate::core::registry::OrderedAspectLayer;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// One element of a (member, facet) chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainElement {
    /// Contributing layer; `None` for the source body.
    pub layer: Option<OrderedAspectLayer>,
    pub body: Body,
    pub flags: DeclFlags,
}

impl ChainElement {
    /// Position of this element in the global order; source sorts first.
    pub fn order_key(&self) -> Option<u32> {
        self.layer.as_ref().map(|l| l.order)
    }
}

/// A member as seen by one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberState {
    pub id: DeclId,
    pub name: String,
    pub kind: DeclKind,
    pub params: Vec<String>,
    pub modifiers: Modifiers,
    pub flags: DeclFlags,
    pub introduced_by: Option<OrderedAspectLayer>,
    pub replaced_by: Option<OrderedAspectLayer>,
    /// One chain per facet, in facet order.
    pub chains: Vec<(Facet, Vec<ChainElement>)>,
}

impl MemberState {
    fn from_spec(id: DeclId, spec: &MemberSpec, layer: Option<&OrderedAspectLayer>) -> Self {
        let chains = spec
            .kind
            .facets()
            .iter()
            .map(|facet| {
                let body = spec
                    .bodies
                    .iter()
                    .find(|(f, _)| f == facet)
                    .map(|(_, b)| b.clone())
                    .unwrap_or_default();
                (
                    *facet,
                    vec![ChainElement {
                        layer: layer.cloned(),
                        body,
                        flags: spec.flags,
                    }],
                )
            })
            .collect();
        Self {
            id,
            name: spec.name.clone(),
            kind: spec.kind,
            params: spec.params.clone(),
            modifiers: spec.modifiers,
            flags: spec.flags,
            introduced_by: layer.cloned(),
            replaced_by: None,
            chains,
        }
    }

    pub fn chain(&self, facet: Facet) -> Option<&[ChainElement]> {
        self.chains
            .iter()
            .find(|(f, _)| *f == facet)
            .map(|(_, c)| c.as_slice())
    }

    fn chain_mut(&mut self, facet: Facet) -> Option<&mut Vec<ChainElement>> {
        self.chains
            .iter_mut()
            .find(|(f, _)| *f == facet)
            .map(|(_, c)| c)
    }

    /// Parameters seen by the body of `facet`.
    pub fn facet_params(&self, facet: Facet) -> Vec<String> {
        match facet {
            Facet::Body => self.params.clone(),
            Facet::Get => Vec::new(),
            Facet::Set => vec!["value".to_string()],
            Facet::Add | Facet::Remove => vec!["handler".to_string()],
        }
    }

    /// Callable name of the public form of `facet` (`get_total`).
    pub fn callable(&self, facet: Facet) -> String {
        format!("{}{}", facet.prefix(), self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Placement {
    position: InsertPosition,
    order: u32,
    seq: u32,
}

/// Why one contribution was rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub code: DiagnosticCode,
    pub message: String,
}

impl Conflict {
    fn new(code: DiagnosticCode, message: String) -> Self {
        Self { code, message }
    }
}

/// The transformations one aspect instance produced in one layer.
#[derive(Debug, Clone)]
pub struct Contribution {
    pub instance_target: DeclId,
    pub transformations: Vec<Transformation>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FoldOutcome {
    /// Count of transformations folded in.
    Accepted(usize),
    Rejected(Conflict),
    /// Discarded because the whole layer was aborted.
    Aborted,
}

/// Result of folding one layer into a snapshot.
#[derive(Debug, Clone)]
pub struct LayerFold {
    pub snapshot: UnitSnapshot,
    /// One outcome per contribution, in input order.
    pub outcomes: Vec<FoldOutcome>,
    /// Set when an anchor vanished; the snapshot is then unchanged.
    pub fatal: Option<Conflict>,
}

/// Immutable view of one unit (top-level type) at some point in the order.
#[derive(Debug, Clone)]
pub struct UnitSnapshot {
    pub unit: DeclId,
    pub name: String,
    pub interfaces: Vec<String>,
    members: IndexMap<DeclId, Arc<MemberState>>,
    /// Source members in source order; introduced ones are laid out around them.
    source_order: Vec<DeclId>,
    placements: FxHashMap<DeclId, Placement>,
    applied: Vec<AppliedTransformation>,
    next_seq: u32,
}

impl UnitSnapshot {
    pub fn from_program(program: &Program, unit: DeclId) -> Option<Self> {
        let ty = program.get(unit)?;
        if ty.kind != DeclKind::Type {
            return None;
        }
        let members: Vec<MemberState> = program
            .members_of(unit)
            .map(|decl| MemberState::from_spec(decl.id, &MemberSpec::from_declaration(decl), None))
            .collect();
        Some(Self::from_members(unit, &ty.name, ty.interfaces.clone(), members))
    }

    /// A snapshot whose members are all source members, in the given order.
    pub fn from_members(
        unit: DeclId,
        name: &str,
        interfaces: Vec<String>,
        members: Vec<MemberState>,
    ) -> Self {
        let source_order = members.iter().map(|m| m.id).collect();
        Self {
            unit,
            name: name.to_string(),
            interfaces,
            members: members.into_iter().map(|m| (m.id, Arc::new(m))).collect(),
            source_order,
            placements: FxHashMap::default(),
            applied: Vec::new(),
            next_seq: 0,
        }
    }

    pub fn member(&self, id: DeclId) -> Option<&MemberState> {
        self.members.get(&id).map(|m| m.as_ref())
    }

    pub fn member_by_name(&self, name: &str) -> Option<&MemberState> {
        self.members
            .values()
            .find(|m| m.name == name)
            .map(|m| m.as_ref())
    }

    pub fn contains(&self, id: DeclId) -> bool {
        id == self.unit || self.members.contains_key(&id)
    }

    /// Members in insertion order (source first, then introductions).
    pub fn members(&self) -> impl Iterator<Item = &MemberState> {
        self.members.values().map(|m| m.as_ref())
    }

    pub fn applied(&self) -> &[AppliedTransformation] {
        &self.applied
    }

    /// Physical member order. Members inserted at the same anchor are
    /// ordered by layer order, then by emission sequence.
    pub fn layout(&self) -> Vec<DeclId> {
        let mut groups: FxHashMap<InsertPosition, Vec<(u32, u32, DeclId)>> = FxHashMap::default();
        for (id, p) in &self.placements {
            groups
                .entry(p.position)
                .or_default()
                .push((p.order, p.seq, *id));
        }
        for group in groups.values_mut() {
            group.sort();
        }

        let mut out = Vec::with_capacity(self.members.len());
        let emit_group = |pos: InsertPosition, out: &mut Vec<DeclId>| {
            if let Some(group) = groups.get(&pos) {
                for (_, _, id) in group {
                    self.layout_around(*id, &groups, out);
                }
            }
        };
        emit_group(InsertPosition::Start, &mut out);
        for id in &self.source_order {
            self.layout_around(*id, &groups, &mut out);
        }
        emit_group(InsertPosition::End, &mut out);
        out
    }

    fn layout_around(
        &self,
        id: DeclId,
        groups: &FxHashMap<InsertPosition, Vec<(u32, u32, DeclId)>>,
        out: &mut Vec<DeclId>,
    ) {
        if let Some(before) = groups.get(&InsertPosition::Before(id)) {
            for (_, _, b) in before {
                self.layout_around(*b, groups, out);
            }
        }
        out.push(id);
        if let Some(after) = groups.get(&InsertPosition::After(id)) {
            for (_, _, a) in after {
                self.layout_around(*a, groups, out);
            }
        }
    }

    /// Fold one layer's contributions. Each contribution is accepted or
    /// rejected as a whole; a vanished anchor aborts the entire layer.
    pub fn fold(&self, layer: &OrderedAspectLayer, contributions: Vec<Contribution>) -> LayerFold {
        let mut current = self.clone();
        let mut outcomes = Vec::with_capacity(contributions.len());

        for contribution in &contributions {
            let mut trial = current.clone();
            match trial.apply_contribution(layer, contribution) {
                Ok(count) => {
                    current = trial;
                    outcomes.push(FoldOutcome::Accepted(count));
                }
                Err(ApplyError::Conflict(conflict)) => {
                    outcomes.push(FoldOutcome::Rejected(conflict));
                }
                Err(ApplyError::Fatal(conflict)) => {
                    return LayerFold {
                        snapshot: self.clone(),
                        outcomes: vec![FoldOutcome::Aborted; contributions.len()],
                        fatal: Some(conflict),
                    };
                }
            }
        }

        LayerFold {
            snapshot: current,
            outcomes,
            fatal: None,
        }
    }

    fn apply_contribution(
        &mut self,
        layer: &OrderedAspectLayer,
        contribution: &Contribution,
    ) -> Result<usize, ApplyError> {
        let mut touched = Vec::new();
        let mut replaced = Vec::new();
        let mut count = 0;
        for t in &contribution.transformations {
            if let Transformation::Replace { target, .. } = t {
                if let Some(existing) = self.member(*target) {
                    replaced.push(existing.name.clone());
                }
            }
            if let Some(id) = self.apply(layer, t)? {
                touched.push(id);
            }
            if !matches!(t, Transformation::AddAspect { .. }) {
                self.applied.push(AppliedTransformation {
                    layer: layer.clone(),
                    instance_target: contribution.instance_target,
                    transformation: t.clone(),
                });
                count += 1;
            }
        }
        self.validate_references(&touched, &replaced, layer)
            .map_err(ApplyError::Conflict)?;
        Ok(count)
    }

    /// Apply one transformation; returns the member whose chains changed.
    fn apply(
        &mut self,
        layer: &OrderedAspectLayer,
        t: &Transformation,
    ) -> Result<Option<DeclId>, ApplyError> {
        match t {
            Transformation::Introduce {
                member,
                position,
                when_exists,
            } => self.introduce(layer, member, *position, *when_exists),
            Transformation::Override {
                target,
                facet,
                body,
                flags,
            } => {
                let element = ChainElement {
                    layer: Some(layer.clone()),
                    body: body.clone(),
                    flags: *flags,
                };
                self.append(*target, *facet, element)?;
                Ok(Some(*target))
            }
            Transformation::ImplementInterface {
                interface,
                members,
                when_exists,
            } => {
                if self.interfaces.iter().any(|i| i == interface) {
                    return Err(ApplyError::Conflict(Conflict::new(
                        DiagnosticCode::DuplicateInterface,
                        format!("type '{}' already implements '{}'", self.name, interface),
                    )));
                }
                self.interfaces.push(interface.clone());
                let mut last = None;
                for m in members {
                    if let Some(id) = self.introduce(layer, m, InsertPosition::End, *when_exists)? {
                        last = Some(id);
                        self.validate_references(&[id], &[], layer)
                            .map_err(ApplyError::Conflict)?;
                    }
                }
                Ok(last)
            }
            Transformation::Replace { target, member } => {
                let existing = self.member(*target).ok_or_else(|| {
                    ApplyError::Conflict(Conflict::new(
                        DiagnosticCode::MissingMember,
                        format!("cannot replace {}: not a member of '{}'", target, self.name),
                    ))
                })?;
                if member.name != existing.name && self.member_by_name(&member.name).is_some() {
                    return Err(ApplyError::Conflict(Conflict::new(
                        DiagnosticCode::ConflictingIntroduction,
                        format!(
                            "cannot replace '{}' with '{}': name already taken in '{}'",
                            existing.name, member.name, self.name
                        ),
                    )));
                }
                let mut state = MemberState::from_spec(*target, member, Some(layer));
                state.introduced_by = existing.introduced_by.clone();
                state.replaced_by = Some(layer.clone());
                self.members.insert(*target, Arc::new(state));
                Ok(Some(*target))
            }
            Transformation::AddAspect { target, .. } => {
                if !self.contains(*target) {
                    return Err(ApplyError::Conflict(Conflict::new(
                        DiagnosticCode::InvalidChildAspect,
                        format!("child aspect target {} is outside '{}'", target, self.name),
                    )));
                }
                Ok(None)
            }
        }
    }

    fn introduce(
        &mut self,
        layer: &OrderedAspectLayer,
        spec: &MemberSpec,
        position: InsertPosition,
        when_exists: WhenExists,
    ) -> Result<Option<DeclId>, ApplyError> {
        if let Some(anchor) = position.anchor() {
            if !self.members.contains_key(&anchor) {
                return Err(ApplyError::Fatal(Conflict::new(
                    DiagnosticCode::AnchorVanished,
                    format!(
                        "insertion anchor {} for '{}' no longer exists in '{}'",
                        anchor, spec.name, self.name
                    ),
                )));
            }
        }

        if let Some(existing) = self.member_by_name(&spec.name) {
            let existing_id = existing.id;
            return match when_exists {
                WhenExists::Fail => Err(ApplyError::Conflict(Conflict::new(
                    DiagnosticCode::ConflictingIntroduction,
                    format!(
                        "'{}' already declares a member named '{}'",
                        self.name, spec.name
                    ),
                ))),
                WhenExists::Ignore => Ok(None),
                WhenExists::Override => {
                    if !spec.is_compatible(existing.kind, &existing.params) {
                        return Err(ApplyError::Conflict(Conflict::new(
                            DiagnosticCode::IncompatibleOverride,
                            format!(
                                "cannot override {} '{}' with an incompatible {}",
                                existing.kind, spec.name, spec.kind
                            ),
                        )));
                    }
                    for (facet, body) in &spec.bodies {
                        let element = ChainElement {
                            layer: Some(layer.clone()),
                            body: body.clone(),
                            flags: spec.flags,
                        };
                        self.append(existing_id, *facet, element)?;
                    }
                    Ok(Some(existing_id))
                }
            };
        }

        let owner = match self.unit {
            DeclId::Source(i) => i,
            DeclId::Introduced { owner, .. } => owner,
        };
        let id = DeclId::Introduced {
            owner,
            seq: self.next_seq,
        };
        self.placements.insert(
            id,
            Placement {
                position,
                order: layer.order,
                seq: self.next_seq,
            },
        );
        self.next_seq += 1;
        self.members
            .insert(id, Arc::new(MemberState::from_spec(id, spec, Some(layer))));
        Ok(Some(id))
    }

    fn append(&mut self, target: DeclId, facet: Facet, element: ChainElement) -> Result<(), ApplyError> {
        let unit_name = self.name.clone();
        let slot = self.members.get_mut(&target).ok_or_else(|| {
            ApplyError::Conflict(Conflict::new(
                DiagnosticCode::MissingMember,
                format!("cannot override {}: not a member of '{}'", target, unit_name),
            ))
        })?;
        let member = Arc::make_mut(slot);
        let kind = member.kind;
        let name = member.name.clone();
        let chain = member.chain_mut(facet).ok_or_else(|| {
            ApplyError::Conflict(Conflict::new(
                DiagnosticCode::IncompatibleOverride,
                format!("{} '{}' has no '{}' to override", kind, name, facet),
            ))
        })?;
        chain.push(element);
        Ok(())
    }

    /// Every reference this layer added to a member in `touched` must point
    /// at an element that exists at this point of the order. References into
    /// a member in `replaced` are rechecked wherever they live, since the
    /// replacement dropped the elements they resolved to.
    fn validate_references(
        &self,
        touched: &[DeclId],
        replaced: &[String],
        layer: &OrderedAspectLayer,
    ) -> Result<(), Conflict> {
        for member in self.members.values() {
            let own = touched.contains(&member.id);
            for (facet, chain) in &member.chains {
                for (index, element) in chain.iter().enumerate() {
                    let fresh = own && element.layer.as_ref() == Some(layer);
                    for r in element.body.references() {
                        let into_replaced = r
                            .member
                            .as_ref()
                            .is_some_and(|name| replaced.contains(name));
                        if fresh {
                            self.check_reference(member, *facet, index, r)?;
                        } else if into_replaced {
                            self.check_reference(member, *facet, index, r)
                                .map_err(|c| Conflict::new(
                                    DiagnosticCode::IncompatibleOverride,
                                    format!("replacement breaks an earlier reference: {}", c.message),
                                ))?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn check_reference(
        &self,
        owner: &MemberState,
        facet: Facet,
        index: usize,
        r: &AspectReference,
    ) -> Result<(), Conflict> {
        let unresolved = |why: String| {
            Conflict::new(
                DiagnosticCode::UnresolvedReference,
                format!(
                    "reference {{{{{}}}}} in '{}.{}' {}",
                    r.direction, self.name, owner.name, why
                ),
            )
        };
        let target = match r.member {
            Some(ref name) => self
                .member_by_name(name)
                .ok_or_else(|| unresolved(format!("names unknown member '{}'", name)))?,
            None => owner,
        };
        let target_facet = r.facet.unwrap_or(if r.member.is_none() { facet } else { Facet::Body });
        let chain = target
            .chain(target_facet)
            .ok_or_else(|| unresolved(format!("targets missing facet '{}'", target_facet)))?;
        let expected = target.facet_params(target_facet).len();
        if r.args.len() != expected {
            return Err(unresolved(format!(
                "passes {} argument(s), '{}' expects {}",
                r.args.len(),
                target_facet,
                expected
            )));
        }

        let same_chain = target.id == owner.id && target_facet == facet;
        let key = owner
            .chain(facet)
            .and_then(|c| c.get(index))
            .and_then(ChainElement::order_key);
        let exists = match r.direction {
            Direction::Original | Direction::Final => !chain.is_empty(),
            Direction::Base if same_chain => index > 0,
            Direction::Current if same_chain => true,
            Direction::Base => chain.iter().any(|e| e.order_key() < key),
            Direction::Current => chain.iter().any(|e| e.order_key() <= key),
        };
        if exists {
            Ok(())
        } else {
            Err(unresolved("has no target element at this point of the order".to_string()))
        }
    }
}

enum ApplyError {
    Conflict(Conflict),
    Fatal(Conflict),
}
