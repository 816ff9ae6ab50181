//! WF-007: Aspect instances, aggregation, and instance collection.
//!
//! Instances come from attributes, exclusion attributes, programmatic rules,
//! child-aspect requests, and inheritance. Instances of one class on one
//! declaration are aggregated into a single value with a deterministic
//! primary.

use super::error::WeaveError;
use super::registry::{AspectRegistry, ClassId};
use crate::model::{DeclId, DeclKind, Program};
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::fmt;

/// Provenance of an instance; the derived order is the aggregation priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceSource {
    Inherited,
    Exclusion,
    FromAttribute,
    Implicit,
    Aggregate,
}

impl fmt::Display for InstanceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Inherited => "inherited",
            Self::Exclusion => "exclusion",
            Self::FromAttribute => "attribute",
            Self::Implicit => "implicit",
            Self::Aggregate => "aggregate",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AspectInstance {
    pub class: ClassId,
    pub target: DeclId,
    pub source: InstanceSource,
    /// Declaration the instance was inherited from.
    pub origin: Option<DeclId>,
    skipped: bool,
}

impl AspectInstance {
    pub fn new(class: ClassId, target: DeclId, source: InstanceSource) -> Self {
        Self {
            class,
            target,
            source,
            origin: None,
            skipped: false,
        }
    }

    pub fn inherited(class: ClassId, target: DeclId, origin: DeclId) -> Self {
        Self {
            origin: Some(origin),
            ..Self::new(class, target, InstanceSource::Inherited)
        }
    }

    pub fn skip(&mut self) {
        self.skipped = true;
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped
    }
}

/// Several instances of one class on one declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateAspectInstance {
    primary: AspectInstance,
    other_instances: Vec<AspectInstance>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aggregated {
    Single(AspectInstance),
    Aggregate(AggregateAspectInstance),
}

impl Aggregated {
    pub fn primary(&self) -> &AspectInstance {
        match self {
            Self::Single(i) => i,
            Self::Aggregate(a) => &a.primary,
        }
    }

    pub fn other_instances(&self) -> &[AspectInstance] {
        match self {
            Self::Single(_) => &[],
            Self::Aggregate(a) => &a.other_instances,
        }
    }

    pub fn class(&self) -> ClassId {
        self.primary().class
    }

    pub fn target(&self) -> DeclId {
        self.primary().target
    }

    /// `Aggregate` for wrapped instances, else the single instance's source.
    pub fn source(&self) -> InstanceSource {
        match self {
            Self::Single(i) => i.source,
            Self::Aggregate(_) => InstanceSource::Aggregate,
        }
    }

    /// Skips the primary only; other instances keep their state.
    pub fn skip(&mut self) {
        match self {
            Self::Single(i) => i.skip(),
            Self::Aggregate(a) => a.primary.skip(),
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.primary().is_skipped()
    }

    pub fn instances(&self) -> impl Iterator<Item = &AspectInstance> {
        std::iter::once(self.primary()).chain(self.other_instances().iter())
    }

    pub fn has_exclusion(&self) -> bool {
        self.instances().any(|i| i.source == InstanceSource::Exclusion)
    }

    /// True when every instance came from inheritance.
    pub fn is_inherited(&self) -> bool {
        self.instances().all(|i| i.source == InstanceSource::Inherited)
    }

    /// Fold another instance of the same class and target into this value.
    pub fn absorb(self, instance: AspectInstance) -> Result<Aggregated, WeaveError> {
        let mut all: Vec<AspectInstance> = match self {
            Self::Single(i) => vec![i],
            Self::Aggregate(a) => std::iter::once(a.primary).chain(a.other_instances).collect(),
        };
        all.push(instance);
        aggregate(all)
    }
}

/// Aggregate instances sharing one class and target. A single instance is
/// returned unchanged; otherwise the stable ascending sort by source picks
/// the primary.
pub fn aggregate(mut instances: Vec<AspectInstance>) -> Result<Aggregated, WeaveError> {
    let first = instances
        .first()
        .ok_or_else(|| WeaveError::internal("aggregate of zero aspect instances"))?;
    let (class, target) = (first.class, first.target);
    if instances.iter().any(|i| i.class != class || i.target != target) {
        return Err(WeaveError::internal(
            "aggregated instances disagree on class or target",
        ));
    }
    if instances.len() == 1 {
        return Ok(Aggregated::Single(instances.remove(0)));
    }
    instances.sort_by_key(|i| i.source);
    let primary = instances.remove(0);
    Ok(Aggregated::Aggregate(AggregateAspectInstance {
        primary,
        other_instances: instances,
    }))
}

/// Project-level rule adding implicit instances by kind and name.
#[derive(Debug, Clone)]
pub struct InstanceRule {
    pub aspect: String,
    pub kinds: Vec<DeclKind>,
    /// Matched against the containing type's name.
    pub types: Option<Regex>,
    /// Matched against the member's name (or the type's, for type targets).
    pub members: Option<Regex>,
}

impl InstanceRule {
    fn matches(&self, program: &Program, id: DeclId) -> bool {
        let Some(decl) = program.get(id) else {
            return false;
        };
        if !self.kinds.is_empty() && !self.kinds.contains(&decl.kind) {
            return false;
        }
        let type_name = program
            .unit_of(id)
            .and_then(|u| program.get(u))
            .map(|t| t.name.as_str())
            .unwrap_or_default();
        self.types.as_ref().map_or(true, |re| re.is_match(type_name))
            && self.members.as_ref().map_or(true, |re| re.is_match(&decl.name))
    }
}

/// Source of inherited instances.
pub trait InheritanceProvider {
    /// Instances that propagate from `direct` to derived declarations.
    fn list_inherited_instances(
        &self,
        registry: &AspectRegistry,
        direct: &[AspectInstance],
    ) -> Vec<AspectInstance>;
}

/// Inheritance through the program's derived-of and overrides relations.
pub struct ProgramInheritance<'a> {
    program: &'a Program,
}

impl<'a> ProgramInheritance<'a> {
    pub fn new(program: &'a Program) -> Self {
        Self { program }
    }

    fn descendants(&self, id: DeclId) -> Vec<DeclId> {
        let Some(decl) = self.program.get(id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut seen = FxHashSet::default();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let next = match decl.kind {
                DeclKind::Type => self.program.derived_of(current),
                _ => self.program.overridden_by(current),
            };
            for n in next.into_iter().rev() {
                if seen.insert(n) {
                    out.push(n);
                    stack.push(n);
                }
            }
        }
        out.sort();
        out
    }
}

impl InheritanceProvider for ProgramInheritance<'_> {
    fn list_inherited_instances(
        &self,
        registry: &AspectRegistry,
        direct: &[AspectInstance],
    ) -> Vec<AspectInstance> {
        let mut out = Vec::new();
        let mut seen = FxHashSet::default();
        for instance in direct {
            if instance.source == InstanceSource::Exclusion
                || !registry.get(instance.class).inheritable
            {
                continue;
            }
            for target in self.descendants(instance.target) {
                if seen.insert((instance.class, target)) {
                    out.push(AspectInstance::inherited(instance.class, target, instance.target));
                }
            }
        }
        out
    }
}

/// Every instance of the run, in deterministic collection order.
#[derive(Debug, Clone, Default)]
pub struct InstanceSet {
    instances: Vec<AspectInstance>,
}

impl InstanceSet {
    /// Collect from attributes and exclusions (arena order, source order),
    /// then rules, then inheritance.
    pub fn collect(
        program: &Program,
        registry: &AspectRegistry,
        rules: &[InstanceRule],
        inheritance: &dyn InheritanceProvider,
    ) -> Self {
        let mut instances = Vec::new();
        for decl in program.declarations() {
            for attr in &decl.attributes {
                match registry.id_of(attr) {
                    Some(class) => {
                        instances.push(AspectInstance::new(class, decl.id, InstanceSource::FromAttribute))
                    }
                    None => tracing::trace!(attribute = %attr, "not an aspect attribute"),
                }
            }
            for excluded in &decl.exclusions {
                if let Some(class) = registry.id_of(excluded) {
                    instances.push(AspectInstance::new(class, decl.id, InstanceSource::Exclusion));
                }
            }
        }
        for rule in rules {
            let Some(class) = registry.id_of(&rule.aspect) else {
                continue;
            };
            for decl in program.declarations() {
                if rule.matches(program, decl.id) {
                    instances.push(AspectInstance::new(class, decl.id, InstanceSource::Implicit));
                }
            }
        }
        let inherited = inheritance.list_inherited_instances(registry, &instances);
        instances.extend(inherited);
        tracing::debug!(instances = instances.len(), "aspect instances collected");
        Self { instances }
    }

    pub fn from_instances(instances: Vec<AspectInstance>) -> Self {
        Self { instances }
    }

    pub fn push(&mut self, instance: AspectInstance) {
        self.instances.push(instance);
    }

    pub fn instances(&self) -> &[AspectInstance] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Aggregate per (class, target), in order of first appearance.
    pub fn aggregated(&self) -> Result<Vec<Aggregated>, WeaveError> {
        let mut groups: Vec<Vec<AspectInstance>> = Vec::new();
        let mut index: FxHashMap<(ClassId, DeclId), usize> = FxHashMap::default();
        for instance in &self.instances {
            let key = (instance.class, instance.target);
            match index.get(&key) {
                Some(&i) => groups[i].push(instance.clone()),
                None => {
                    index.insert(key, groups.len());
                    groups.push(vec![instance.clone()]);
                }
            }
        }
        groups.into_iter().map(aggregate).collect()
    }

    /// First-seen key per class: the smallest arena position of a
    /// declaration requiring it. Exclusions do not require a class.
    pub fn first_seen(&self, program: &Program) -> FxHashMap<ClassId, u32> {
        let mut keys: FxHashMap<ClassId, u32> = FxHashMap::default();
        for instance in &self.instances {
            if instance.source == InstanceSource::Exclusion {
                continue;
            }
            let pos = program.position(instance.target);
            keys.entry(instance.class)
                .and_modify(|k| *k = (*k).min(pos))
                .or_insert(pos);
        }
        keys
    }
}

/// Excluded: the aggregate holds an exclusion, or the containing type
/// excludes the class.
pub fn is_excluded(agg: &Aggregated, program: &Program, registry: &AspectRegistry) -> bool {
    if agg.has_exclusion() {
        return true;
    }
    let name = &registry.get(agg.class()).name;
    let owner = match program.get(agg.target()) {
        Some(decl) => decl.parent,
        None => match agg.target() {
            DeclId::Introduced { owner, .. } => Some(DeclId::Source(owner)),
            DeclId::Source(_) => None,
        },
    };
    owner
        .and_then(|o| program.get(o))
        .map_or(false, |ty| ty.exclusions.iter().any(|e| e == name))
}
