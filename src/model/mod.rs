//! WF-009: Structural program model — an arena of declarations.
//!
//! Declarations are keyed by a stable [`DeclId`]. Relations between types and
//! their bases, and between members and the members they override, are index
//! pairs rather than owning references.

pub mod snapshot;
pub mod syntax;
pub mod transform;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use syntax::{Body, Facet};

/// Stable declaration identity, comparable across snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeclId {
    /// A declaration of the source program (arena index).
    Source(u32),
    /// A member introduced by an aspect into the type `owner`.
    Introduced { owner: u32, seq: u32 },
}

impl fmt::Display for DeclId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source(i) => write!(f, "#{}", i),
            Self::Introduced { owner, seq } => write!(f, "#{}+{}", owner, seq),
        }
    }
}

/// Declaration kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclKind {
    Type,
    Method,
    Property,
    Event,
    Field,
}

impl DeclKind {
    /// Facets a member of this kind may expose.
    pub fn facets(self) -> &'static [Facet] {
        match self {
            Self::Method => &[Facet::Body],
            Self::Property => &[Facet::Get, Facet::Set],
            Self::Event => &[Facet::Add, Facet::Remove],
            Self::Type | Self::Field => &[],
        }
    }
}

impl fmt::Display for DeclKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type => write!(f, "type"),
            Self::Method => write!(f, "method"),
            Self::Property => write!(f, "property"),
            Self::Event => write!(f, "event"),
            Self::Field => write!(f, "field"),
        }
    }
}

bitflags! {
    /// Source modifiers relevant to eligibility.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Modifiers: u8 {
        const STATIC = 0b0001;
        const ABSTRACT = 0b0010;
        const PUBLIC = 0b0100;
    }
}

bitflags! {
    /// Linker flags carried by a declaration or a chain element.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeclFlags: u8 {
        /// Never substitute this element's body into a caller.
        const NOT_INLINEABLE = 0b0001;
        /// Never elide this element, even when nothing references it.
        const NOT_DISCARDABLE = 0b0010;
    }
}

/// A declaration in the arena.
#[derive(Debug, Clone)]
pub struct Declaration {
    pub id: DeclId,
    pub name: String,
    pub kind: DeclKind,
    /// Containing type for members; `None` for types.
    pub parent: Option<DeclId>,
    pub params: Vec<String>,
    pub modifiers: Modifiers,
    pub flags: DeclFlags,
    /// Attribute names in source order.
    pub attributes: Vec<String>,
    /// Aspect classes excluded from this declaration (and, for types, its members).
    pub exclusions: Vec<String>,
    /// Implemented interfaces (types only).
    pub interfaces: Vec<String>,
    /// Bodies per facet, in facet declaration order.
    pub bodies: Vec<(Facet, Body)>,
}

impl Declaration {
    pub fn body(&self, facet: Facet) -> Option<&Body> {
        self.bodies.iter().find(|(f, _)| *f == facet).map(|(_, b)| b)
    }

    pub fn is_static(&self) -> bool {
        self.modifiers.contains(Modifiers::STATIC)
    }
}

/// The read-only source program.
#[derive(Debug, Clone, Default)]
pub struct Program {
    decls: Vec<Declaration>,
    /// (derived type, base type)
    derived: Vec<(u32, u32)>,
    /// (overriding member, overridden member)
    overrides: Vec<(u32, u32)>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, mut decl: Declaration) -> DeclId {
        let id = DeclId::Source(self.decls.len() as u32);
        decl.id = id;
        self.decls.push(decl);
        id
    }

    /// Add a top-level type.
    pub fn add_type(&mut self, name: &str) -> DeclId {
        self.push(Declaration {
            id: DeclId::Source(0),
            name: name.to_string(),
            kind: DeclKind::Type,
            parent: None,
            params: Vec::new(),
            modifiers: Modifiers::PUBLIC,
            flags: DeclFlags::empty(),
            attributes: Vec::new(),
            exclusions: Vec::new(),
            interfaces: Vec::new(),
            bodies: Vec::new(),
        })
    }

    /// Add a member to a type. Returns `None` if `owner` is not a source type.
    pub fn add_member(&mut self, owner: DeclId, name: &str, kind: DeclKind) -> Option<DeclId> {
        match self.get(owner) {
            Some(d) if d.kind == DeclKind::Type => {}
            _ => return None,
        }
        Some(self.push(Declaration {
            id: DeclId::Source(0),
            name: name.to_string(),
            kind,
            parent: Some(owner),
            params: Vec::new(),
            modifiers: Modifiers::PUBLIC,
            flags: DeclFlags::empty(),
            attributes: Vec::new(),
            exclusions: Vec::new(),
            interfaces: Vec::new(),
            bodies: Vec::new(),
        }))
    }

    pub fn get(&self, id: DeclId) -> Option<&Declaration> {
        match id {
            DeclId::Source(i) => self.decls.get(i as usize),
            DeclId::Introduced { .. } => None,
        }
    }

    pub fn get_mut(&mut self, id: DeclId) -> Option<&mut Declaration> {
        match id {
            DeclId::Source(i) => self.decls.get_mut(i as usize),
            DeclId::Introduced { .. } => None,
        }
    }

    /// All declarations in arena order.
    pub fn declarations(&self) -> impl Iterator<Item = &Declaration> {
        self.decls.iter()
    }

    /// Top-level types in arena order.
    pub fn types(&self) -> impl Iterator<Item = &Declaration> {
        self.decls.iter().filter(|d| d.kind == DeclKind::Type)
    }

    pub fn members_of(&self, owner: DeclId) -> impl Iterator<Item = &Declaration> {
        self.decls.iter().filter(move |d| d.parent == Some(owner))
    }

    pub fn find_type(&self, name: &str) -> Option<&Declaration> {
        self.types().find(|d| d.name == name)
    }

    pub fn find_member(&self, owner: DeclId, name: &str) -> Option<&Declaration> {
        self.members_of(owner).find(|d| d.name == name)
    }

    /// The unit a declaration belongs to: itself for types, its parent otherwise.
    pub fn unit_of(&self, id: DeclId) -> Option<DeclId> {
        let decl = self.get(id)?;
        match decl.kind {
            DeclKind::Type => Some(id),
            _ => decl.parent,
        }
    }

    /// Arena position, used as a stable ordering key.
    pub fn position(&self, id: DeclId) -> u32 {
        match id {
            DeclId::Source(i) => i,
            DeclId::Introduced { owner, .. } => owner,
        }
    }

    pub fn set_base(&mut self, derived: DeclId, base: DeclId) {
        if let (DeclId::Source(d), DeclId::Source(b)) = (derived, base) {
            if !self.derived.contains(&(d, b)) {
                self.derived.push((d, b));
            }
        }
    }

    pub fn set_overrides(&mut self, member: DeclId, overridden: DeclId) {
        if let (DeclId::Source(m), DeclId::Source(o)) = (member, overridden) {
            if !self.overrides.contains(&(m, o)) {
                self.overrides.push((m, o));
            }
        }
    }

    pub fn base_of(&self, ty: DeclId) -> Option<DeclId> {
        self.derived
            .iter()
            .find(|(d, _)| DeclId::Source(*d) == ty)
            .map(|(_, b)| DeclId::Source(*b))
    }

    /// Direct subtypes of `ty`, in arena order.
    pub fn derived_of(&self, ty: DeclId) -> Vec<DeclId> {
        let mut out: Vec<DeclId> = self
            .derived
            .iter()
            .filter(|(_, b)| DeclId::Source(*b) == ty)
            .map(|(d, _)| DeclId::Source(*d))
            .collect();
        out.sort();
        out
    }

    /// Members that directly override `member`, in arena order.
    pub fn overridden_by(&self, member: DeclId) -> Vec<DeclId> {
        let mut out: Vec<DeclId> = self
            .overrides
            .iter()
            .filter(|(_, o)| DeclId::Source(*o) == member)
            .map(|(m, _)| DeclId::Source(*m))
            .collect();
        out.sort();
        out
    }

    /// Human-readable diagnostic location (`Type.member`).
    pub fn location(&self, id: DeclId) -> String {
        match self.get(id) {
            Some(decl) => match decl.parent.and_then(|p| self.get(p)) {
                Some(parent) => format!("{}.{}", parent.name, decl.name),
                None => decl.name.clone(),
            },
            None => id.to_string(),
        }
    }
}
