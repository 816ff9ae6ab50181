//! WF-010: Transformations — the mutations a layer contributes.
//!
//! A transformation targets declarations by stable [`DeclId`] and places new
//! members relative to an anchor, never at an absolute index.

use super::syntax::{Body, Facet};
use super::{DeclFlags, DeclId, DeclKind, Declaration, Modifiers};
use crate::core::registry::OrderedAspectLayer;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where an introduced member goes, relative to a stable anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InsertPosition {
    Start,
    End,
    Before(DeclId),
    After(DeclId),
}

impl InsertPosition {
    pub fn anchor(&self) -> Option<DeclId> {
        match self {
            Self::Before(id) | Self::After(id) => Some(*id),
            Self::Start | Self::End => None,
        }
    }
}

/// Policy when an introduced member's name is already taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhenExists {
    #[default]
    Fail,
    Ignore,
    /// Turn a compatible duplicate into an override of the existing member.
    Override,
}

/// Shape of a member an aspect introduces or substitutes.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberSpec {
    pub name: String,
    pub kind: DeclKind,
    pub params: Vec<String>,
    pub modifiers: Modifiers,
    pub flags: DeclFlags,
    pub bodies: Vec<(Facet, Body)>,
}

impl MemberSpec {
    pub fn method(name: &str, params: &[&str], body: Body) -> Self {
        Self {
            name: name.to_string(),
            kind: DeclKind::Method,
            params: params.iter().map(|p| p.to_string()).collect(),
            modifiers: Modifiers::PUBLIC,
            flags: DeclFlags::empty(),
            bodies: vec![(Facet::Body, body)],
        }
    }

    pub fn field(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: DeclKind::Field,
            params: Vec::new(),
            modifiers: Modifiers::PUBLIC,
            flags: DeclFlags::empty(),
            bodies: Vec::new(),
        }
    }

    pub fn from_declaration(decl: &Declaration) -> Self {
        Self {
            name: decl.name.clone(),
            kind: decl.kind,
            params: decl.params.clone(),
            modifiers: decl.modifiers,
            flags: decl.flags,
            bodies: decl.bodies.clone(),
        }
    }

    /// Same kind and arity: an existing member of this shape can be overridden.
    pub fn is_compatible(&self, kind: DeclKind, params: &[String]) -> bool {
        self.kind == kind && self.params.len() == params.len()
    }
}

/// One concrete mutation contributed by a layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Transformation {
    Introduce {
        member: MemberSpec,
        position: InsertPosition,
        when_exists: WhenExists,
    },
    Override {
        target: DeclId,
        facet: Facet,
        body: Body,
        flags: DeclFlags,
    },
    ImplementInterface {
        interface: String,
        members: Vec<MemberSpec>,
        when_exists: WhenExists,
    },
    Replace {
        target: DeclId,
        member: MemberSpec,
    },
    /// Request an implicit instance of another aspect on `target`.
    AddAspect { aspect: String, target: DeclId },
}

impl Transformation {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Introduce { .. } => "introduce",
            Self::Override { .. } => "override",
            Self::ImplementInterface { .. } => "implement",
            Self::Replace { .. } => "replace",
            Self::AddAspect { .. } => "add_aspect",
        }
    }
}

impl fmt::Display for Transformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Introduce { member, .. } => write!(f, "introduce {} {}", member.kind, member.name),
            Self::Override { target, facet, .. } => write!(f, "override {} ({})", target, facet),
            Self::ImplementInterface { interface, .. } => write!(f, "implement {}", interface),
            Self::Replace { target, member } => {
                write!(f, "replace {} with {} {}", target, member.kind, member.name)
            }
            Self::AddAspect { aspect, target } => write!(f, "add aspect {} to {}", aspect, target),
        }
    }
}

/// A transformation folded into the model, tagged with its provenance.
#[derive(Debug, Clone)]
pub struct AppliedTransformation {
    pub layer: OrderedAspectLayer,
    /// Target of the aspect instance that produced it.
    pub instance_target: DeclId,
    pub transformation: Transformation,
}
