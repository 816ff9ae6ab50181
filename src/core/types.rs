//! WF-001: Project file schema, lock file, and provenance event types.
//!
//! Defines the YAML schema of `weft.yaml` (types, aspects, rules, policy),
//! the `weft.lock.yaml` lock, and the JSONL weave events. All types derive
//! Serialize/Deserialize for YAML roundtripping.

use crate::model::syntax::Facet;
use crate::model::transform::WhenExists;
use crate::model::DeclKind;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Top-level weft.yaml
// ============================================================================

/// Root configuration — a program and the aspects woven into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Project name
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Source types, in declaration order
    #[serde(default)]
    pub types: IndexMap<String, TypeSpec>,

    /// Aspect classes, in registration order
    #[serde(default)]
    pub aspects: IndexMap<String, AspectSpec>,

    /// Implicit instance rules
    #[serde(default)]
    pub rules: Vec<RuleSpec>,

    #[serde(default)]
    pub policy: Policy,
}

// ============================================================================
// Program
// ============================================================================

/// A top-level type of the source program.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeSpec {
    /// Base type name
    #[serde(default)]
    pub base: Option<String>,

    /// Aspect attributes on the type
    #[serde(default)]
    pub attributes: Vec<String>,

    /// Aspects excluded from the type and its members
    #[serde(default)]
    pub excludes: Vec<String>,

    #[serde(default)]
    pub interfaces: Vec<String>,

    #[serde(default)]
    pub members: IndexMap<String, MemberDecl>,
}

/// A member declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberDecl {
    #[serde(default = "default_kind")]
    pub kind: DeclKind,

    #[serde(default)]
    pub params: Vec<String>,

    #[serde(default, rename = "static")]
    pub is_static: bool,

    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,

    #[serde(default = "default_true")]
    pub public: bool,

    /// Overridden member as `Type.member`
    #[serde(default)]
    pub overrides: Option<String>,

    #[serde(default)]
    pub attributes: Vec<String>,

    #[serde(default)]
    pub excludes: Vec<String>,

    #[serde(default)]
    pub not_inlineable: bool,

    #[serde(default)]
    pub not_discardable: bool,

    // -- Facet bodies, in body syntax --
    #[serde(default)]
    pub body: Option<String>,

    #[serde(default)]
    pub get: Option<String>,

    #[serde(default)]
    pub set: Option<String>,

    #[serde(default)]
    pub add: Option<String>,

    #[serde(default)]
    pub remove: Option<String>,
}

impl Default for MemberDecl {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            params: Vec::new(),
            is_static: false,
            is_abstract: false,
            public: true,
            overrides: None,
            attributes: Vec::new(),
            excludes: Vec::new(),
            not_inlineable: false,
            not_discardable: false,
            body: None,
            get: None,
            set: None,
            add: None,
            remove: None,
        }
    }
}

impl MemberDecl {
    /// Bodies given for each facet, in facet order.
    pub fn facet_sources(&self) -> Vec<(Facet, &str)> {
        [
            (Facet::Body, &self.body),
            (Facet::Get, &self.get),
            (Facet::Set, &self.set),
            (Facet::Add, &self.add),
            (Facet::Remove, &self.remove),
        ]
        .into_iter()
        .filter_map(|(f, src)| src.as_deref().map(|s| (f, s)))
        .collect()
    }
}

fn default_kind() -> DeclKind {
    DeclKind::Method
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Aspects
// ============================================================================

/// An aspect class declared in the project file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AspectSpec {
    /// Named layers after the primary one
    #[serde(default)]
    pub layers: Vec<String>,

    /// Instances propagate to derived types and overriding members
    #[serde(default)]
    pub inheritable: bool,

    /// Base aspect class; its ordering relationships apply to this class
    #[serde(default)]
    pub extends: Option<String>,

    /// Selectors this aspect's layers run before (`Aspect`, `Aspect:layer`)
    #[serde(default)]
    pub run_before: Vec<String>,

    #[serde(default)]
    pub run_after: Vec<String>,

    /// Per-kind eligibility rules; empty means eligible everywhere
    #[serde(default)]
    pub eligibility: Vec<EligibilitySpec>,

    /// Only apply when the target's name matches
    #[serde(default)]
    pub skip_unless: Option<String>,

    #[serde(default)]
    pub advice: Vec<AdviceSpec>,
}

/// Scenario names in eligibility rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioName {
    Default,
    Inheritance,
}

/// One eligibility rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EligibilitySpec {
    pub kind: DeclKind,

    #[serde(default = "default_scenarios")]
    pub scenarios: Vec<ScenarioName>,

    #[serde(default)]
    pub not_static: bool,

    #[serde(default, rename = "static")]
    pub is_static: bool,

    #[serde(default)]
    pub not_abstract: bool,

    #[serde(default)]
    pub public: bool,

    #[serde(default)]
    pub min_params: Option<usize>,

    #[serde(default)]
    pub name_matches: Option<String>,
}

fn default_scenarios() -> Vec<ScenarioName> {
    vec![ScenarioName::Default, ScenarioName::Inheritance]
}

/// Advice kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdviceKind {
    Override,
    Introduce,
    Implement,
    Replace,
    AddAspect,
    /// Report an aspect failure (diagnostic testing)
    Fail,
}

impl fmt::Display for AdviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Override => write!(f, "override"),
            Self::Introduce => write!(f, "introduce"),
            Self::Implement => write!(f, "implement"),
            Self::Replace => write!(f, "replace"),
            Self::AddAspect => write!(f, "add_aspect"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// One advice of an aspect, run by the layer it names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdviceSpec {
    pub kind: AdviceKind,

    /// Layer that contributes this advice; primary when absent
    #[serde(default)]
    pub layer: Option<String>,

    /// Facet to override; every facet of the target when absent
    #[serde(default)]
    pub facet: Option<Facet>,

    /// Body template (`$member`, `$args` are expanded)
    #[serde(default)]
    pub body: Option<String>,

    /// For type targets: members whose name matches are advised
    #[serde(default)]
    pub members: Option<String>,

    #[serde(default)]
    pub not_inlineable: bool,

    #[serde(default)]
    pub not_discardable: bool,

    // -- introduce / replace --
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub member_kind: Option<DeclKind>,

    #[serde(default)]
    pub params: Vec<String>,

    /// `start`, `end`, `before:<member>`, `after:<member>`
    #[serde(default)]
    pub position: Option<String>,

    #[serde(default)]
    pub when_exists: WhenExists,

    // -- implement --
    #[serde(default)]
    pub interface: Option<String>,

    #[serde(default)]
    pub provides: Vec<ProvidedMember>,

    // -- add_aspect --
    #[serde(default)]
    pub aspect: Option<String>,

    // -- fail --
    #[serde(default)]
    pub message: Option<String>,
}

/// A member supplied by an `implement` advice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidedMember {
    pub name: String,

    #[serde(default = "default_kind")]
    pub kind: DeclKind,

    #[serde(default)]
    pub params: Vec<String>,

    #[serde(default)]
    pub body: Option<String>,
}

/// Project-level rule adding implicit instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub aspect: String,

    /// Declaration kinds; all when empty
    #[serde(default)]
    pub kinds: Vec<DeclKind>,

    /// Regex over the containing type's name
    #[serde(default)]
    pub types: Option<String>,

    /// Regex over the declaration's name
    #[serde(default)]
    pub members: Option<String>,
}

// ============================================================================
// Policy
// ============================================================================

/// Weave policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Process units concurrently
    #[serde(default = "default_true")]
    pub parallel: bool,

    /// Honour `|inline` references
    #[serde(default = "default_true")]
    pub inlining: bool,

    /// Contain panics raised by aspect code
    #[serde(default = "default_true")]
    pub guarded: bool,

    /// Per-call budget for aspect code; 0 disables the check
    #[serde(default)]
    pub invoke_budget_ms: u64,

    /// Append weave events to this JSONL file
    #[serde(default)]
    pub event_log: Option<String>,

    /// Persist fingerprints to the lock file after a weave
    #[serde(default = "default_true")]
    pub lock_file: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            parallel: true,
            inlining: true,
            guarded: true,
            invoke_budget_ms: 0,
            event_log: None,
            lock_file: true,
        }
    }
}

// ============================================================================
// Lock file
// ============================================================================

/// Fingerprints of one weave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeaveLock {
    pub schema: String,

    pub project: String,

    pub generated_at: String,

    pub generator: String,

    pub blake3_version: String,

    /// Resolved layer order (`Aspect[:layer]`)
    pub layer_order: Vec<String>,

    /// Per-unit fingerprints, in unit order
    pub units: IndexMap<String, UnitLock>,
}

/// Per-unit lock entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitLock {
    /// BLAKE3 hash of the linked unit's rendering
    pub hash: String,

    pub members: usize,

    pub synthetic: usize,

    /// Transformations folded into the unit
    pub transformations: usize,

    pub status: UnitStatus,
}

/// Weave status of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// At least one transformation applied
    Woven,
    /// No aspect touched the unit
    Untouched,
    /// Diagnostics were reported against the unit
    Diagnosed,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Woven => write!(f, "WOVEN"),
            Self::Untouched => write!(f, "UNTOUCHED"),
            Self::Diagnosed => write!(f, "DIAGNOSED"),
        }
    }
}

// ============================================================================
// Provenance events
// ============================================================================

/// Weave event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WeaveEvent {
    WeaveStarted {
        project: String,
        run_id: String,
        weft_version: String,
    },
    LayerApplied {
        unit: String,
        layer: String,
        transformations: usize,
    },
    InstanceSkipped {
        unit: String,
        aspect: String,
        target: String,
        reason: String,
    },
    InstanceFailed {
        unit: String,
        aspect: String,
        target: String,
        error: String,
    },
    WeaveCompleted {
        project: String,
        run_id: String,
        units: usize,
        layers: usize,
        diagnostics: usize,
        total_seconds: f64,
    },
    DriftDetected {
        unit: String,
        expected_hash: String,
        actual_hash: String,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: WeaveEvent,
}

// ============================================================================
// Tests
// ============================================================================
