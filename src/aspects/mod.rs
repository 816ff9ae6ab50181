//! WF-011: The aspect capability interface.
//!
//! An aspect class implements [`Aspect`] once. `build_eligibility` is called
//! a single time when the class is registered; `build_aspect` is called once
//! per instance and layer, against the snapshot produced by every earlier
//! layer, and returns an [`AspectOutcome`].

pub mod template;

use crate::core::aggregate::InstanceSource;
use crate::core::eligibility::EligibilityBuilder;
use crate::core::registry::OrderedAspectLayer;
use crate::model::snapshot::{MemberState, UnitSnapshot};
use crate::model::transform::Transformation;
use crate::model::{DeclId, Program};

pub use template::TemplateAspect;

/// Result of running one layer of one aspect instance.
#[derive(Debug, Clone, PartialEq)]
pub enum AspectOutcome {
    Success(Vec<Transformation>),
    /// The aspect declined to apply; later layers of the instance are skipped.
    Skipped,
    Failed(String),
}

/// What aspect code may read while building advice.
#[derive(Debug, Clone, Copy)]
pub struct AdviceContext<'a> {
    pub program: &'a Program,
    pub snapshot: &'a UnitSnapshot,
    pub layer: &'a OrderedAspectLayer,
    pub target: DeclId,
    pub source: InstanceSource,
    /// Count of instances aggregated behind the primary.
    pub other_instances: usize,
}

impl<'a> AdviceContext<'a> {
    /// `None` for the primary layer.
    pub fn layer_name(&self) -> Option<&'a str> {
        self.layer.layer_name()
    }

    /// The target as a member of the current snapshot; `None` for the type itself.
    pub fn target_member(&self) -> Option<&'a MemberState> {
        self.snapshot.member(self.target)
    }

    pub fn is_type_target(&self) -> bool {
        self.target == self.snapshot.unit
    }

    pub fn target_name(&self) -> &'a str {
        match self.target_member() {
            Some(m) => &m.name,
            None => &self.snapshot.name,
        }
    }
}

pub trait Aspect: Send + Sync {
    /// Declare per-kind eligibility rules. No rules means eligible everywhere.
    fn build_eligibility(&self, _builder: &mut EligibilityBuilder) {}

    fn build_aspect(&self, ctx: &AdviceContext<'_>) -> AspectOutcome;
}

type AdviceFn = dyn Fn(&AdviceContext<'_>) -> AspectOutcome + Send + Sync;
type EligibilityFn = dyn Fn(&mut EligibilityBuilder) + Send + Sync;

/// An aspect assembled from closures, for programmatic registration.
pub struct FnAspect {
    advice: Box<AdviceFn>,
    eligibility: Option<Box<EligibilityFn>>,
}

impl FnAspect {
    pub fn new(advice: impl Fn(&AdviceContext<'_>) -> AspectOutcome + Send + Sync + 'static) -> Self {
        Self {
            advice: Box::new(advice),
            eligibility: None,
        }
    }

    /// Succeeds with no transformations.
    pub fn noop() -> Self {
        Self::new(|_| AspectOutcome::Success(Vec::new()))
    }

    pub fn with_eligibility(
        mut self,
        f: impl Fn(&mut EligibilityBuilder) + Send + Sync + 'static,
    ) -> Self {
        self.eligibility = Some(Box::new(f));
        self
    }
}

impl Aspect for FnAspect {
    fn build_eligibility(&self, builder: &mut EligibilityBuilder) {
        if let Some(ref f) = self.eligibility {
            f(builder);
        }
    }

    fn build_aspect(&self, ctx: &AdviceContext<'_>) -> AspectOutcome {
        (self.advice)(ctx)
    }
}
