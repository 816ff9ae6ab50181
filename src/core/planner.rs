//! WF-004: Weave planning — decide, per aggregated instance, whether it runs.
//!
//! Exclusion and eligibility are settled here, before any aspect code builds
//! advice. Every top-level type becomes one unit, including types with no
//! instances, so the linker sees the whole program.

use super::aggregate::{is_excluded, Aggregated, InstanceSet};
use super::diagnostics::{Diagnostic, DiagnosticCode, DiagnosticSink};
use super::eligibility::{EligibleScenarios, Subject};
use super::error::WeaveError;
use super::registry::{AspectClass, AspectRegistry, OrderedAspectLayer};
use crate::model::{DeclId, Program};

#[derive(Debug, Clone, PartialEq)]
pub enum PlanAction {
    Apply,
    /// An exclusion covers the target; silently dropped.
    Excluded,
    Ineligible(String),
    /// The class could not build its eligibility rules.
    Disabled(String),
}

#[derive(Debug, Clone)]
pub struct PlannedInstance {
    pub aggregated: Aggregated,
    pub aspect: String,
    pub location: String,
    pub action: PlanAction,
}

#[derive(Debug, Clone)]
pub struct UnitPlan {
    pub unit: DeclId,
    pub name: String,
    pub instances: Vec<PlannedInstance>,
}

#[derive(Debug, Clone)]
pub struct WeavePlan {
    pub layer_order: Vec<OrderedAspectLayer>,
    pub units: Vec<UnitPlan>,
    pub to_apply: u32,
    pub excluded: u32,
    pub ineligible: u32,
    pub disabled: u32,
}

impl WeavePlan {
    pub fn unit(&self, unit: DeclId) -> Option<&UnitPlan> {
        self.units.iter().find(|u| u.unit == unit)
    }
}

/// Scenario an instance needs: inheritance when every aggregated instance
/// was inherited, the default scenario otherwise.
pub fn required_scenario(agg: &Aggregated) -> EligibleScenarios {
    if agg.is_inherited() {
        EligibleScenarios::INHERITANCE
    } else {
        EligibleScenarios::DEFAULT
    }
}

/// Gate one instance against its class.
pub fn gate(class: &AspectClass, subject: &Subject<'_>, required: EligibleScenarios) -> PlanAction {
    if let Some(ref why) = class.disabled {
        return PlanAction::Disabled(why.clone());
    }
    match class.eligibility.check(subject, required) {
        Ok(()) => PlanAction::Apply,
        Err(why) => PlanAction::Ineligible(format!(
            "aspect '{}' cannot be applied: {}",
            class.name, why
        )),
    }
}

/// Build the plan and report eligibility diagnostics.
pub fn plan(
    program: &Program,
    registry: &AspectRegistry,
    instances: &InstanceSet,
    layer_order: &[OrderedAspectLayer],
    sink: &dyn DiagnosticSink,
) -> Result<WeavePlan, WeaveError> {
    let mut units: Vec<UnitPlan> = program
        .types()
        .map(|t| UnitPlan {
            unit: t.id,
            name: t.name.clone(),
            instances: Vec::new(),
        })
        .collect();
    let (mut to_apply, mut excluded, mut ineligible, mut disabled) = (0u32, 0u32, 0u32, 0u32);

    for agg in instances.aggregated()? {
        let class = registry.get(agg.class());
        let target = agg.target();
        let decl = program.get(target).ok_or_else(|| {
            WeaveError::internal(format!("instance target {} is not a source declaration", target))
        })?;
        let location = program.location(target);

        let action = if is_excluded(&agg, program, registry) {
            PlanAction::Excluded
        } else {
            gate(class, &Subject::from(decl), required_scenario(&agg))
        };
        match action {
            PlanAction::Apply => to_apply += 1,
            PlanAction::Excluded => {
                excluded += 1;
                tracing::debug!(aspect = %class.name, at = %location, "instance excluded");
            }
            PlanAction::Ineligible(ref why) => {
                ineligible += 1;
                sink.report(
                    Diagnostic::error(DiagnosticCode::Ineligible, why.clone())
                        .with_aspect(&class.name)
                        .at(location.clone()),
                );
            }
            PlanAction::Disabled(_) => disabled += 1,
        }

        let unit = program
            .unit_of(target)
            .ok_or_else(|| WeaveError::internal(format!("{} has no containing type", location)))?;
        let slot = units
            .iter_mut()
            .find(|u| u.unit == unit)
            .ok_or_else(|| WeaveError::internal(format!("unit {} missing from plan", unit)))?;
        slot.instances.push(PlannedInstance {
            aggregated: agg,
            aspect: class.name.clone(),
            location,
            action,
        });
    }

    Ok(WeavePlan {
        layer_order: layer_order.to_vec(),
        units,
        to_apply,
        excluded,
        ineligible,
        disabled,
    })
}
