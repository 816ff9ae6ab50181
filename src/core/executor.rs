//! WF-012: Executor — orchestration loop for a weave.
//!
//! collect instances → layer order → plan → per unit: for each layer, build
//! advice → fold → link → hash. Units run concurrently, layers within a unit
//! strictly in order. Results, diagnostics and events merge in unit order.

use super::aggregate::{is_excluded, AspectInstance, InstanceSet, InstanceSource, ProgramInheritance};
use super::diagnostics::{Diagnostic, DiagnosticCode, DiagnosticSink};
use super::eligibility::{EligibleScenarios, Subject};
use super::error::WeaveError;
use super::parser::Project;
use super::planner::{self, PlanAction, PlannedInstance, UnitPlan, WeavePlan};
use super::registry::{AspectRegistry, OrderedAspectLayer};
use super::resolver;
use super::state;
use super::types::{Policy, UnitLock, UnitStatus, WeaveEvent, WeaveLock};
use crate::aspects::{AdviceContext, AspectOutcome};
use crate::invoke::{CancellationToken, InvokeSite, Invoker};
use crate::linker::{link_unit, LinkOptions, LinkedUnit};
use crate::model::snapshot::{Contribution, FoldOutcome, LayerFold, UnitSnapshot};
use crate::model::transform::Transformation;
use crate::model::{DeclId, Program};
use crate::tripwire::{eventlog, hasher};
use rayon::prelude::*;
use std::time::{Duration, Instant};

/// Knobs for one weave run.
#[derive(Debug, Clone)]
pub struct WeaveOptions {
    /// Label for events and the lock file.
    pub project: String,
    pub parallel: bool,
    pub link: LinkOptions,
    pub cancel: CancellationToken,
}

impl Default for WeaveOptions {
    fn default() -> Self {
        Self {
            project: "weft".to_string(),
            parallel: true,
            link: LinkOptions::default(),
            cancel: CancellationToken::new(),
        }
    }
}

impl WeaveOptions {
    pub fn from_policy(project: &str, policy: &Policy) -> Self {
        Self {
            project: project.to_string(),
            parallel: policy.parallel,
            link: LinkOptions {
                inlining: policy.inlining,
            },
            cancel: CancellationToken::new(),
        }
    }
}

/// What happened to one aggregated instance.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceState {
    /// Ran every layer it had; count of transformations folded in.
    Applied(usize),
    Skipped,
    Failed(String),
    /// Never ran (excluded, ineligible, or disabled class).
    NotRun(PlanAction),
}

#[derive(Debug, Clone)]
pub struct InstanceReport {
    pub aspect: String,
    pub location: String,
    pub source: InstanceSource,
    pub state: InstanceState,
}

/// Outcome of weaving one unit.
#[derive(Debug, Clone)]
pub struct UnitResult {
    pub unit: DeclId,
    pub name: String,
    pub snapshot: UnitSnapshot,
    pub linked: LinkedUnit,
    pub hash: String,
    pub transformations: usize,
    pub instances: Vec<InstanceReport>,
    /// Diagnostics raised while weaving this unit, in report order.
    pub diagnostics: Vec<Diagnostic>,
    pub status: UnitStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeaveStats {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub excluded: u32,
    pub ineligible: u32,
    pub disabled: u32,
    pub transformations: usize,
}

/// Outcome of a weave run.
#[derive(Debug, Clone)]
pub struct WeaveResult {
    pub run_id: String,
    pub layer_order: Vec<OrderedAspectLayer>,
    pub units: Vec<UnitResult>,
    pub events: Vec<WeaveEvent>,
    pub stats: WeaveStats,
    /// Every diagnostic of the run, planning included.
    pub diagnostics: usize,
    pub elapsed: Duration,
}

impl WeaveResult {
    pub fn unit(&self, name: &str) -> Option<&UnitResult> {
        self.units.iter().find(|u| u.name == name)
    }

    /// `Aspect[:layer]` per resolved layer.
    pub fn layer_names(&self) -> Vec<String> {
        self.layer_order.iter().map(|l| l.layer.to_string()).collect()
    }

    pub fn to_lock(&self) -> WeaveLock {
        let project = self
            .events
            .iter()
            .find_map(|e| match e {
                WeaveEvent::WeaveStarted { project, .. } => Some(project.as_str()),
                _ => None,
            })
            .unwrap_or("weft");
        let mut lock = state::new_lock(project, self.layer_names());
        for u in &self.units {
            lock.units.insert(
                u.name.clone(),
                UnitLock {
                    hash: u.hash.clone(),
                    members: u.linked.members.len(),
                    synthetic: u.linked.synthetic_count(),
                    transformations: u.transformations,
                    status: u.status,
                },
            );
        }
        lock
    }
}

/// Collect the project's instances (attributes, rules, inheritance).
pub fn collect_instances(project: &Project) -> InstanceSet {
    InstanceSet::collect(
        &project.program,
        &project.registry,
        &project.rules,
        &ProgramInheritance::new(&project.program),
    )
}

/// Resolve the layer order and plan every instance. Ordering failures are
/// fatal; eligibility failures are reported to `sink`.
pub fn prepare(
    program: &Program,
    registry: &AspectRegistry,
    instances: &InstanceSet,
    sink: &dyn DiagnosticSink,
) -> Result<WeavePlan, WeaveError> {
    let first_seen = instances.first_seen(program);
    let layer_order = resolver::build_layer_order(registry, &first_seen, sink)?;
    planner::plan(program, registry, instances, &layer_order, sink)
}

/// Weave a loaded project with its own invoker.
pub fn weave_project(
    project: &Project,
    sink: &dyn DiagnosticSink,
    options: &WeaveOptions,
) -> Result<WeaveResult, WeaveError> {
    let instances = collect_instances(project);
    weave(&project.program, &project.registry, &instances, &project.invoker, sink, options)
}

/// Run the whole pipeline.
pub fn weave<I: Invoker>(
    program: &Program,
    registry: &AspectRegistry,
    instances: &InstanceSet,
    invoker: &I,
    sink: &dyn DiagnosticSink,
    options: &WeaveOptions,
) -> Result<WeaveResult, WeaveError> {
    let start = Instant::now();
    let run_id = eventlog::generate_run_id();
    let _span = tracing::info_span!("weave", project = %options.project, run_id = %run_id).entered();

    let plan = prepare(program, registry, instances, sink)?;
    let ctx = UnitCtx {
        program,
        registry,
        invoker,
        layer_order: &plan.layer_order,
        options,
    };

    let outcomes: Vec<Result<Option<UnitResult>, WeaveError>> = if options.parallel {
        plan.units.par_iter().map(|u| ctx.weave_unit(u)).collect()
    } else {
        plan.units.iter().map(|u| ctx.weave_unit(u)).collect()
    };

    let mut events = vec![WeaveEvent::WeaveStarted {
        project: options.project.clone(),
        run_id: run_id.clone(),
        weft_version: env!("CARGO_PKG_VERSION").to_string(),
    }];
    let mut units = Vec::with_capacity(outcomes.len());
    let mut stats = WeaveStats {
        excluded: plan.excluded,
        ineligible: plan.ineligible,
        disabled: plan.disabled,
        ..WeaveStats::default()
    };
    let mut cancelled = false;
    for outcome in outcomes {
        let Some(unit) = outcome? else {
            cancelled = true;
            continue;
        };
        let recorded = unit_events(&unit);
        for d in &unit.diagnostics {
            sink.report(d.clone());
        }
        for r in &unit.instances {
            match r.state {
                InstanceState::Applied(_) => stats.applied += 1,
                InstanceState::Skipped => stats.skipped += 1,
                InstanceState::Failed(_) => stats.failed += 1,
                InstanceState::NotRun(_) => {}
            }
        }
        stats.transformations += unit.transformations;
        events.extend(recorded);
        units.push(unit);
    }
    if cancelled {
        tracing::warn!(completed = units.len(), total = plan.units.len(), "weave cancelled");
        return Err(WeaveError::Cancelled {
            completed: units.len(),
            total: plan.units.len(),
        });
    }

    let elapsed = start.elapsed();
    let diagnostics = sink.error_count();
    events.push(WeaveEvent::WeaveCompleted {
        project: options.project.clone(),
        run_id: run_id.clone(),
        units: units.len(),
        layers: plan.layer_order.len(),
        diagnostics,
        total_seconds: elapsed.as_secs_f64(),
    });
    tracing::info!(
        units = units.len(),
        transformations = stats.transformations,
        diagnostics,
        "weave complete"
    );

    Ok(WeaveResult {
        run_id,
        layer_order: plan.layer_order,
        units,
        events,
        stats,
        diagnostics,
        elapsed,
    })
}

/// Per-unit events, rebuilt from the applied transformations and the
/// instance reports.
fn unit_events(unit: &UnitResult) -> Vec<WeaveEvent> {
    let mut out = Vec::new();
    for applied in layer_counts(&unit.snapshot) {
        out.push(WeaveEvent::LayerApplied {
            unit: unit.name.clone(),
            layer: applied.0,
            transformations: applied.1,
        });
    }
    for r in &unit.instances {
        match r.state {
            InstanceState::Skipped => out.push(WeaveEvent::InstanceSkipped {
                unit: unit.name.clone(),
                aspect: r.aspect.clone(),
                target: r.location.clone(),
                reason: "declined by aspect".to_string(),
            }),
            InstanceState::NotRun(ref action) if *action != PlanAction::Apply => {
                out.push(WeaveEvent::InstanceSkipped {
                    unit: unit.name.clone(),
                    aspect: r.aspect.clone(),
                    target: r.location.clone(),
                    reason: match action {
                        PlanAction::Excluded => "excluded".to_string(),
                        PlanAction::Ineligible(why) | PlanAction::Disabled(why) => why.clone(),
                        PlanAction::Apply => String::new(),
                    },
                })
            }
            InstanceState::Failed(ref error) => out.push(WeaveEvent::InstanceFailed {
                unit: unit.name.clone(),
                aspect: r.aspect.clone(),
                target: r.location.clone(),
                error: error.clone(),
            }),
            _ => {}
        }
    }
    out
}

/// Transformations per layer, in layer order.
fn layer_counts(snapshot: &UnitSnapshot) -> Vec<(String, usize)> {
    let mut out: Vec<(String, usize)> = Vec::new();
    for a in snapshot.applied() {
        let name = a.layer.layer.to_string();
        match out.last_mut() {
            Some(last) if last.0 == name => last.1 += 1,
            _ => out.push((name, 1)),
        }
    }
    out
}

struct UnitCtx<'a, I: Invoker> {
    program: &'a Program,
    registry: &'a AspectRegistry,
    invoker: &'a I,
    layer_order: &'a [OrderedAspectLayer],
    options: &'a WeaveOptions,
}

#[derive(Debug, Clone, PartialEq)]
enum RunState {
    Active,
    Failed(String),
    NotRun(PlanAction),
}

struct Running {
    planned: PlannedInstance,
    state: RunState,
    applied: usize,
}

impl Running {
    fn is_active(&self) -> bool {
        self.state == RunState::Active && !self.planned.aggregated.is_skipped()
    }

    fn report(self) -> InstanceReport {
        let state = match self.state {
            RunState::Failed(e) => InstanceState::Failed(e),
            RunState::NotRun(a) => InstanceState::NotRun(a),
            RunState::Active if self.planned.aggregated.is_skipped() => InstanceState::Skipped,
            RunState::Active => InstanceState::Applied(self.applied),
        };
        InstanceReport {
            aspect: self.planned.aspect,
            location: self.planned.location,
            source: self.planned.aggregated.source(),
            state,
        }
    }
}

impl<I: Invoker> UnitCtx<'_, I> {
    /// `None` when the run was cancelled before this unit started.
    fn weave_unit(&self, plan: &UnitPlan) -> Result<Option<UnitResult>, WeaveError> {
        if self.options.cancel.is_cancelled() {
            return Ok(None);
        }
        let _span = tracing::info_span!("unit", name = %plan.name).entered();
        let mut snapshot = UnitSnapshot::from_program(self.program, plan.unit)
            .ok_or_else(|| WeaveError::internal(format!("unit '{}' is not a source type", plan.name)))?;
        let mut running: Vec<Running> = plan
            .instances
            .iter()
            .map(|p| Running {
                planned: p.clone(),
                state: match p.action {
                    PlanAction::Apply => RunState::Active,
                    ref other => RunState::NotRun(other.clone()),
                },
                applied: 0,
            })
            .collect();
        let ineligible = running
            .iter()
            .filter(|r| matches!(r.state, RunState::NotRun(PlanAction::Ineligible(_))))
            .count();
        let mut diagnostics = Vec::new();

        for (pos, layer) in self.layer_order.iter().enumerate() {
            let Some(class) = self.registry.by_name(layer.aspect()) else {
                continue;
            };
            let mut contributions = Vec::new();
            let mut contributors = Vec::new();
            for (i, r) in running.iter_mut().enumerate() {
                if r.planned.aggregated.class() != class.id || !r.is_active() {
                    continue;
                }
                let agg = &r.planned.aggregated;
                let ctx = AdviceContext {
                    program: self.program,
                    snapshot: &snapshot,
                    layer,
                    target: agg.target(),
                    source: agg.source(),
                    other_instances: agg.other_instances().len(),
                };
                let site = InvokeSite::new(&class.name, "build_aspect").at(r.planned.location.clone());
                let outcome = self
                    .invoker
                    .invoke(&site, || class.aspect.build_aspect(&ctx))
                    .unwrap_or_else(|e| AspectOutcome::Failed(e.to_string()));
                match outcome {
                    AspectOutcome::Success(transformations) => {
                        contributions.push(Contribution {
                            instance_target: agg.target(),
                            transformations,
                        });
                        contributors.push(i);
                    }
                    AspectOutcome::Skipped => {
                        tracing::debug!(aspect = %class.name, at = %r.planned.location, "instance skipped");
                        r.planned.aggregated.skip();
                    }
                    AspectOutcome::Failed(message) => {
                        diagnostics.push(
                            Diagnostic::error(
                                DiagnosticCode::AspectFailed,
                                format!("aspect '{}' failed: {}", class.name, message),
                            )
                            .with_aspect(&class.name)
                            .at(r.planned.location.clone()),
                        );
                        r.state = RunState::Failed(message);
                    }
                }
            }
            if contributions.is_empty() {
                continue;
            }

            let children: Vec<Vec<(String, DeclId)>> = contributions
                .iter()
                .map(|c| {
                    c.transformations
                        .iter()
                        .filter_map(|t| match t {
                            Transformation::AddAspect { aspect, target } => Some((aspect.clone(), *target)),
                            _ => None,
                        })
                        .collect()
                })
                .collect();

            let LayerFold {
                snapshot: next,
                outcomes,
                fatal,
            } = snapshot.fold(layer, contributions);
            if let Some(conflict) = fatal {
                tracing::warn!(layer = %layer.layer, "layer aborted: {}", conflict.message);
                diagnostics.push(
                    Diagnostic::error(conflict.code, conflict.message)
                        .with_aspect(layer.aspect())
                        .at(plan.name.clone()),
                );
                continue;
            }
            snapshot = next;

            let mut folded = 0;
            for ((outcome, i), requests) in outcomes.into_iter().zip(contributors).zip(children) {
                match outcome {
                    FoldOutcome::Accepted(n) => {
                        running[i].applied += n;
                        folded += n;
                        for (aspect, target) in requests {
                            self.add_child(&aspect, target, pos, &snapshot, &mut running, &mut diagnostics)?;
                        }
                    }
                    FoldOutcome::Rejected(conflict) => diagnostics.push(
                        Diagnostic::error(conflict.code, conflict.message)
                            .with_aspect(layer.aspect())
                            .at(running[i].planned.location.clone()),
                    ),
                    FoldOutcome::Aborted => {}
                }
            }
            tracing::debug!(layer = %layer.layer, transformations = folded, "layer folded");
        }

        let linked = link_unit(&snapshot, &self.options.link)?;
        let hash = hasher::hash_unit(&linked);
        let transformations = snapshot.applied().len();
        let status = if !diagnostics.is_empty() || ineligible > 0 {
            UnitStatus::Diagnosed
        } else if transformations > 0 {
            UnitStatus::Woven
        } else {
            UnitStatus::Untouched
        };
        Ok(Some(UnitResult {
            unit: plan.unit,
            name: plan.name.clone(),
            snapshot,
            linked,
            hash,
            transformations,
            instances: running.into_iter().map(Running::report).collect(),
            diagnostics,
            status,
        }))
    }

    /// Attach a child instance requested by an accepted contribution. The
    /// child class must have a layer after the current one.
    fn add_child(
        &self,
        aspect: &str,
        target: DeclId,
        pos: usize,
        snapshot: &UnitSnapshot,
        running: &mut Vec<Running>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<(), WeaveError> {
        let location = match snapshot.member(target) {
            Some(m) => format!("{}.{}", snapshot.name, m.name),
            None => snapshot.name.clone(),
        };
        let invalid = |message: String| {
            Diagnostic::error(DiagnosticCode::InvalidChildAspect, message)
                .with_aspect(aspect)
                .at(location.clone())
        };
        let Some(child) = self.registry.by_name(aspect) else {
            diagnostics.push(invalid(format!("unknown child aspect '{}'", aspect)));
            return Ok(());
        };
        if !self.layer_order[pos + 1..].iter().any(|l| l.aspect() == child.name) {
            diagnostics.push(invalid(format!(
                "child aspect '{}' has no layer after '{}'",
                aspect, self.layer_order[pos].layer
            )));
            return Ok(());
        }

        let instance = AspectInstance::new(child.id, target, InstanceSource::Implicit);
        if let Some(existing) = running
            .iter_mut()
            .find(|r| r.planned.aggregated.class() == child.id && r.planned.aggregated.target() == target)
        {
            existing.planned.aggregated = existing.planned.aggregated.clone().absorb(instance)?;
            return Ok(());
        }

        let aggregated = super::aggregate::aggregate(vec![instance])?;
        let subject = match (self.program.get(target), snapshot.member(target)) {
            (Some(decl), _) => Subject::from(decl),
            (None, Some(m)) => Subject {
                name: &m.name,
                kind: m.kind,
                modifiers: m.modifiers,
                arity: m.params.len(),
            },
            (None, None) => {
                diagnostics.push(invalid(format!("child aspect target {} not found", target)));
                return Ok(());
            }
        };
        let action = if is_excluded(&aggregated, self.program, self.registry) {
            PlanAction::Excluded
        } else {
            planner::gate(child, &subject, EligibleScenarios::DEFAULT)
        };
        if let PlanAction::Ineligible(ref why) = action {
            diagnostics.push(
                Diagnostic::error(DiagnosticCode::Ineligible, why.clone())
                    .with_aspect(&child.name)
                    .at(location.clone()),
            );
        }
        tracing::debug!(aspect = %child.name, at = %location, "child aspect added");
        running.push(Running {
            planned: PlannedInstance {
                aggregated,
                aspect: child.name.clone(),
                location,
                action: action.clone(),
            },
            state: match action {
                PlanAction::Apply => RunState::Active,
                other => RunState::NotRun(other),
            },
            applied: 0,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diagnostics::CollectingSink;
    use crate::core::parser::{load_project_config, parse_project};
    use crate::linker::eval::{call_chain, call_linked, Value};

    fn load(yaml: &str) -> Project {
        let sink = CollectingSink::new();
        load_project_config(parse_project(yaml).unwrap(), &sink).unwrap()
    }

    fn run(yaml: &str) -> (WeaveResult, CollectingSink) {
        let project = load(yaml);
        let sink = CollectingSink::new();
        let options = WeaveOptions::from_policy(&project.config.name, &project.config.policy);
        let result = weave_project(&project, &sink, &options).unwrap();
        (result, sink)
    }

    fn body(unit: &UnitResult, callable: &str) -> String {
        unit.linked
            .callable(callable)
            .and_then(|m| m.body.as_ref())
            .map(|b| b.to_string())
            .unwrap_or_else(|| panic!("no callable '{}'", callable))
    }

    #[test]
    fn test_wf012_replace_breaking_reference_is_scoped() {
        let (result, sink) = run(r#"
version: "1.0"
name: replace-scope
types:
  Calc:
    members:
      f:
        params: [x]
        body: "return x;"
        attributes: [Second]
      g:
        params: [x]
        body: "return x;"
        attributes: [First]
  Other:
    members:
      h:
        body: "return 1;"
aspects:
  First:
    run_before: [Second]
    advice:
      - kind: override
        body: 'return {{base@f}}(x);'
  Second:
    advice:
      - kind: replace
        body: 'return 0;'
        params: [a, b]
"#);
        let conflicts = sink.with_code(DiagnosticCode::IncompatibleOverride);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].aspect.as_deref(), Some("Second"));

        let calc = result.unit("Calc").unwrap();
        assert_eq!(body(calc, "f"), "return x;");
        assert_eq!(body(calc, "g"), "return f(x);");
        assert!(result.unit("Other").is_some());
    }

    #[test]
    fn test_wf012_scenario_a_inline_single_form() {
        let (result, sink) = run(r#"
version: "1.0"
name: scenario-a
types:
  Calc:
    members:
      f:
        params: [x]
        body: "return x;"
        attributes: [Log]
aspects:
  Log:
    advice:
      - kind: override
        body: 'log("f"); return {{base|inline}}(x);'
"#);
        assert!(sink.diagnostics().is_empty());
        let calc = result.unit("Calc").unwrap();
        assert_eq!(calc.linked.forms_of("f").len(), 1);
        assert_eq!(calc.linked.synthetic_count(), 0);
        assert_eq!(body(calc, "f"), "log(\"f\"); return x;");
        assert_eq!(calc.status, UnitStatus::Woven);
    }

    const SCENARIO_B: &str = r#"
version: "1.0"
name: scenario-b
types:
  Calc:
    members:
      f:
        params: [x]
        body: "return x;"
        attributes: [First, Second]
aspects:
  First:
    run_before: [Second]
    advice:
      - kind: override
        body: 'log("1"); return {{base}}(x);'
  Second:
    advice:
      - kind: override
        body: 'log("2"); return {{base}}(x);'
"#;

    #[test]
    fn test_wf012_scenario_b_two_synthetic_levels() {
        let (result, _) = run(SCENARIO_B);
        assert_eq!(result.layer_names(), vec!["First", "Second"]);
        let calc = result.unit("Calc").unwrap();
        assert_eq!(calc.linked.forms_of("f").len(), 3);
        assert_eq!(body(calc, "f"), "log(\"2\"); return f__First(x);");
        assert_eq!(body(calc, "f__First"), "log(\"1\"); return f__source(x);");
        assert_eq!(body(calc, "f__source"), "return x;");

        let (value, trace) = call_linked(&calc.linked, "f", vec![Value::Int(5)]).unwrap();
        assert_eq!(value, Value::Int(5));
        assert_eq!(trace, vec!["log(\"2\")", "log(\"1\")"]);
        assert_eq!(
            call_chain(&calc.snapshot, "f", vec![Value::Int(5)]).unwrap(),
            (value, trace)
        );
    }

    #[test]
    fn test_wf012_scenario_c_exclusion_primary_wins() {
        let project = load(r#"
version: "1.0"
name: scenario-c
types:
  Calc:
    members:
      f:
        params: [x]
        body: "return x;"
        attributes: [Log]
        excludes: [Log]
aspects:
  Log:
    advice:
      - kind: override
        body: 'log("f"); return {{base}}(x);'
"#);
        let instances = collect_instances(&project);
        let aggregated = instances.aggregated().unwrap();
        assert_eq!(aggregated.len(), 1);
        assert_eq!(aggregated[0].primary().source, InstanceSource::Exclusion);
        assert_eq!(aggregated[0].other_instances()[0].source, InstanceSource::FromAttribute);

        let sink = CollectingSink::new();
        let result = weave_project(&project, &sink, &WeaveOptions::default()).unwrap();
        let calc = result.unit("Calc").unwrap();
        assert_eq!(calc.transformations, 0);
        assert_eq!(calc.status, UnitStatus::Untouched);
        assert!(sink.diagnostics().is_empty());
        assert_eq!(result.stats.excluded, 1);
    }

    #[test]
    fn test_wf012_scenario_d_ineligible_is_isolated() {
        let (result, sink) = run(r#"
version: "1.0"
name: scenario-d
types:
  Account:
    members:
      balance:
        kind: field
        attributes: [MethodsOnly, Tag]
aspects:
  MethodsOnly:
    eligibility:
      - kind: method
    advice:
      - kind: introduce
        name: shadow
        member_kind: field
  Tag:
    advice:
      - kind: introduce
        name: tag
        member_kind: field
"#);
        let diags = sink.diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, DiagnosticCode::Ineligible);
        assert_eq!(diags[0].aspect.as_deref(), Some("MethodsOnly"));

        let account = result.unit("Account").unwrap();
        assert!(account.snapshot.member_by_name("tag").is_some());
        assert!(account.snapshot.member_by_name("shadow").is_none());
        assert_eq!(account.transformations, 1);
        assert_eq!(account.status, UnitStatus::Diagnosed);
    }

    #[test]
    fn test_wf012_scenario_e_final_resolves_to_last_layer() {
        let (result, _) = run(r#"
version: "1.0"
name: scenario-e
types:
  Calc:
    members:
      f:
        params: [x]
        body: "return x;"
        attributes: [Retry, Log]
aspects:
  Retry:
    run_before: [Log]
    advice:
      - kind: override
        body: "if x > 98 { return 0; } return {{final}}(x + 1);"
  Log:
    advice:
      - kind: override
        body: 'log("2"); return {{base}}(x);'
"#);
        let calc = result.unit("Calc").unwrap();
        assert_eq!(body(calc, "f__Retry"), "if x > 98 { return 0; } return f(x + 1);");
        let (value, trace) = call_linked(&calc.linked, "f", vec![Value::Int(98)]).unwrap();
        assert_eq!(value, Value::Int(0));
        assert_eq!(trace, vec!["log(\"2\")", "log(\"2\")"]);
    }

    #[test]
    fn test_wf012_ordering_cycle_is_fatal() {
        let project = load(r#"
version: "1.0"
name: cycle
types:
  Calc:
    attributes: [A, B]
aspects:
  A: { run_before: [B] }
  B: { run_before: [A] }
"#);
        let sink = CollectingSink::new();
        let err = weave_project(&project, &sink, &WeaveOptions::default()).unwrap_err();
        assert!(matches!(err, WeaveError::Ordering(_)));
        assert!(!sink.with_code(DiagnosticCode::OrderCycle).is_empty());
    }

    #[test]
    fn test_wf012_failure_is_scoped_to_instance() {
        let (result, sink) = run(r#"
version: "1.0"
name: failing
types:
  Calc:
    members:
      f:
        params: [x]
        body: "return x;"
        attributes: [Broken, Log]
aspects:
  Broken:
    advice:
      - kind: fail
        message: "cannot weave"
  Log:
    advice:
      - kind: override
        body: 'log("f"); return {{base}}(x);'
"#);
        let failed = sink.with_code(DiagnosticCode::AspectFailed);
        assert_eq!(failed.len(), 1);
        assert!(failed[0].message.contains("cannot weave"));
        let calc = result.unit("Calc").unwrap();
        assert_eq!(calc.transformations, 1);
        assert_eq!(result.stats.failed, 1);
        assert_eq!(result.stats.applied, 1);
        assert!(result
            .events
            .iter()
            .any(|e| matches!(e, WeaveEvent::InstanceFailed { aspect, .. } if aspect == "Broken")));
    }

    #[test]
    fn test_wf012_skip_stops_later_layers() {
        let (result, sink) = run(r#"
version: "1.0"
name: skipping
types:
  Calc:
    members:
      f:
        params: [x]
        body: "return x;"
        attributes: [Picky]
aspects:
  Picky:
    layers: [late]
    skip_unless: "^g$"
    advice:
      - kind: override
        layer: late
        body: 'log("late"); return {{base}}(x);'
"#);
        assert!(sink.diagnostics().is_empty());
        let calc = result.unit("Calc").unwrap();
        assert_eq!(calc.transformations, 0);
        assert_eq!(calc.instances[0].state, InstanceState::Skipped);
        assert_eq!(result.stats.skipped, 1);
    }

    #[test]
    fn test_wf012_layers_run_in_order() {
        let (result, _) = run(r#"
version: "1.0"
name: layered
types:
  Calc:
    members:
      f:
        params: [x]
        body: "return x;"
        attributes: [Cache]
aspects:
  Cache:
    layers: [warm]
    advice:
      - kind: override
        body: 'log("primary"); return {{base}}(x);'
      - kind: override
        layer: warm
        body: 'log("warm"); return {{base}}(x);'
"#);
        let calc = result.unit("Calc").unwrap();
        assert_eq!(result.layer_names(), vec!["Cache", "Cache:warm"]);
        assert_eq!(body(calc, "f"), "log(\"warm\"); return f__Cache(x);");
        let (_, trace) = call_linked(&calc.linked, "f", vec![Value::Int(1)]).unwrap();
        assert_eq!(trace, vec!["log(\"warm\")", "log(\"primary\")"]);
        let layers: Vec<&str> = result
            .events
            .iter()
            .filter_map(|e| match e {
                WeaveEvent::LayerApplied { layer, .. } => Some(layer.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(layers, vec!["Cache", "Cache:warm"]);
    }

    const CHILD: &str = r#"
version: "1.0"
name: child
types:
  Calc:
    attributes: [Parent]
    members:
      f:
        params: [x]
        body: "return x;"
aspects:
  Parent:
    run_before: [Child]
    advice:
      - kind: add_aspect
        aspect: Child
        members: "^f$"
  Child:
    advice:
      - kind: override
        body: 'log("child"); return {{base}}(x);'
"#;

    #[test]
    fn test_wf012_child_aspect_runs_in_later_layer() {
        let (result, sink) = run(CHILD);
        assert!(sink.diagnostics().is_empty());
        let calc = result.unit("Calc").unwrap();
        assert_eq!(body(calc, "f"), "log(\"child\"); return f__source(x);");
        assert!(calc
            .instances
            .iter()
            .any(|r| r.aspect == "Child" && r.source == InstanceSource::Implicit));
    }

    #[test]
    fn test_wf012_child_aspect_must_come_later() {
        let yaml = CHILD.replace("run_before: [Child]", "run_after: [Child]");
        let (result, sink) = run(&yaml);
        let invalid = sink.with_code(DiagnosticCode::InvalidChildAspect);
        assert_eq!(invalid.len(), 1);
        assert_eq!(result.unit("Calc").unwrap().transformations, 0);
    }

    #[test]
    fn test_wf012_inherited_instance_applies_to_override() {
        let (result, _) = run(r#"
version: "1.0"
name: inherit
types:
  Account:
    members:
      deposit:
        params: [amount]
        body: "return amount;"
        attributes: [Audit]
  Savings:
    base: Account
    members:
      deposit:
        params: [amount]
        overrides: Account.deposit
        body: "return amount + 1;"
aspects:
  Audit:
    inheritable: true
    advice:
      - kind: override
        body: 'log("$type.$member"); return {{base}}($args);'
"#);
        let savings = result.unit("Savings").unwrap();
        assert_eq!(body(savings, "deposit"), "log(\"Savings.deposit\"); return deposit__source(amount);");
        assert_eq!(savings.instances[0].source, InstanceSource::Inherited);
    }

    #[test]
    fn test_wf012_parallel_matches_sequential() {
        let project = load(SCENARIO_B);
        let sink = CollectingSink::new();
        let par = weave_project(&project, &sink, &WeaveOptions::default()).unwrap();
        let seq_options = WeaveOptions {
            parallel: false,
            ..WeaveOptions::default()
        };
        let seq = weave_project(&project, &sink, &seq_options).unwrap();
        let hashes = |r: &WeaveResult| r.units.iter().map(|u| u.hash.clone()).collect::<Vec<_>>();
        assert_eq!(hashes(&par), hashes(&seq));
    }

    #[test]
    fn test_wf012_cancelled_before_start() {
        let project = load(SCENARIO_B);
        let options = WeaveOptions::default();
        options.cancel.cancel();
        let sink = CollectingSink::new();
        let err = weave_project(&project, &sink, &options).unwrap_err();
        assert_eq!(err, WeaveError::Cancelled { completed: 0, total: 1 });
    }

    #[test]
    fn test_wf012_events_and_lock() {
        let (result, _) = run(SCENARIO_B);
        assert!(matches!(result.events.first(), Some(WeaveEvent::WeaveStarted { .. })));
        assert!(matches!(result.events.last(), Some(WeaveEvent::WeaveCompleted { units: 1, .. })));
        let lock = result.to_lock();
        assert_eq!(lock.project, "scenario-b");
        assert_eq!(lock.layer_order, vec!["First", "Second"]);
        let entry = &lock.units["Calc"];
        assert_eq!(entry.hash, result.units[0].hash);
        assert_eq!(entry.synthetic, 2);
        assert_eq!(entry.status, UnitStatus::Woven);
    }

    #[test]
    fn test_wf012_inlining_policy_off() {
        let (result, _) = run(r#"
version: "1.0"
name: no-inline
types:
  Calc:
    members:
      f:
        params: [x]
        body: "return x;"
        attributes: [Log]
aspects:
  Log:
    advice:
      - kind: override
        body: 'log("f"); return {{base|inline}}(x);'
policy:
  inlining: false
"#);
        let calc = result.unit("Calc").unwrap();
        assert_eq!(body(calc, "f"), "log(\"f\"); return f__source(x);");
    }
}
