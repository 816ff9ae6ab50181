//! WF-025: Template aspects — aspect classes declared in the project file.
//!
//! Each advice names the layer that runs it. Body templates expand `$member`,
//! `$args` and `$type` against the advised member before parsing, so one
//! advice can override every matching member of a type.

use super::{AdviceContext, Aspect, AspectOutcome};
use crate::core::eligibility::{EligibilityBuilder, EligibleScenarios, Requirement};
use crate::core::types::{AdviceKind, AdviceSpec, AspectSpec, EligibilitySpec, ScenarioName};
use crate::model::snapshot::MemberState;
use crate::model::syntax::{Body, Facet};
use crate::model::transform::{InsertPosition, MemberSpec, Transformation, WhenExists};
use crate::model::{DeclFlags, DeclKind, Modifiers};
use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
enum Anchor {
    Start,
    End,
    Before(String),
    After(String),
}

impl Anchor {
    fn parse(s: &str) -> Result<Self, String> {
        match s.split_once(':') {
            None if s == "start" => Ok(Self::Start),
            None if s == "end" => Ok(Self::End),
            Some(("before", m)) if !m.is_empty() => Ok(Self::Before(m.to_string())),
            Some(("after", m)) if !m.is_empty() => Ok(Self::After(m.to_string())),
            _ => Err(format!("invalid position '{}' (start, end, before:<member>, after:<member>)", s)),
        }
    }
}

#[derive(Debug, Clone)]
struct Provided {
    name: String,
    kind: DeclKind,
    params: Vec<String>,
    body: Option<String>,
}

#[derive(Debug, Clone)]
struct Advice {
    kind: AdviceKind,
    layer: Option<String>,
    facet: Option<Facet>,
    body: Option<String>,
    members: Option<Regex>,
    flags: DeclFlags,
    name: Option<String>,
    member_kind: Option<DeclKind>,
    params: Vec<String>,
    position: Anchor,
    when_exists: WhenExists,
    interface: Option<String>,
    provides: Vec<Provided>,
    aspect: Option<String>,
    message: Option<String>,
}

/// Expand body placeholders.
fn expand(template: &str, member: &str, args: &[String], type_name: &str) -> String {
    template
        .replace("$member", member)
        .replace("$args", &args.join(", "))
        .replace("$type", type_name)
}

/// Check a body template parses for some member shape.
fn check_template(template: &str) -> Result<(), String> {
    Body::parse(&expand(template, "m", &["a".to_string()], "T")).map(|_| ())
}

fn compile_regex(pattern: &Option<String>, what: &str) -> Result<Option<Regex>, String> {
    pattern
        .as_deref()
        .map(|p| Regex::new(p).map_err(|e| format!("invalid {} regex '{}': {}", what, p, e)))
        .transpose()
}

impl Advice {
    fn compile(spec: &AdviceSpec) -> Result<Self, String> {
        if let Some(ref body) = spec.body {
            check_template(body).map_err(|e| format!("{} advice body: {}", spec.kind, e))?;
        }
        let mut flags = DeclFlags::empty();
        flags.set(DeclFlags::NOT_INLINEABLE, spec.not_inlineable);
        flags.set(DeclFlags::NOT_DISCARDABLE, spec.not_discardable);

        let require = |field: &Option<String>, name: &str| -> Result<(), String> {
            match field {
                Some(_) => Ok(()),
                None => Err(format!("{} advice requires '{}'", spec.kind, name)),
            }
        };
        match spec.kind {
            AdviceKind::Override => require(&spec.body, "body")?,
            AdviceKind::Introduce => require(&spec.name, "name")?,
            AdviceKind::Implement => require(&spec.interface, "interface")?,
            AdviceKind::Replace => require(&spec.body, "body")?,
            AdviceKind::AddAspect => require(&spec.aspect, "aspect")?,
            AdviceKind::Fail => {}
        }

        let mut provides = Vec::with_capacity(spec.provides.len());
        for p in &spec.provides {
            if let Some(ref body) = p.body {
                check_template(body).map_err(|e| format!("implement member '{}': {}", p.name, e))?;
            }
            provides.push(Provided {
                name: p.name.clone(),
                kind: p.kind,
                params: p.params.clone(),
                body: p.body.clone(),
            });
        }

        Ok(Self {
            kind: spec.kind,
            layer: spec.layer.clone(),
            facet: spec.facet,
            body: spec.body.clone(),
            members: compile_regex(&spec.members, "members")?,
            flags,
            name: spec.name.clone(),
            member_kind: spec.member_kind,
            params: spec.params.clone(),
            position: match spec.position {
                Some(ref p) => Anchor::parse(p)?,
                None => Anchor::End,
            },
            when_exists: spec.when_exists,
            interface: spec.interface.clone(),
            provides,
            aspect: spec.aspect.clone(),
            message: spec.message.clone(),
        })
    }

    /// Members this advice applies to: the target itself, or for a type
    /// target every member (layout order) whose name matches `members`.
    fn targets<'a>(&self, ctx: &AdviceContext<'a>) -> Vec<&'a MemberState> {
        if !ctx.is_type_target() {
            return ctx.target_member().into_iter().collect();
        }
        ctx.snapshot
            .layout()
            .into_iter()
            .filter_map(|id| ctx.snapshot.member(id))
            .filter(|m| !m.chains.is_empty())
            .filter(|m| self.members.as_ref().map_or(true, |re| re.is_match(&m.name)))
            .collect()
    }

    fn parse_body(&self, template: &str, member: &MemberState, facet: Facet, type_name: &str) -> Result<Body, String> {
        Body::parse(&expand(template, &member.name, &member.facet_params(facet), type_name))
            .map_err(|e| format!("advice body for '{}': {}", member.name, e))
    }

    fn spec_body(&self, kind: DeclKind, template: &str, name: &str, params: &[String], type_name: &str) -> Result<Vec<(Facet, Body)>, String> {
        let facet = self
            .facet
            .or_else(|| kind.facets().first().copied())
            .ok_or_else(|| format!("{} '{}' cannot carry a body", kind, name))?;
        let body = Body::parse(&expand(template, name, params, type_name))?;
        Ok(vec![(facet, body)])
    }

    fn apply(&self, ctx: &AdviceContext<'_>, out: &mut Vec<Transformation>) -> Result<(), String> {
        let type_name = &ctx.snapshot.name;
        match self.kind {
            AdviceKind::Override => {
                let template = self.body.as_deref().unwrap_or_default();
                for member in self.targets(ctx) {
                    let facets: Vec<Facet> = member
                        .chains
                        .iter()
                        .map(|(f, _)| *f)
                        .filter(|f| self.facet.map_or(true, |want| want == *f))
                        .collect();
                    if facets.is_empty() && !ctx.is_type_target() {
                        return Err(format!(
                            "{} '{}' has no {} facet",
                            member.kind,
                            member.name,
                            self.facet.map_or("overridable", Facet::keyword)
                        ));
                    }
                    for facet in facets {
                        out.push(Transformation::Override {
                            target: member.id,
                            facet,
                            body: self.parse_body(template, member, facet, type_name)?,
                            flags: self.flags,
                        });
                    }
                }
            }
            AdviceKind::Introduce => {
                let name = self.name.as_deref().unwrap_or_default();
                let kind = self.member_kind.unwrap_or(DeclKind::Method);
                let bodies = match self.body {
                    Some(ref t) => self.spec_body(kind, t, name, &self.params, type_name)?,
                    None => Vec::new(),
                };
                let position = match self.position {
                    Anchor::Start => InsertPosition::Start,
                    Anchor::End => InsertPosition::End,
                    Anchor::Before(ref m) | Anchor::After(ref m) => {
                        let anchor = ctx
                            .snapshot
                            .member_by_name(m)
                            .ok_or_else(|| format!("anchor member '{}' not found in '{}'", m, type_name))?
                            .id;
                        if matches!(self.position, Anchor::Before(_)) {
                            InsertPosition::Before(anchor)
                        } else {
                            InsertPosition::After(anchor)
                        }
                    }
                };
                out.push(Transformation::Introduce {
                    member: MemberSpec {
                        name: name.to_string(),
                        kind,
                        params: self.params.clone(),
                        modifiers: Modifiers::PUBLIC,
                        flags: self.flags,
                        bodies,
                    },
                    position,
                    when_exists: self.when_exists,
                });
            }
            AdviceKind::Implement => {
                let mut members = Vec::with_capacity(self.provides.len());
                for p in &self.provides {
                    let bodies = match p.body {
                        Some(ref t) => self.spec_body(p.kind, t, &p.name, &p.params, type_name)?,
                        None => Vec::new(),
                    };
                    members.push(MemberSpec {
                        name: p.name.clone(),
                        kind: p.kind,
                        params: p.params.clone(),
                        modifiers: Modifiers::PUBLIC,
                        flags: self.flags,
                        bodies,
                    });
                }
                out.push(Transformation::ImplementInterface {
                    interface: self.interface.clone().unwrap_or_default(),
                    members,
                    when_exists: self.when_exists,
                });
            }
            AdviceKind::Replace => {
                let template = self.body.as_deref().unwrap_or_default();
                for member in self.targets(ctx) {
                    let kind = self.member_kind.unwrap_or(member.kind);
                    let params = if self.params.is_empty() {
                        member.params.clone()
                    } else {
                        self.params.clone()
                    };
                    let name = self.name.clone().unwrap_or_else(|| member.name.clone());
                    let bodies = self.spec_body(kind, template, &name, &params, type_name)?;
                    out.push(Transformation::Replace {
                        target: member.id,
                        member: MemberSpec {
                            name,
                            kind,
                            params,
                            modifiers: member.modifiers,
                            flags: self.flags,
                            bodies,
                        },
                    });
                }
            }
            AdviceKind::AddAspect => {
                let aspect = self.aspect.clone().unwrap_or_default();
                if ctx.is_type_target() && self.members.is_none() {
                    out.push(Transformation::AddAspect {
                        aspect,
                        target: ctx.target,
                    });
                } else {
                    for member in self.targets(ctx) {
                        out.push(Transformation::AddAspect {
                            aspect: aspect.clone(),
                            target: member.id,
                        });
                    }
                }
            }
            AdviceKind::Fail => {
                return Err(self
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("advice failed on '{}'", ctx.target_name())));
            }
        }
        Ok(())
    }
}

fn compile_eligibility(spec: &EligibilitySpec) -> Result<(DeclKind, EligibleScenarios, Vec<Requirement>), String> {
    let mut scenarios = EligibleScenarios::empty();
    for s in &spec.scenarios {
        scenarios |= match s {
            ScenarioName::Default => EligibleScenarios::DEFAULT,
            ScenarioName::Inheritance => EligibleScenarios::INHERITANCE,
        };
    }
    let mut requirements = Vec::new();
    if spec.not_static {
        requirements.push(Requirement::NotStatic);
    }
    if spec.is_static {
        requirements.push(Requirement::Static);
    }
    if spec.not_abstract {
        requirements.push(Requirement::NotAbstract);
    }
    if spec.public {
        requirements.push(Requirement::Public);
    }
    if let Some(n) = spec.min_params {
        requirements.push(Requirement::MinParams(n));
    }
    if let Some(re) = compile_regex(&spec.name_matches, "name_matches")? {
        requirements.push(Requirement::NameMatches(re));
    }
    Ok((spec.kind, scenarios, requirements))
}

/// An aspect whose behaviour is declared in the project file.
#[derive(Debug, Clone)]
pub struct TemplateAspect {
    eligibility: Vec<(DeclKind, EligibleScenarios, Vec<Requirement>)>,
    skip_unless: Option<Regex>,
    advice: Vec<Advice>,
}

impl TemplateAspect {
    /// Compile regexes and check every body template parses.
    pub fn from_spec(spec: &AspectSpec) -> Result<Self, String> {
        let eligibility = spec
            .eligibility
            .iter()
            .map(compile_eligibility)
            .collect::<Result<Vec<_>, _>>()?;
        let advice = spec
            .advice
            .iter()
            .map(Advice::compile)
            .collect::<Result<Vec<_>, _>>()?;
        for a in &advice {
            if let Some(ref l) = a.layer {
                if !spec.layers.contains(l) {
                    return Err(format!("advice names undeclared layer '{}'", l));
                }
            }
        }
        Ok(Self {
            eligibility,
            skip_unless: compile_regex(&spec.skip_unless, "skip_unless")?,
            advice,
        })
    }
}

impl Aspect for TemplateAspect {
    fn build_eligibility(&self, builder: &mut EligibilityBuilder) {
        for (kind, scenarios, requirements) in &self.eligibility {
            let rule = builder.kind(*kind).scenarios(*scenarios);
            for r in requirements {
                rule.require(r.clone());
            }
        }
    }

    fn build_aspect(&self, ctx: &AdviceContext<'_>) -> AspectOutcome {
        if let Some(ref re) = self.skip_unless {
            if !re.is_match(ctx.target_name()) {
                return AspectOutcome::Skipped;
            }
        }
        let mut out = Vec::new();
        for advice in self.advice.iter().filter(|a| a.layer.as_deref() == ctx.layer_name()) {
            if let Err(e) = advice.apply(ctx, &mut out) {
                return AspectOutcome::Failed(e);
            }
        }
        AspectOutcome::Success(out)
    }
}
