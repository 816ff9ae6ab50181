//! WF-006: Eligibility gate — per-kind rules built once per aspect class.
//!
//! Each rule covers one declaration kind and yields the set of scenarios in
//! which the aspect may apply. Rules for the same kind combine by
//! intersection; a class that declares rules is ineligible for kinds none of
//! them name.

use crate::model::{DeclKind, Declaration, Modifiers};
use bitflags::bitflags;
use regex::Regex;
use std::fmt;

bitflags! {
    /// Scenarios in which an aspect may be applied.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EligibleScenarios: u8 {
        /// Fresh application (attribute, rule, or child aspect).
        const DEFAULT = 0b0001;
        /// Propagated from a base declaration.
        const INHERITANCE = 0b0010;
        const ALL = Self::DEFAULT.bits() | Self::INHERITANCE.bits();
    }
}

impl fmt::Display for EligibleScenarios {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::DEFAULT) {
            names.push("default");
        }
        if self.contains(Self::INHERITANCE) {
            names.push("inheritance");
        }
        if names.is_empty() {
            names.push("none");
        }
        f.write_str(&names.join("|"))
    }
}

/// The view of a declaration eligibility looks at.
#[derive(Debug, Clone, Copy)]
pub struct Subject<'a> {
    pub name: &'a str,
    pub kind: DeclKind,
    pub modifiers: Modifiers,
    pub arity: usize,
}

impl<'a> From<&'a Declaration> for Subject<'a> {
    fn from(decl: &'a Declaration) -> Self {
        Self {
            name: &decl.name,
            kind: decl.kind,
            modifiers: decl.modifiers,
            arity: decl.params.len(),
        }
    }
}

/// A predicate a rule requires of the declaration.
#[derive(Debug, Clone)]
pub enum Requirement {
    NotStatic,
    Static,
    NotAbstract,
    Public,
    MinParams(usize),
    NameMatches(Regex),
}

impl Requirement {
    /// `Err(justification)` when the subject does not satisfy the requirement.
    fn check(&self, subject: &Subject<'_>) -> Result<(), String> {
        let ok = match self {
            Self::NotStatic => !subject.modifiers.contains(Modifiers::STATIC),
            Self::Static => subject.modifiers.contains(Modifiers::STATIC),
            Self::NotAbstract => !subject.modifiers.contains(Modifiers::ABSTRACT),
            Self::Public => subject.modifiers.contains(Modifiers::PUBLIC),
            Self::MinParams(n) => subject.arity >= *n,
            Self::NameMatches(re) => re.is_match(subject.name),
        };
        if ok {
            return Ok(());
        }
        Err(match self {
            Self::NotStatic => format!("{} '{}' must not be static", subject.kind, subject.name),
            Self::Static => format!("{} '{}' must be static", subject.kind, subject.name),
            Self::NotAbstract => format!("{} '{}' must not be abstract", subject.kind, subject.name),
            Self::Public => format!("{} '{}' must be public", subject.kind, subject.name),
            Self::MinParams(n) => format!(
                "{} '{}' must have at least {} parameter(s), has {}",
                subject.kind, subject.name, n, subject.arity
            ),
            Self::NameMatches(re) => format!(
                "{} '{}' must have a name matching /{}/",
                subject.kind,
                subject.name,
                re.as_str()
            ),
        })
    }
}

/// One per-kind rule.
#[derive(Debug, Clone)]
pub struct EligibilityRule {
    pub kind: DeclKind,
    pub scenarios: EligibleScenarios,
    pub requirements: Vec<Requirement>,
}

impl EligibilityRule {
    pub fn scenarios(&mut self, scenarios: EligibleScenarios) -> &mut Self {
        self.scenarios = scenarios;
        self
    }

    pub fn require(&mut self, requirement: Requirement) -> &mut Self {
        self.requirements.push(requirement);
        self
    }

    /// Scenarios this rule grants, or the justification of its first failing requirement.
    fn evaluate(&self, subject: &Subject<'_>) -> Result<EligibleScenarios, String> {
        for req in &self.requirements {
            req.check(subject)?;
        }
        Ok(self.scenarios)
    }
}

/// Handed to an aspect once, when its class is registered.
#[derive(Debug, Default)]
pub struct EligibilityBuilder {
    rules: Vec<EligibilityRule>,
}

impl EligibilityBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a rule for `kind`, eligible in every scenario until narrowed.
    pub fn kind(&mut self, kind: DeclKind) -> &mut EligibilityRule {
        self.rules.push(EligibilityRule {
            kind,
            scenarios: EligibleScenarios::ALL,
            requirements: Vec::new(),
        });
        let last = self.rules.len() - 1;
        &mut self.rules[last]
    }

    pub fn build(self) -> EligibilityRules {
        EligibilityRules { rules: self.rules }
    }
}

/// Result of evaluating every applicable rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub scenarios: EligibleScenarios,
    /// Justification from the first failing rule, if any rule failed.
    pub justification: Option<String>,
}

/// Frozen rule set of one aspect class.
#[derive(Debug, Clone, Default)]
pub struct EligibilityRules {
    rules: Vec<EligibilityRule>,
}

impl EligibilityRules {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Kinds named by at least one rule, in first-declaration order.
    pub fn supported_kinds(&self) -> Vec<DeclKind> {
        let mut kinds = Vec::new();
        for rule in &self.rules {
            if !kinds.contains(&rule.kind) {
                kinds.push(rule.kind);
            }
        }
        kinds
    }

    pub fn evaluate(&self, subject: &Subject<'_>) -> Evaluation {
        if self.rules.is_empty() {
            return Evaluation {
                scenarios: EligibleScenarios::ALL,
                justification: None,
            };
        }

        let mut applicable = self.rules.iter().filter(|r| r.kind == subject.kind).peekable();
        if applicable.peek().is_none() {
            let supported: Vec<String> = self
                .supported_kinds()
                .iter()
                .map(|k| k.to_string())
                .collect();
            return Evaluation {
                scenarios: EligibleScenarios::empty(),
                justification: Some(format!(
                    "{} '{}' is not a supported target (supported: {})",
                    subject.kind,
                    subject.name,
                    supported.join(", ")
                )),
            };
        }

        let mut scenarios = EligibleScenarios::ALL;
        let mut justification = None;
        for rule in applicable {
            match rule.evaluate(subject) {
                Ok(granted) => scenarios &= granted,
                Err(why) => {
                    scenarios = EligibleScenarios::empty();
                    justification.get_or_insert(why);
                }
            }
        }
        Evaluation {
            scenarios,
            justification,
        }
    }

    /// Gate: `Err(justification)` unless every scenario in `required` is granted.
    pub fn check(&self, subject: &Subject<'_>, required: EligibleScenarios) -> Result<(), String> {
        let eval = self.evaluate(subject);
        if eval.scenarios.contains(required) {
            return Ok(());
        }
        Err(eval.justification.unwrap_or_else(|| {
            format!(
                "{} '{}' is eligible for {} only, {} required",
                subject.kind, subject.name, eval.scenarios, required
            )
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(kind: DeclKind, modifiers: Modifiers, arity: usize) -> Subject<'static> {
        Subject {
            name: "target",
            kind,
            modifiers,
            arity,
        }
    }

    #[test]
    fn test_wf006_no_rules_means_everywhere() {
        let rules = EligibilityBuilder::new().build();
        let s = subject(DeclKind::Field, Modifiers::PUBLIC, 0);
        assert!(rules.check(&s, EligibleScenarios::DEFAULT).is_ok());
    }

    #[test]
    fn test_wf006_unsupported_kind() {
        let mut b = EligibilityBuilder::new();
        b.kind(DeclKind::Method);
        let rules = b.build();
        let err = rules
            .check(&subject(DeclKind::Field, Modifiers::PUBLIC, 0), EligibleScenarios::DEFAULT)
            .unwrap_err();
        assert!(err.contains("not a supported target"));
        assert!(err.contains("method"));
    }

    #[test]
    fn test_wf006_requirement_failure_justifies() {
        let mut b = EligibilityBuilder::new();
        b.kind(DeclKind::Method).require(Requirement::NotStatic);
        let rules = b.build();
        let s = subject(DeclKind::Method, Modifiers::PUBLIC | Modifiers::STATIC, 0);
        let err = rules.check(&s, EligibleScenarios::DEFAULT).unwrap_err();
        assert_eq!(err, "method 'target' must not be static");
    }

    #[test]
    fn test_wf006_rules_intersect() {
        let mut b = EligibilityBuilder::new();
        b.kind(DeclKind::Method);
        b.kind(DeclKind::Method).scenarios(EligibleScenarios::DEFAULT);
        let rules = b.build();
        let s = subject(DeclKind::Method, Modifiers::PUBLIC, 1);
        let eval = rules.evaluate(&s);
        assert_eq!(eval.scenarios, EligibleScenarios::DEFAULT);
        assert!(rules.check(&s, EligibleScenarios::DEFAULT).is_ok());
        let err = rules.check(&s, EligibleScenarios::INHERITANCE).unwrap_err();
        assert!(err.contains("eligible for default only"));
    }

    #[test]
    fn test_wf006_first_failing_rule_wins() {
        let mut b = EligibilityBuilder::new();
        b.kind(DeclKind::Method).require(Requirement::MinParams(2));
        b.kind(DeclKind::Method)
            .require(Requirement::NameMatches(Regex::new("^get_").unwrap()));
        let rules = b.build();
        let err = rules
            .check(&subject(DeclKind::Method, Modifiers::PUBLIC, 0), EligibleScenarios::DEFAULT)
            .unwrap_err();
        assert!(err.contains("at least 2 parameter(s)"));
    }

    #[test]
    fn test_wf006_scenarios_display() {
        assert_eq!(EligibleScenarios::ALL.to_string(), "default|inheritance");
        assert_eq!(EligibleScenarios::empty().to_string(), "none");
    }
}
