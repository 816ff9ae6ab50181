//! WF-002: YAML parsing, validation, and model construction.
//!
//! Parses weft.yaml and validates structural constraints:
//! - Version must be "1.0"
//! - Bases, overridden members, attributes and exclusions must resolve
//! - Facet bodies must match the member kind and parse
//! - Aspect ordering selectors, regexes and advice templates must compile
//!
//! A valid config is then turned into the program model, the instance rules,
//! and the frozen aspect registry.

use super::aggregate::InstanceRule;
use super::diagnostics::DiagnosticSink;
use super::error::WeaveError;
use super::registry::{AspectClassBuilder, AspectRegistry, LayerPick, LayerSelector, RegistryBuilder};
use super::types::*;
use crate::aspects::TemplateAspect;
use crate::invoke::{AnyInvoker, Invoker};
use crate::model::syntax::Body;
use crate::model::{DeclFlags, DeclKind, Modifiers, Program};
use regex::Regex;
use std::path::Path;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a weft.yaml file from disk.
pub fn parse_project_file(path: &Path) -> Result<ProjectConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_project(&content)
}

/// Parse a weft.yaml from a string.
pub fn parse_project(yaml: &str) -> Result<ProjectConfig, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_project(config: &ProjectConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut err = |message: String| errors.push(ValidationError { message });

    if config.version != "1.0" {
        err(format!("version must be \"1.0\", got \"{}\"", config.version));
    }
    if config.name.is_empty() {
        err("name must not be empty".to_string());
    }

    for (type_name, ty) in &config.types {
        if let Some(ref base) = ty.base {
            if !config.types.contains_key(base) {
                err(format!("type '{}' has unknown base '{}'", type_name, base));
            } else if base_chain_cycles(config, type_name) {
                err(format!("type '{}' has a cyclic base chain", type_name));
            }
        }
        for a in ty.attributes.iter().chain(&ty.excludes) {
            if !config.aspects.contains_key(a) {
                err(format!("type '{}' names unknown aspect '{}'", type_name, a));
            }
        }

        for (member_name, m) in &ty.members {
            let at = format!("{}.{}", type_name, member_name);
            if m.kind == DeclKind::Type {
                err(format!("member '{}' cannot be a nested type", at));
            }
            for a in m.attributes.iter().chain(&m.excludes) {
                if !config.aspects.contains_key(a) {
                    err(format!("member '{}' names unknown aspect '{}'", at, a));
                }
            }
            for (facet, src) in m.facet_sources() {
                if !m.kind.facets().contains(&facet) {
                    err(format!("member '{}' ({}) has no {} facet", at, m.kind, facet));
                } else {
                    match Body::parse(src) {
                        Err(e) => err(format!("member '{}' {} body: {}", at, facet, e)),
                        Ok(body) if body.has_references() => err(format!(
                            "member '{}' {} body: aspect references are only allowed in advice",
                            at, facet
                        )),
                        Ok(_) => {}
                    }
                }
            }
            if let Some(ref target) = m.overrides {
                match resolve_member(config, target) {
                    None => err(format!("member '{}' overrides unknown member '{}'", at, target)),
                    Some(other) if other.kind != m.kind => err(format!(
                        "member '{}' ({}) overrides '{}' of a different kind ({})",
                        at, m.kind, target, other.kind
                    )),
                    Some(_) => {}
                }
            }
        }
    }

    for (aspect_name, spec) in &config.aspects {
        if aspect_name.is_empty() || aspect_name.contains(':') {
            err(format!("invalid aspect name '{}'", aspect_name));
        }
        if let Some(ref base) = spec.extends {
            if !config.aspects.contains_key(base) {
                err(format!("aspect '{}' extends unknown aspect '{}'", aspect_name, base));
            }
        }
        for sel in spec.run_before.iter().chain(&spec.run_after) {
            if let Err(e) = check_selector(config, sel) {
                err(format!("aspect '{}': {}", aspect_name, e));
            }
        }
        if let Err(e) = TemplateAspect::from_spec(spec) {
            err(format!("aspect '{}': {}", aspect_name, e));
        }
        for advice in &spec.advice {
            if let Some(ref child) = advice.aspect {
                if !config.aspects.contains_key(child) {
                    err(format!("aspect '{}' adds unknown aspect '{}'", aspect_name, child));
                }
            }
        }
    }

    for (i, rule) in config.rules.iter().enumerate() {
        if !config.aspects.contains_key(&rule.aspect) {
            err(format!("rule {} names unknown aspect '{}'", i, rule.aspect));
        }
        for pattern in rule.types.iter().chain(&rule.members) {
            if let Err(e) = Regex::new(pattern) {
                err(format!("rule {}: invalid regex '{}': {}", i, pattern, e));
            }
        }
    }

    errors
}

/// `Type.member` lookup in the raw config.
fn resolve_member<'a>(config: &'a ProjectConfig, qualified: &str) -> Option<&'a MemberDecl> {
    let (ty, member) = qualified.split_once('.')?;
    config.types.get(ty)?.members.get(member)
}

fn base_chain_cycles(config: &ProjectConfig, start: &str) -> bool {
    let mut cursor = Some(start);
    for _ in 0..=config.types.len() {
        cursor = cursor.and_then(|t| config.types.get(t)).and_then(|t| t.base.as_deref());
        match cursor {
            None => return false,
            Some(t) if t == start => return true,
            Some(_) => {}
        }
    }
    true
}

fn check_selector(config: &ProjectConfig, s: &str) -> Result<(), String> {
    let sel = LayerSelector::parse(s)?;
    let spec = config
        .aspects
        .get(&sel.aspect)
        .ok_or_else(|| format!("ordering names unknown aspect '{}'", sel.aspect))?;
    if let LayerPick::Named(ref l) = sel.pick {
        if !spec.layers.contains(l) {
            return Err(format!("ordering names unknown layer '{}'", s));
        }
    }
    Ok(())
}

/// Build the program model. Types and members keep file order.
pub fn build_program(config: &ProjectConfig) -> Result<Program, WeaveError> {
    let mut program = Program::new();
    for (type_name, spec) in &config.types {
        let ty = program.add_type(type_name);
        if let Some(decl) = program.get_mut(ty) {
            decl.attributes = spec.attributes.clone();
            decl.exclusions = spec.excludes.clone();
            decl.interfaces = spec.interfaces.clone();
        }
        for (member_name, m) in &spec.members {
            let id = program
                .add_member(ty, member_name, m.kind)
                .ok_or_else(|| WeaveError::internal(format!("type '{}' missing from program", type_name)))?;
            let mut bodies = Vec::new();
            for (facet, src) in m.facet_sources() {
                let body = Body::parse(src)
                    .map_err(|e| WeaveError::Parse(format!("{}.{} {} body: {}", type_name, member_name, facet, e)))?;
                bodies.push((facet, body));
            }
            let Some(decl) = program.get_mut(id) else {
                continue;
            };
            decl.params = m.params.clone();
            let mut modifiers = Modifiers::empty();
            modifiers.set(Modifiers::PUBLIC, m.public);
            modifiers.set(Modifiers::STATIC, m.is_static);
            modifiers.set(Modifiers::ABSTRACT, m.is_abstract);
            decl.modifiers = modifiers;
            decl.flags.set(DeclFlags::NOT_INLINEABLE, m.not_inlineable);
            decl.flags.set(DeclFlags::NOT_DISCARDABLE, m.not_discardable);
            decl.attributes = m.attributes.clone();
            decl.exclusions = m.excludes.clone();
            decl.bodies = bodies;
        }
    }

    // Relations need every declaration to exist first.
    for (type_name, spec) in &config.types {
        let Some(ty) = program.find_type(type_name).map(|d| d.id) else {
            continue;
        };
        if let Some(ref base) = spec.base {
            let base = program
                .find_type(base)
                .map(|d| d.id)
                .ok_or_else(|| WeaveError::Parse(format!("type '{}' has unknown base '{}'", type_name, base)))?;
            program.set_base(ty, base);
        }
        for (member_name, m) in &spec.members {
            let Some(ref target) = m.overrides else {
                continue;
            };
            let overridden = target
                .split_once('.')
                .and_then(|(t, n)| {
                    let owner = program.find_type(t)?.id;
                    program.find_member(owner, n).map(|d| d.id)
                })
                .ok_or_else(|| WeaveError::Parse(format!("unknown overridden member '{}'", target)))?;
            if let Some(member) = program.find_member(ty, member_name).map(|d| d.id) {
                program.set_overrides(member, overridden);
            }
        }
    }
    tracing::debug!(declarations = program.declarations().count(), "program model built");
    Ok(program)
}

/// Compile the project's implicit instance rules.
pub fn build_rules(config: &ProjectConfig) -> Result<Vec<InstanceRule>, WeaveError> {
    let compile = |p: &Option<String>| -> Result<Option<Regex>, WeaveError> {
        p.as_deref()
            .map(|p| Regex::new(p).map_err(|e| WeaveError::Parse(format!("invalid regex '{}': {}", p, e))))
            .transpose()
    };
    config
        .rules
        .iter()
        .map(|r| {
            Ok(InstanceRule {
                aspect: r.aspect.clone(),
                kinds: r.kinds.clone(),
                types: compile(&r.types)?,
                members: compile(&r.members)?,
            })
        })
        .collect()
}

/// Register every declared aspect and its ordering, then freeze.
pub fn build_registry<I: Invoker>(
    config: &ProjectConfig,
    invoker: &I,
    sink: &dyn DiagnosticSink,
) -> Result<AspectRegistry, WeaveError> {
    let mut builder = RegistryBuilder::new();
    for (name, spec) in &config.aspects {
        let aspect = TemplateAspect::from_spec(spec)
            .map_err(|e| WeaveError::Parse(format!("aspect '{}': {}", name, e)))?;
        let mut class = AspectClassBuilder::new(name, aspect).inheritable(spec.inheritable);
        for layer in &spec.layers {
            class = class.layer(layer);
        }
        if let Some(ref base) = spec.extends {
            class = class.extends(base);
        }
        builder.register(class);
    }
    for (name, spec) in &config.aspects {
        for other in &spec.run_before {
            builder.run_before(name, other)?;
        }
        for other in &spec.run_after {
            builder.run_after(name, other)?;
        }
    }
    builder.build(invoker, sink)
}

/// A loaded project: config plus everything built from it.
pub struct Project {
    pub config: ProjectConfig,
    pub program: Program,
    pub rules: Vec<InstanceRule>,
    pub registry: AspectRegistry,
    pub invoker: AnyInvoker,
}

/// Parse, validate and build a project from a config already in memory.
pub fn load_project_config(config: ProjectConfig, sink: &dyn DiagnosticSink) -> Result<Project, WeaveError> {
    let errors = validate_project(&config);
    if !errors.is_empty() {
        return Err(WeaveError::Validation(errors.into_iter().map(|e| e.message).collect()));
    }
    let invoker = AnyInvoker::from_policy(config.policy.guarded, config.policy.invoke_budget_ms);
    let program = build_program(&config)?;
    let rules = build_rules(&config)?;
    let registry = build_registry(&config, &invoker, sink)?;
    Ok(Project {
        config,
        program,
        rules,
        registry,
        invoker,
    })
}

/// Parse, validate and build a project from disk.
pub fn load_project(path: &Path, sink: &dyn DiagnosticSink) -> Result<Project, WeaveError> {
    let config = parse_project_file(path).map_err(WeaveError::Parse)?;
    load_project_config(config, sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diagnostics::CollectingSink;
    use crate::model::syntax::Facet;

    const SAMPLE: &str = r#"
version: "1.0"
name: bank
types:
  Account:
    attributes: [Audit]
    members:
      balance:
        kind: field
      deposit:
        params: [amount]
        body: "return amount;"
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
    layers: [late]
    run_before: [Cache]
    advice:
      - kind: override
        members: "^deposit$"
        body: 'log("$member"); return {{base}}($args);'
  Cache: {}
rules:
  - aspect: Cache
    kinds: [method]
    members: "^dep"
"#;

    #[test]
    fn test_wf002_parse_valid() {
        let config = parse_project(SAMPLE).unwrap();
        assert_eq!(config.name, "bank");
        assert_eq!(config.types.len(), 2);
        assert_eq!(config.aspects["Audit"].layers, vec!["late"]);
        assert!(validate_project(&config).is_empty());
    }

    #[test]
    fn test_wf002_parse_invalid_yaml() {
        let err = parse_project("version: [").unwrap_err();
        assert!(err.contains("YAML parse error"));
    }

    #[test]
    fn test_wf002_validate_bad_version() {
        let mut config = parse_project(SAMPLE).unwrap();
        config.version = "2.0".to_string();
        let errors = validate_project(&config);
        assert!(errors.iter().any(|e| e.message.contains("version")));
    }

    #[test]
    fn test_wf002_validate_unknown_references() {
        let yaml = r#"
version: "1.0"
name: broken
types:
  A:
    base: Missing
    attributes: [Nope]
    members:
      f:
        overrides: B.g
        excludes: [Ghost]
aspects:
  X:
    run_after: ["Y:late"]
rules:
  - aspect: Z
    members: "("
"#;
        let errors: Vec<String> = validate_project(&parse_project(yaml).unwrap())
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert!(errors.iter().any(|e| e.contains("unknown base 'Missing'")));
        assert!(errors.iter().any(|e| e.contains("unknown aspect 'Nope'")));
        assert!(errors.iter().any(|e| e.contains("unknown aspect 'Ghost'")));
        assert!(errors.iter().any(|e| e.contains("overrides unknown member 'B.g'")));
        assert!(errors.iter().any(|e| e.contains("unknown aspect 'Y'")));
        assert!(errors.iter().any(|e| e.contains("rule 0 names unknown aspect 'Z'")));
        assert!(errors.iter().any(|e| e.contains("invalid regex")));
    }

    #[test]
    fn test_wf002_validate_facets_and_bodies() {
        let yaml = r#"
version: "1.0"
name: facets
types:
  A:
    members:
      count:
        kind: field
        body: "return 1;"
      total:
        kind: property
        get: "return (1;"
"#;
        let errors = validate_project(&parse_project(yaml).unwrap());
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("has no body facet"));
        assert!(errors[1].message.contains("get body"));
    }

    #[test]
    fn test_wf002_source_body_reference_rejected() {
        let yaml = r#"
version: "1.0"
name: refs
types:
  Calc:
    members:
      f:
        params: [x]
        body: "return {{base}}(x);"
      g:
        body: "return {{base@f}}(1);"
  Other:
    members:
      h:
        body: "return 1;"
"#;
        let config = parse_project(yaml).unwrap();
        let errors = validate_project(&config);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.starts_with("member 'Calc.f' "));
        assert!(errors[0].message.ends_with("aspect references are only allowed in advice"));
        assert!(errors[1].message.contains("member 'Calc.g'"));

        let sink = CollectingSink::new();
        match load_project_config(config, &sink) {
            Err(WeaveError::Validation(messages)) => assert_eq!(messages.len(), 2),
            Err(e) => panic!("expected validation error, got {e}"),
            Ok(_) => panic!("expected validation error"),
        }
    }

    #[test]
    fn test_wf002_validate_base_cycle() {
        let yaml = r#"
version: "1.0"
name: cycle
types:
  A: { base: B }
  B: { base: A }
"#;
        let errors = validate_project(&parse_project(yaml).unwrap());
        assert!(errors.iter().any(|e| e.message.contains("cyclic base chain")));
    }

    #[test]
    fn test_wf002_build_program() {
        let config = parse_project(SAMPLE).unwrap();
        let program = build_program(&config).unwrap();
        let account = program.find_type("Account").unwrap().id;
        let savings = program.find_type("Savings").unwrap().id;
        assert_eq!(program.base_of(savings), Some(account));

        let deposit = program.find_member(account, "deposit").unwrap();
        assert_eq!(deposit.params, vec!["amount"]);
        assert!(deposit.body(Facet::Body).is_some());
        let over = program.find_member(savings, "deposit").unwrap().id;
        assert_eq!(program.overridden_by(deposit.id), vec![over]);
        assert_eq!(program.get(account).unwrap().attributes, vec!["Audit"]);
    }

    #[test]
    fn test_wf002_load_project() {
        let sink = CollectingSink::new();
        let project = load_project_config(parse_project(SAMPLE).unwrap(), &sink).unwrap();
        assert_eq!(project.registry.len(), 2);
        assert_eq!(project.rules.len(), 1);
        assert!(project.registry.by_name("Audit").unwrap().inheritable);
        assert_eq!(project.registry.layer_edges().len(), 2);
        assert!(sink.diagnostics().is_empty());
    }

    #[test]
    fn test_wf002_load_rejects_invalid() {
        let mut config = parse_project(SAMPLE).unwrap();
        config.rules[0].aspect = "Unknown".to_string();
        let sink = CollectingSink::new();
        match load_project_config(config, &sink) {
            Err(WeaveError::Validation(errors)) => assert_eq!(errors.len(), 1),
            other => panic!("expected validation error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_wf002_load_project_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weft.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        let sink = CollectingSink::new();
        let project = load_project(&path, &sink).unwrap();
        assert_eq!(project.config.name, "bank");
        assert!(load_project(&dir.path().join("missing.yaml"), &sink).is_err());
    }
}
