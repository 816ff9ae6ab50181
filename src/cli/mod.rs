//! WF-017: CLI subcommands — init, validate, order, plan, weave, run, drift, status.

use crate::core::diagnostics::{CollectingSink, Diagnostic};
use crate::core::executor::{self, WeaveOptions, WeaveResult};
use crate::core::parser::{self, Project};
use crate::core::planner::PlanAction;
use crate::core::{resolver, state};
use crate::linker::eval::{call_chain, call_linked, Value};
use crate::tripwire::{drift, eventlog};
use clap::Subcommand;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new weft project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate weft.yaml without weaving
    Validate {
        /// Path to weft.yaml
        #[arg(short, long, default_value = "weft.yaml")]
        file: PathBuf,
    },

    /// Show the resolved aspect layer order
    Order {
        #[arg(short, long, default_value = "weft.yaml")]
        file: PathBuf,
    },

    /// Show which aspect instances will run, per unit
    Plan {
        #[arg(short, long, default_value = "weft.yaml")]
        file: PathBuf,
    },

    /// Weave the project and print the linked program
    Weave {
        #[arg(short, long, default_value = "weft.yaml")]
        file: PathBuf,

        /// Only print this unit
        #[arg(short, long)]
        unit: Option<String>,

        /// Do not write the lock file
        #[arg(long)]
        no_lock: bool,

        /// Exit non-zero when any diagnostic is reported
        #[arg(long)]
        strict: bool,
    },

    /// Weave, then call a member through the interpreter and print its trace
    Run {
        #[arg(short, long, default_value = "weft.yaml")]
        file: PathBuf,

        /// Callable as `Type.member`
        target: String,

        /// Arguments (integers, otherwise strings)
        args: Vec<String>,

        /// Evaluate the unlinked override chains instead of the linked output
        #[arg(long)]
        chain: bool,
    },

    /// Detect changed weave output against the lock (tripwire)
    Drift {
        #[arg(short, long, default_value = "weft.yaml")]
        file: PathBuf,

        /// Exit non-zero on any drift (for CI)
        #[arg(long)]
        tripwire: bool,
    },

    /// Show the lock file and recent events
    Status {
        #[arg(short, long, default_value = "weft.yaml")]
        file: PathBuf,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Order { file } => cmd_order(&file),
        Commands::Plan { file } => cmd_plan(&file),
        Commands::Weave {
            file,
            unit,
            no_lock,
            strict,
        } => cmd_weave(&file, unit.as_deref(), no_lock, strict),
        Commands::Run {
            file,
            target,
            args,
            chain,
        } => cmd_run(&file, &target, &args, chain),
        Commands::Drift { file, tripwire } => cmd_drift(&file, tripwire),
        Commands::Status { file } => cmd_status(&file),
    }
}

fn project_dir(file: &Path) -> &Path {
    file.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn print_diagnostics(diagnostics: &[Diagnostic]) {
    for d in diagnostics {
        eprintln!("  {}", d);
    }
}

/// Load a project, printing validation errors and registry diagnostics.
fn load(file: &Path) -> Result<Project, String> {
    let sink = CollectingSink::new();
    let project = parser::load_project(file, &sink);
    print_diagnostics(&sink.diagnostics());
    match project {
        Ok(p) => Ok(p),
        Err(crate::core::error::WeaveError::Validation(errors)) => {
            for e in &errors {
                eprintln!("  ERROR: {}", e);
            }
            Err("validation failed".to_string())
        }
        Err(e) => Err(e.to_string()),
    }
}

fn weave_loaded(project: &Project) -> Result<(WeaveResult, Vec<Diagnostic>), String> {
    let sink = CollectingSink::new();
    let options = WeaveOptions::from_policy(&project.config.name, &project.config.policy);
    let result = executor::weave_project(project, &sink, &options);
    let diagnostics = sink.diagnostics();
    match result {
        Ok(r) => Ok((r, diagnostics)),
        Err(e) => {
            print_diagnostics(&diagnostics);
            Err(e.to_string())
        }
    }
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join("weft.yaml");
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }
    std::fs::create_dir_all(path).map_err(|e| format!("cannot create {}: {}", path.display(), e))?;

    let template = r#"version: "1.0"
name: my-project
description: "Woven by weft"

types:
  Calculator:
    members:
      add:
        params: [a, b]
        body: "return a + b;"
        attributes: [Logged]

aspects:
  Logged:
    advice:
      - kind: override
        body: 'log("$type.$member"); return {{base|inline}}($args);'

policy:
  parallel: true
  inlining: true
  lock_file: true
"#;
    std::fs::write(&config_path, template)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;

    println!("Initialized weft project at {}", path.display());
    println!("  Created: {}", config_path.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let config = parser::parse_project_file(file)?;
    let errors = parser::validate_project(&config);

    if errors.is_empty() {
        let members: usize = config.types.values().map(|t| t.members.len()).sum();
        println!(
            "OK: {} ({} types, {} members, {} aspects)",
            config.name,
            config.types.len(),
            members,
            config.aspects.len()
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

fn cmd_order(file: &Path) -> Result<(), String> {
    let project = load(file)?;
    let instances = executor::collect_instances(&project);
    let sink = CollectingSink::new();
    let order = resolver::build_layer_order(&project.registry, &instances.first_seen(&project.program), &sink);
    print_diagnostics(&sink.diagnostics());
    let order = order?;

    println!("Layer order: {} ({} layers)", project.config.name, order.len());
    for l in &order {
        println!("  {:>3}. {}", l.order, l.layer);
    }
    Ok(())
}

fn cmd_plan(file: &Path) -> Result<(), String> {
    let project = load(file)?;
    let instances = executor::collect_instances(&project);
    let sink = CollectingSink::new();
    let plan = executor::prepare(&project.program, &project.registry, &instances, &sink);
    print_diagnostics(&sink.diagnostics());
    let plan = plan?;

    println!("Planning: {} ({} units)", project.config.name, plan.units.len());
    println!();
    for unit in &plan.units {
        println!("{}:", unit.name);
        if unit.instances.is_empty() {
            println!("    (no aspects)");
        }
        for i in &unit.instances {
            let (symbol, note) = match i.action {
                PlanAction::Apply => ("+", String::new()),
                PlanAction::Excluded => ("-", " (excluded)".to_string()),
                PlanAction::Ineligible(ref why) => ("!", format!(" ({})", why)),
                PlanAction::Disabled(ref why) => ("x", format!(" (disabled: {})", why)),
            };
            println!(
                "  {} {} on {} [{}]{}",
                symbol,
                i.aspect,
                i.location,
                i.aggregated.source(),
                note
            );
        }
    }

    println!();
    println!(
        "Plan: {} to apply, {} excluded, {} ineligible, {} disabled.",
        plan.to_apply, plan.excluded, plan.ineligible, plan.disabled
    );
    Ok(())
}

fn cmd_weave(file: &Path, unit_filter: Option<&str>, no_lock: bool, strict: bool) -> Result<(), String> {
    let project = load(file)?;
    let (result, diagnostics) = weave_loaded(&project)?;
    let dir = project_dir(file);

    for unit in &result.units {
        if unit_filter.map_or(true, |f| f == unit.name) {
            print!("{}", unit.linked.render());
        }
    }
    print_diagnostics(&diagnostics);

    let log = eventlog::event_log_path(dir, project.config.policy.event_log.as_deref());
    eventlog::append_events(&log, &result.events)?;
    if project.config.policy.lock_file && !no_lock {
        state::save_lock(&state::lock_file_path(dir), &result.to_lock())?;
    }

    println!();
    println!(
        "Weave complete: {} units, {} transformations, {} instances applied, {} diagnostic(s) ({:.3}s).",
        result.units.len(),
        result.stats.transformations,
        result.stats.applied,
        diagnostics.len(),
        result.elapsed.as_secs_f64()
    );
    if strict && !diagnostics.is_empty() {
        return Err(format!("{} diagnostic(s)", diagnostics.len()));
    }
    Ok(())
}

fn parse_arg(s: &str) -> Value {
    match s.parse::<i64>() {
        Ok(n) => Value::Int(n),
        Err(_) => Value::Str(s.to_string()),
    }
}

fn cmd_run(file: &Path, target: &str, args: &[String], chain: bool) -> Result<(), String> {
    let (type_name, member) = target
        .split_once('.')
        .ok_or_else(|| format!("target must be Type.member, got '{}'", target))?;
    let project = load(file)?;
    let (result, diagnostics) = weave_loaded(&project)?;
    print_diagnostics(&diagnostics);
    let unit = result
        .unit(type_name)
        .ok_or_else(|| format!("unknown type '{}'", type_name))?;

    let args: Vec<Value> = args.iter().map(|a| parse_arg(a)).collect();
    let (value, trace) = if chain {
        call_chain(&unit.snapshot, member, args)
    } else {
        call_linked(&unit.linked, member, args)
    }
    .map_err(|e| e.to_string())?;

    for line in &trace {
        println!("  > {}", line);
    }
    println!("{} = {}", target, value);
    Ok(())
}

fn cmd_drift(file: &Path, tripwire_mode: bool) -> Result<(), String> {
    let dir = project_dir(file);
    let lock_path = state::lock_file_path(dir);
    let locked = state::load_lock(&lock_path)?
        .ok_or_else(|| format!("no lock file at {} (run `weft weave` first)", lock_path.display()))?;

    let project = load(file)?;
    let (result, _) = weave_loaded(&project)?;
    let fresh = result.to_lock();

    println!("Checking {} ({} units)...", locked.project, locked.units.len());
    let findings = drift::detect_drift(&locked, &fresh);
    if findings.is_empty() {
        println!("No drift detected.");
        return Ok(());
    }

    for f in &findings {
        println!("  DRIFTED: {} ({})", f.unit, f.detail);
        println!("    Expected: {}", f.expected_hash);
        println!("    Actual:   {}", f.actual_hash);
    }
    let events: Vec<_> = findings.iter().map(|f| f.to_event()).collect();
    let log = eventlog::event_log_path(dir, project.config.policy.event_log.as_deref());
    eventlog::append_events(&log, &events)?;

    println!();
    println!("Drift detected: {} finding(s)", findings.len());
    if tripwire_mode {
        return Err(format!("{} drift finding(s)", findings.len()));
    }
    Ok(())
}

fn cmd_status(file: &Path) -> Result<(), String> {
    let dir = project_dir(file);
    let Some(lock) = state::load_lock(&state::lock_file_path(dir))? else {
        println!("No lock file found.");
        return Ok(());
    };

    println!("Project: {}", lock.project);
    println!("  Generated:   {}", lock.generated_at);
    println!("  Generator:   {}", lock.generator);
    println!("  Fingerprint: {}", drift::weave_fingerprint(&lock));
    println!("  Layers:      {}", lock.layer_order.join(" < "));
    println!("  Units:       {}", lock.units.len());
    for (name, u) in &lock.units {
        println!(
            "    {}: {} ({} members, {} synthetic, {} transformations)",
            name, u.status, u.members, u.synthetic, u.transformations
        );
    }

    let configured = parser::parse_project_file(file)
        .ok()
        .and_then(|c| c.policy.event_log);
    let events = eventlog::read_events(&eventlog::event_log_path(dir, configured.as_deref()))?;
    if let Some(last) = events.last() {
        println!("  Events:      {} (last at {})", events.len(), last.ts);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROJECT: &str = r#"
version: "1.0"
name: calc
types:
  Calc:
    members:
      f:
        params: [x]
        body: "return x * 2;"
        attributes: [First, Second]
aspects:
  First:
    run_before: [Second]
    advice:
      - kind: override
        body: 'log("first"); return {{base}}(x);'
  Second:
    advice:
      - kind: override
        body: 'log("second"); return {{base}}(x + 1);'
"#;

    fn project() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("weft.yaml");
        std::fs::write(&file, PROJECT).unwrap();
        (dir, file)
    }

    #[test]
    fn test_wf017_init() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("new-project");
        cmd_init(&sub).unwrap();
        let file = sub.join("weft.yaml");
        assert!(file.exists());
        cmd_validate(&file).unwrap();
        cmd_weave(&file, None, false, true).unwrap();
    }

    #[test]
    fn test_wf017_init_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("weft.yaml"), "exists").unwrap();
        assert!(cmd_init(dir.path()).is_err());
    }

    #[test]
    fn test_wf017_validate_valid() {
        let (_dir, file) = project();
        cmd_validate(&file).unwrap();
    }

    #[test]
    fn test_wf017_validate_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("weft.yaml");
        std::fs::write(&file, "version: \"2.0\"\nname: \"\"\n").unwrap();
        assert_eq!(cmd_validate(&file).unwrap_err(), "2 validation error(s)");
    }

    #[test]
    fn test_wf017_order_and_plan() {
        let (_dir, file) = project();
        cmd_order(&file).unwrap();
        cmd_plan(&file).unwrap();
    }

    #[test]
    fn test_wf017_order_cycle_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("weft.yaml");
        let cyclic = PROJECT.replace("advice:\n      - kind: override\n        body: 'log(\"second\")", "run_before: [First]\n    advice:\n      - kind: override\n        body: 'log(\"second\")");
        std::fs::write(&file, cyclic).unwrap();
        assert!(cmd_order(&file).unwrap_err().contains("layer ordering failed"));
    }

    #[test]
    fn test_wf017_weave_writes_lock_and_events() {
        let (dir, file) = project();
        cmd_weave(&file, None, false, true).unwrap();
        let lock = state::load_lock(&state::lock_file_path(dir.path())).unwrap().unwrap();
        assert_eq!(lock.layer_order, vec!["First", "Second"]);
        assert_eq!(lock.units["Calc"].synthetic, 2);
        let events = eventlog::read_events(&dir.path().join(eventlog::EVENT_LOG)).unwrap();
        assert!(events.len() >= 4);
    }

    #[test]
    fn test_wf017_weave_no_lock() {
        let (dir, file) = project();
        cmd_weave(&file, Some("Calc"), true, false).unwrap();
        assert!(!state::lock_file_path(dir.path()).exists());
    }

    #[test]
    fn test_wf017_run() {
        let (_dir, file) = project();
        cmd_run(&file, "Calc.f", &["3".to_string()], false).unwrap();
        cmd_run(&file, "Calc.f", &["3".to_string()], true).unwrap();
        assert!(cmd_run(&file, "Calc", &[], false).is_err());
        assert!(cmd_run(&file, "Nope.f", &[], false).is_err());
        assert!(cmd_run(&file, "Calc.f", &[], false).is_err());
    }

    #[test]
    fn test_wf017_parse_arg() {
        assert_eq!(parse_arg("42"), Value::Int(42));
        assert_eq!(parse_arg("-1"), Value::Int(-1));
        assert_eq!(parse_arg("abc"), Value::Str("abc".to_string()));
    }

    #[test]
    fn test_wf017_drift_requires_lock() {
        let (_dir, file) = project();
        assert!(cmd_drift(&file, true).unwrap_err().contains("no lock file"));
    }

    #[test]
    fn test_wf017_drift_clean_then_changed() {
        let (_dir, file) = project();
        cmd_weave(&file, None, false, false).unwrap();
        cmd_drift(&file, true).unwrap();

        std::fs::write(&file, PROJECT.replace("return x * 2;", "return x * 3;")).unwrap();
        assert!(cmd_drift(&file, true).unwrap_err().contains("drift finding"));
        cmd_drift(&file, false).unwrap();
    }

    #[test]
    fn test_wf017_status() {
        let (_dir, file) = project();
        cmd_status(&file).unwrap();
        cmd_weave(&file, None, false, false).unwrap();
        cmd_status(&file).unwrap();
    }

    #[test]
    fn test_wf017_dispatch() {
        let (_dir, file) = project();
        dispatch(Commands::Validate { file: file.clone() }).unwrap();
        dispatch(Commands::Weave {
            file: file.clone(),
            unit: None,
            no_lock: false,
            strict: true,
        })
        .unwrap();
        dispatch(Commands::Status { file }).unwrap();
    }
}
