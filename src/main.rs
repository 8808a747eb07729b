use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use phasegate::conflict::{ExecutionPlan, ParallelGroup};
use phasegate::evidence::{ComplianceReport, InvocationId, InvocationStatus};
use phasegate::gate::{Check, Gate, GateResult};
use phasegate::namespace::{NamespaceId, TaskNamespace};
use phasegate::paths::resolve_store_root;
use phasegate::phase::TransitionEvidence;
use phasegate::{PhaseGate, PhaseGateError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const LONG_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("PHASEGATE_GIT_SHA"), ")");

#[derive(Parser)]
#[command(name = "phasegate")]
#[command(about = "Phase-gated orchestration for concurrent agent tasks")]
#[command(version, long_version = LONG_VERSION)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Store root (defaults to $PHASEGATE_HOME, then ./.phasegate)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Repository the gates inspect (defaults to the store's parent)
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Increase diagnostic output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a task namespace in the first configured phase
    Create {
        /// What the task is about
        #[arg(short, long)]
        description: String,
        /// Branch the task works on
        #[arg(short, long, default_value = "main")]
        branch: String,
        /// Parent namespace id
        #[arg(long, value_parser = parse_id)]
        parent: Option<NamespaceId>,
    },
    /// Show a namespace with its phase and tombstone
    Show {
        #[arg(value_parser = parse_id)]
        id: NamespaceId,
    },
    /// List namespaces (active only unless --all)
    List {
        #[arg(long)]
        all: bool,
    },
    /// Archive a namespace; its history stays on disk
    Tombstone {
        #[arg(value_parser = parse_id)]
        id: NamespaceId,
        #[arg(short, long)]
        reason: String,
        /// Who archived it (defaults to the signer identity)
        #[arg(long)]
        by: Option<String>,
    },
    /// Mark a namespace as completed
    Complete {
        #[arg(value_parser = parse_id)]
        id: NamespaceId,
    },
    /// Show the current phase and its history
    Phase {
        #[arg(value_parser = parse_id)]
        id: NamespaceId,
    },
    /// Move a namespace to the next phase
    Advance {
        #[arg(value_parser = parse_id)]
        id: NamespaceId,
        /// Target phase
        to: String,
        /// Allow skipping or rolling back; recorded as a compliance exception
        #[arg(long = "override")]
        override_: bool,
        /// Justification stored with the transition
        #[arg(long)]
        note: Option<String>,
        /// Signed gate file for the phase being left
        #[arg(long)]
        gate: Option<PathBuf>,
    },
    /// Run the gate checks for a phase (current phase by default)
    Validate {
        #[arg(value_parser = parse_id)]
        id: NamespaceId,
        #[arg(long)]
        phase: Option<String>,
    },
    /// Validate and sign the gate for a phase (current phase by default)
    Sign {
        #[arg(value_parser = parse_id)]
        id: NamespaceId,
        #[arg(long)]
        phase: Option<String>,
    },
    /// Verify a stored gate, or a gate file
    Verify {
        #[arg(value_parser = parse_id, required_unless_present = "file")]
        id: Option<NamespaceId>,
        #[arg(long)]
        phase: Option<String>,
        /// Gate JSON to verify instead of the stored one
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Plan parallel groups from a YAML list
    Plan {
        groups: PathBuf,
    },
    /// Check whether a group may start while others are running
    Admit {
        /// YAML list with the candidate and the running groups
        groups: PathBuf,
        candidate: String,
        #[arg(long, num_args = 0..)]
        running: Vec<String>,
    },
    /// Record agent invocation evidence
    Invocation {
        #[command(subcommand)]
        action: InvocationAction,
    },
    /// Report agent invocation compliance
    Compliance {
        #[arg(value_parser = parse_id)]
        id: NamespaceId,
    },
    /// Query or rebuild the central index
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },
    /// Import a legacy global phase file as a migrated namespace
    Migrate {
        legacy_file: PathBuf,
    },
    /// Print audit trail entries
    Audit {
        #[arg(value_parser = parse_id)]
        id: Option<NamespaceId>,
    },
}

#[derive(Subcommand)]
enum InvocationAction {
    /// Record an agent start; prints the invocation id
    Start {
        #[arg(value_parser = parse_id)]
        id: NamespaceId,
        #[arg(long)]
        agent: String,
        /// Spawning identity (defaults to the configured orchestrator)
        #[arg(long)]
        parent: Option<String>,
        #[arg(long, default_value = "1")]
        depth: u32,
    },
    /// Record how an agent invocation ended
    End {
        #[arg(value_parser = parse_id)]
        id: NamespaceId,
        invocation: String,
        #[arg(long, value_enum)]
        status: EndStatus,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Show index entries, rebuilding a stale index first
    Query {
        #[arg(value_parser = parse_id)]
        id: Option<NamespaceId>,
    },
    /// Rebuild the index from namespace records
    Rebuild,
}

#[derive(Clone, Copy, ValueEnum)]
enum EndStatus {
    Success,
    Failed,
    Crashed,
}

impl From<EndStatus> for InvocationStatus {
    fn from(status: EndStatus) -> Self {
        match status {
            EndStatus::Success => InvocationStatus::Success,
            EndStatus::Failed => InvocationStatus::Failed,
            EndStatus::Crashed => InvocationStatus::Crashed,
        }
    }
}

fn parse_id(raw: &str) -> Result<NamespaceId, String> {
    NamespaceId::parse(raw).map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

fn report_error(err: &anyhow::Error) {
    eprintln!("Error: {:#}", err);
    match err.downcast_ref::<PhaseGateError>() {
        Some(PhaseGateError::GateCheckFailed { checks, .. })
        | Some(PhaseGateError::GateNotReady { checks, .. }) => {
            for line in check_lines(checks) {
                eprintln!("{}", line);
            }
        }
        Some(PhaseGateError::ComplianceViolation { violations }) => {
            for v in violations {
                eprintln!("  - {} ({}): {}", v.agent, v.invocation_id, v.reason);
            }
        }
        _ => {}
    }
}

fn open(cli: &Cli) -> Result<PhaseGate> {
    let store = resolve_store_root(cli.store.as_deref())?;
    let mut builder = PhaseGate::builder(store);
    if let Some(workspace) = &cli.workspace {
        builder = builder.workspace_root(workspace);
    }
    builder.build()
}

struct Output {
    json: bool,
}

impl Output {
    /// Prints `value` as JSON, or the human-readable `lines`.
    fn emit<T: Serialize>(&self, value: &T, lines: impl FnOnce() -> Vec<String>) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            for line in lines() {
                println!("{}", line);
            }
        }
        Ok(())
    }
}

fn run(cli: Cli) -> Result<()> {
    let engine = open(&cli)?;
    let out = Output { json: cli.json };

    match cli.command {
        Command::Create {
            description,
            branch,
            parent,
        } => {
            let ns = engine
                .create_namespace(&description, &branch, parent.as_ref())
                .context("Failed to create namespace")?;
            out.emit(&ns, || vec![ns.id.to_string()])
        }
        Command::Show { id } => cmd_show(&engine, &out, &id),
        Command::List { all } => {
            let namespaces = if all {
                engine.list_all()?
            } else {
                engine.list_active()?
            };
            out.emit(&namespaces, || namespaces.iter().map(namespace_line).collect())
        }
        Command::Tombstone { id, reason, by } => {
            let by = by.unwrap_or_else(|| engine.config().signer_identity());
            let (ns, tombstone) = engine
                .tombstone(&id, &reason, &by)
                .with_context(|| format!("Failed to tombstone {}", id))?;
            out.emit(&tombstone, || {
                vec![format!(
                    "{} tombstoned by {}: {}",
                    ns.id, tombstone.deleted_by, tombstone.reason
                )]
            })
        }
        Command::Complete { id } => {
            let ns = engine.complete(&id)?;
            out.emit(&ns, || vec![namespace_line(&ns)])
        }
        Command::Phase { id } => {
            let record = engine.phase_record(&id)?;
            let phase = engine.get_phase(&id)?;
            out.emit(&record, || {
                let mut lines = vec![format!(
                    "{} is in phase {} ({})",
                    id, phase.name, phase.ordinal
                )];
                for entry in &record.history {
                    let mut line = format!(
                        "  {} {:?} at {}",
                        entry.phase,
                        entry.transition,
                        entry.entered_at.to_rfc3339()
                    );
                    if let Some(reason) = &entry.exception {
                        line.push_str(&format!(" [exception: {}]", reason));
                    }
                    lines.push(line);
                }
                lines
            })
        }
        Command::Advance {
            id,
            to,
            override_,
            note,
            gate,
        } => {
            let gate = gate.as_deref().map(read_gate).transpose()?;
            let evidence = TransitionEvidence { gate, note };
            let phase = engine
                .advance_phase(&id, &to, evidence, override_)
                .with_context(|| format!("Failed to advance {} to {}", id, to))?;
            out.emit(&phase, || vec![format!("{} entered phase {}", id, phase.name)])
        }
        Command::Validate { id, phase } => {
            let phase = phase_or_current(&engine, &id, phase)?;
            let result = engine.validate_gate(&id, &phase)?;
            out.emit(&result, || gate_result_lines(&result))?;
            if !result.passed {
                anyhow::bail!("gate for phase '{}' of {} is not satisfied", phase, id);
            }
            Ok(())
        }
        Command::Sign { id, phase } => {
            let phase = phase_or_current(&engine, &id, phase)?;
            let gate = engine
                .sign_gate(&id, &phase)
                .with_context(|| format!("Failed to sign gate {} of {}", phase, id))?;
            out.emit(&gate, || {
                vec![format!(
                    "Signed gate {} of {} as {} at {}",
                    gate.phase, gate.namespace_id, gate.signer, gate.head_ref
                )]
            })
        }
        Command::Verify { id, phase, file } => cmd_verify(&engine, &out, id, phase, file),
        Command::Plan { groups } => {
            let groups = read_groups(&groups)?;
            let plan = engine.plan_execution(&groups)?;
            out.emit(&plan, || plan_lines(&plan))
        }
        Command::Admit {
            groups,
            candidate,
            running,
        } => {
            let groups = read_groups(&groups)?;
            let find = |id: &str| {
                groups
                    .iter()
                    .find(|g| g.group_id == id)
                    .cloned()
                    .with_context(|| format!("Group '{}' is not declared", id))
            };
            let candidate = find(&candidate)?;
            let running = running
                .iter()
                .map(|id| find(id))
                .collect::<Result<Vec<_>>>()?;
            engine.check_admission(&running, &candidate)?;
            out.emit(&candidate.group_id, || {
                vec![format!("{} may start", candidate.group_id)]
            })
        }
        Command::Invocation { action } => match action {
            InvocationAction::Start {
                id,
                agent,
                parent,
                depth,
            } => {
                let parent = parent.unwrap_or_else(|| engine.config().orchestrator.clone());
                let invocation = engine.record_invocation_start(&id, &agent, &parent, depth)?;
                out.emit(&invocation, || vec![invocation.to_string()])
            }
            InvocationAction::End {
                id,
                invocation,
                status,
            } => {
                let invocation = InvocationId::from(invocation.as_str());
                engine.record_invocation_end(&id, &invocation, status.into())?;
                out.emit(&invocation, || vec![format!("Recorded end of {}", invocation)])
            }
        },
        Command::Compliance { id } => {
            let report = engine.compliance(&id, Utc::now())?;
            out.emit(&report, || compliance_lines(&report))?;
            if !report.is_compliant() {
                anyhow::bail!(
                    "{} agent compliance violation(s) in {}",
                    report.violations.len(),
                    id
                );
            }
            Ok(())
        }
        Command::Index { action } => match action {
            IndexAction::Query { id: Some(id) } => {
                let entry = engine.query_index(&id)?;
                out.emit(&entry, || {
                    vec![format!("{} {} {:?}", id, entry.current_phase, entry.status)]
                })
            }
            IndexAction::Query { id: None } => {
                let index = engine.query_all()?;
                out.emit(&index, || {
                    index
                        .entries
                        .iter()
                        .map(|(id, entry)| {
                            format!("{} {} {:?}", id, entry.current_phase, entry.status)
                        })
                        .collect()
                })
            }
            IndexAction::Rebuild => {
                let index = engine.rebuild_index()?;
                out.emit(&index, || {
                    vec![format!("Rebuilt index with {} entries", index.entries.len())]
                })
            }
        },
        Command::Migrate { legacy_file } => {
            let outcome = engine
                .migrate_legacy(&legacy_file)
                .with_context(|| format!("Failed to migrate {}", legacy_file.display()))?;
            out.emit(&outcome, || {
                vec![format!(
                    "Imported {} as {} in phase {}",
                    outcome.legacy_path.display(),
                    outcome.namespace.id,
                    outcome.phase.name
                )]
            })
        }
        Command::Audit { id } => {
            let entries = engine.audit_entries(id.as_ref())?;
            out.emit(&entries, || {
                entries
                    .iter()
                    .map(|e| {
                        format!(
                            "{} [{}] {} {}",
                            e.ts,
                            e.component,
                            e.namespace_id.as_deref().unwrap_or("-"),
                            e.event
                        )
                    })
                    .collect()
            })
        }
    }
}

fn cmd_show(engine: &PhaseGate, out: &Output, id: &NamespaceId) -> Result<()> {
    #[derive(Serialize)]
    struct Shown {
        namespace: TaskNamespace,
        phase: String,
        tombstone: Option<phasegate::namespace::Tombstone>,
    }

    let shown = Shown {
        namespace: engine.get_namespace(id)?,
        phase: engine.get_phase(id)?.name,
        tombstone: engine.read_tombstone(id)?,
    };
    out.emit(&shown, || {
        let ns = &shown.namespace;
        let mut lines = vec![
            format!("id:          {}", ns.id),
            format!("status:      {:?}", ns.status),
            format!("phase:       {}", shown.phase),
            format!("branch:      {}", ns.branch),
            format!("description: {}", ns.description),
            format!("created:     {}", ns.created_at.to_rfc3339()),
        ];
        if let Some(parent) = &ns.parent_id {
            lines.push(format!("parent:      {}", parent));
        }
        if let Some(t) = &shown.tombstone {
            lines.push(format!(
                "tombstone:   {} by {} ({})",
                t.deleted_at.to_rfc3339(),
                t.deleted_by,
                t.reason
            ));
        }
        lines
    })
}

fn cmd_verify(
    engine: &PhaseGate,
    out: &Output,
    id: Option<NamespaceId>,
    phase: Option<String>,
    file: Option<PathBuf>,
) -> Result<()> {
    let gate = match (file, id) {
        (Some(file), _) => read_gate(&file)?,
        (None, Some(id)) => {
            let phase = phase_or_current(engine, &id, phase)?;
            engine
                .load_gate(&id, &phase)?
                .with_context(|| format!("No gate signed for phase {} of {}", phase, id))?
        }
        (None, None) => anyhow::bail!("Either a namespace id or --file is required"),
    };

    let valid = engine.verify_gate(&gate);
    out.emit(&valid, || {
        vec![format!(
            "Gate {} of {}: {}",
            gate.phase,
            gate.namespace_id,
            if valid { "valid" } else { "INVALID" }
        )]
    })?;
    if !valid {
        anyhow::bail!("gate {} of {} failed verification", gate.phase, gate.namespace_id);
    }
    Ok(())
}

fn phase_or_current(engine: &PhaseGate, id: &NamespaceId, phase: Option<String>) -> Result<String> {
    match phase {
        Some(phase) => Ok(phase),
        None => Ok(engine.get_phase(id)?.name),
    }
}

fn read_gate(path: &Path) -> Result<Gate> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read gate file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse gate file: {}", path.display()))
}

fn read_groups(path: &Path) -> Result<Vec<ParallelGroup>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read groups file: {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse groups file as YAML: {}", path.display()))
}

fn namespace_line(ns: &TaskNamespace) -> String {
    format!("{}  {:?}  {}  {}", ns.id, ns.status, ns.branch, ns.description)
}

fn check_lines(checks: &[Check]) -> Vec<String> {
    let mut lines = Vec::new();
    for check in checks {
        let mark = if check.passed { "PASS" } else { "FAIL" };
        lines.push(format!("[{}] {}", mark, check.kind.as_str()));
        for item in &check.items {
            lines.push(format!("  - {}: {}", item.subject, item.reason));
            lines.push(format!("    fix: {}", item.remediation));
        }
        for warning in &check.warnings {
            lines.push(format!("  ! {}", warning));
        }
    }
    lines
}

fn gate_result_lines(result: &GateResult) -> Vec<String> {
    let mut lines = vec![format!(
        "Gate {} of {}: {}",
        result.phase,
        result.namespace_id,
        if result.passed { "passed" } else { "failed" }
    )];
    lines.extend(check_lines(&result.checks));
    lines
}

fn plan_lines(plan: &ExecutionPlan) -> Vec<String> {
    let mut lines = Vec::new();
    for (i, lane) in plan.parallel_batches.iter().enumerate() {
        lines.push(format!("lane {}: {}", i + 1, lane.join(" -> ")));
    }
    if !plan.exclusive.is_empty() {
        lines.push(format!("exclusive: {}", plan.exclusive.join(" -> ")));
    }
    for broad in &plan.overly_broad {
        lines.push(format!(
            "warning: {} declares overly broad path {}",
            broad.group_id, broad.pattern
        ));
    }
    for edge in &plan.conflicts {
        lines.push(format!(
            "conflict: {} ({}) x {} ({})",
            edge.first, edge.first_pattern, edge.second, edge.second_pattern
        ));
    }
    lines
}

fn compliance_lines(report: &ComplianceReport) -> Vec<String> {
    let mut lines = vec![format!(
        "{} invocation(s), {} violation(s)",
        report.invocations.len(),
        report.violations.len()
    )];
    for inv in &report.invocations {
        lines.push(format!(
            "  {} {} parent={} depth={} {:?}",
            inv.invocation_id, inv.agent, inv.parent, inv.depth, inv.status
        ));
    }
    for v in &report.violations {
        lines.push(format!("  violation: {} ({}): {}", v.agent, v.invocation_id, v.reason));
    }
    for warning in &report.warnings {
        lines.push(format!("  ! {}", warning));
    }
    lines
}
