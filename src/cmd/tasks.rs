//! Task commands: `tasks`, `ready`, `task`, `verify`, `graph`.

use anyhow::{Context, Result};
use console::style;
use serde_json::json;
use tasker::config::Config;
use tasker::dag::{DagBuilder, SequencePlan, sequence};
use tasker::errors::TaskerError;
use tasker::lifecycle::{FilesTouched, TaskController};
use tasker::loader;
use tasker::state::{CriterionResult, Task, TaskFailure, TaskStatus, Verdict, Verification};

use super::{Output, join_or_none};
use crate::{GraphCommands, TaskCommands, TasksCommands};

fn styled_status(status: TaskStatus) -> console::StyledObject<&'static str> {
    let label = status.as_str();
    match status {
        TaskStatus::Complete => style(label).green(),
        TaskStatus::Running => style(label).cyan(),
        TaskStatus::Ready => style(label).bold(),
        TaskStatus::Failed => style(label).red(),
        TaskStatus::Blocked => style(label).yellow(),
        TaskStatus::Skipped | TaskStatus::Pending => style(label).dim(),
    }
}

pub fn cmd_tasks(config: &Config, out: &Output, command: &TasksCommands) -> Result<()> {
    let repo = config.repository();
    match command {
        TasksCommands::Load { dir } => {
            let dir = dir.clone().unwrap_or_else(|| repo.tasks_dir());
            let definitions = loader::load_dir(&dir)?;
            let summary = repo.update(|doc| loader::merge(doc, &definitions))?;
            out.emit(&summary, || {
                println!(
                    "Loaded {} task definition(s) from {}",
                    definitions.len(),
                    dir.display()
                );
                if !summary.added.is_empty() {
                    println!("  Added:   {}", summary.added.join(", "));
                }
                if !summary.updated.is_empty() {
                    println!("  Updated: {}", summary.updated.join(", "));
                }
                if !summary.removed.is_empty() {
                    println!("  Removed: {}", summary.removed.join(", "));
                }
                println!("  Phases:  {}", summary.phases);
                println!("  Ready:   {}", join_or_none(&summary.ready));
            })
        }
        TasksCommands::List => {
            let doc = repo.load_required()?;
            let mut tasks: Vec<&Task> = doc.tasks.values().collect();
            tasks.sort_by_key(|t| t.sort_key());
            out.emit(&tasks, || {
                if tasks.is_empty() {
                    println!("No tasks loaded. Run 'tasker tasks load' first.");
                    return;
                }
                println!("{:<16} {:<6} {:<10} Name", "Task", "Phase", "Status");
                println!("{:<16} {:<6} {:<10} ----", "----", "-----", "------");
                for task in &tasks {
                    let phase = task.phase.map_or_else(|| "-".to_string(), |p| p.to_string());
                    let marker = if task.steel_thread { " *" } else { "" };
                    println!(
                        "{:<16} {:<6} {:<10} {}{}",
                        task.id,
                        phase,
                        styled_status(task.status),
                        task.name,
                        marker
                    );
                }
            })
        }
    }
}

pub fn cmd_ready(config: &Config, out: &Output) -> Result<()> {
    let repo = config.repository();
    let ready = TaskController::new(&repo).ready()?;
    let ids: Vec<&str> = ready.iter().map(|t| t.id.as_str()).collect();
    out.emit(&ids, || {
        for task in &ready {
            println!("{}", task.id);
        }
    })
}

pub fn cmd_task(config: &Config, out: &Output, command: &TaskCommands) -> Result<()> {
    let repo = config.repository();
    let controller = TaskController::new(&repo);
    match command {
        TaskCommands::Show { id } => {
            let doc = repo.load_required()?;
            let task = doc.task(id)?;
            out.emit(task, || {
                println!("{} {}", style(&task.id).bold(), task.name);
                println!("  Status:   {}", styled_status(task.status));
                if let Some(phase) = task.phase {
                    println!("  Phase:    {}", phase);
                }
                println!("  Depends:  {}", join_or_none(&task.depends_on));
                println!("  Blocks:   {}", join_or_none(&task.blocks));
                println!("  Attempts: {}", task.attempts);
                if let Some(failure) = &task.failure {
                    println!(
                        "  Failure:  {}: {}{}",
                        failure.category,
                        failure.message,
                        if failure.retryable { "" } else { " (not retryable)" }
                    );
                }
                if !task.blocked_by.is_empty() {
                    let by: Vec<&str> = task.blocked_by.iter().map(String::as_str).collect();
                    println!("  Blocked by: {}", by.join(", "));
                }
                if let Some(reason) = &task.skip_reason {
                    println!("  Skipped:  {}", reason);
                }
                if let Some(v) = &task.verification {
                    println!("  Verdict:  {:?}", v.verdict);
                }
            })
        }
        TaskCommands::Start { id } => {
            let task = controller.start(id)?;
            out.emit(&task, || {
                println!(
                    "{} {} (attempt {})",
                    style("Started").cyan(),
                    task.id,
                    task.attempts
                );
            })
        }
        TaskCommands::Complete {
            id,
            created,
            modified,
        } => {
            let touched = FilesTouched {
                created: created.clone(),
                modified: modified.clone(),
            };
            let promoted = controller.complete(id, &touched)?;
            out.emit(&json!({ "task_id": id, "ready": promoted }), || {
                println!("{} {}", style("Completed").green(), id);
                if !promoted.is_empty() {
                    println!("  Now ready: {}", promoted.join(", "));
                }
            })
        }
        TaskCommands::Fail {
            id,
            message,
            category,
            no_retry,
            created,
            modified,
        } => {
            let failure = TaskFailure {
                category: category.clone(),
                message: message.clone(),
                retryable: !no_retry,
            };
            let touched = FilesTouched {
                created: created.clone(),
                modified: modified.clone(),
            };
            let outcome = controller.fail(id, failure, &touched)?;
            out.emit(&outcome, || {
                println!("{} {}: {}", style("Failed").red(), id, message);
                if !outcome.blocked.is_empty() {
                    println!("  Blocked: {}", outcome.blocked.join(", "));
                }
                let rb = &outcome.rollback;
                if !rb.deleted.is_empty() || !rb.restored.is_empty() {
                    println!(
                        "  Rolled back: {} deleted, {} restored",
                        rb.deleted.len(),
                        rb.restored.len()
                    );
                }
                if !rb.unrestorable.is_empty() {
                    println!(
                        "  {} {}",
                        style("Could not restore:").yellow(),
                        rb.unrestorable.join(", ")
                    );
                }
            })
        }
        TaskCommands::Retry { id, force } => {
            let unblocked = controller.retry(id, *force)?;
            out.emit(&json!({ "task_id": id, "unblocked": unblocked }), || {
                println!("{} {} (reset to pending)", style("Retrying").cyan(), id);
                if !unblocked.is_empty() {
                    println!("  Unblocked: {}", unblocked.join(", "));
                }
            })
        }
        TaskCommands::Skip { id, reason } => {
            let released = controller.skip(id, reason)?;
            out.emit(&json!({ "task_id": id, "released": released }), || {
                println!("{} {}: {}", style("Skipped").dim(), id, reason);
                if !released.is_empty() {
                    println!("  Released: {}", released.join(", "));
                }
            })
        }
    }
}

fn parse_criterion(raw: &str) -> Result<CriterionResult> {
    let (name, score) = raw.split_once('=').ok_or_else(|| {
        TaskerError::invalid(format!("criterion '{}' must look like name=pass|partial|fail", raw))
    })?;
    let name = name.trim();
    if name.is_empty() {
        return Err(TaskerError::invalid(format!("criterion '{}' has no name", raw)).into());
    }
    Ok(CriterionResult {
        name: name.to_string(),
        score: score.trim().parse()?,
        evidence: None,
    })
}

pub fn cmd_verify(
    config: &Config,
    out: &Output,
    id: &str,
    verdict: &str,
    criteria: &[String],
) -> Result<()> {
    let verdict: Verdict = verdict.parse()?;
    let criteria = criteria
        .iter()
        .map(String::as_str)
        .map(parse_criterion)
        .collect::<Result<Vec<_>>>()?;
    let verification = Verification {
        verdict,
        criteria,
        verified_at: chrono::Utc::now(),
    };

    let repo = config.repository();
    let affected = TaskController::new(&repo)
        .verify(id, verification)
        .with_context(|| format!("Failed to record verification for {}", id))?;
    out.emit(
        &json!({ "task_id": id, "verdict": verdict, "affected": affected }),
        || {
            println!("Recorded {:?} verdict for {}", verdict, id);
            if !affected.is_empty() {
                let label = if verdict == Verdict::Fail {
                    "Blocked"
                } else {
                    "Released"
                };
                println!("  {}: {}", label, affected.join(", "));
            }
        },
    )
}

pub fn cmd_graph(config: &Config, out: &Output, command: &GraphCommands) -> Result<()> {
    let repo = config.repository();
    match command {
        GraphCommands::Validate { document } => {
            let (source, plan): (String, SequencePlan) = if *document {
                let doc = repo.load_required()?;
                let graph = DagBuilder::from_tasks(doc.tasks.values()).build()?;
                (repo.state_path().display().to_string(), sequence(&graph)?)
            } else {
                let dir = repo.tasks_dir();
                let definitions = loader::load_dir(&dir)?;
                (dir.display().to_string(), loader::plan(&definitions)?)
            };

            out.emit(&plan, || {
                println!(
                    "{} graph from {}: {} task(s), {} phase(s)",
                    style("Valid").green().bold(),
                    source,
                    plan.phases.len(),
                    plan.phase_count()
                );
                println!();
                for wave in &plan.waves {
                    let phase = wave.first().and_then(|id| plan.phases.get(id));
                    if let Some(phase) = phase {
                        println!("  Phase {}: {}", phase, wave.join(", "));
                    }
                }
                if !plan.steel_thread.is_empty() {
                    println!();
                    println!("Steel thread: {}", plan.steel_thread.join(" -> "));
                }
            })
        }
    }
}
