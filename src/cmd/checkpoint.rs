//! Batch checkpoint and recovery commands: `checkpoint`, `recover`.

use anyhow::Result;
use console::style;
use serde_json::json;
use tasker::checkpoint::{CheckpointManager, ReconcileSource};
use tasker::config::Config;

use super::{Output, join_or_none};
use crate::{CheckpointCommands, RecoverCommands};

pub fn cmd_checkpoint(config: &Config, out: &Output, command: &CheckpointCommands) -> Result<()> {
    let repo = config.repository();
    let manager = CheckpointManager::new(&repo, config.max_parallel);
    match command {
        CheckpointCommands::Create { tasks } => {
            let checkpoint = manager.create(tasks)?;
            out.emit(&checkpoint, || {
                println!(
                    "{} checkpoint {}",
                    style("Created").green(),
                    style(&checkpoint.batch_id).dim()
                );
                println!("  Started: {}", tasks.join(", "));
            })
        }
        CheckpointCommands::Report { id, result } => {
            let outcome = manager.report_from_file(id, result.as_deref())?;
            out.emit(&outcome, || {
                println!("{} reported {:?}", outcome.task_id, outcome.outcome);
                if !outcome.affected.is_empty() {
                    println!("  Affected: {}", outcome.affected.join(", "));
                }
                if outcome.cleared {
                    println!("  Batch settled; checkpoint cleared.");
                }
            })
        }
        CheckpointCommands::Complete => {
            let batch_id = manager.finalize()?;
            out.emit(&json!({ "batch_id": batch_id, "cleared": true }), || {
                println!("Checkpoint {} completed and cleared.", batch_id);
            })
        }
        CheckpointCommands::Inspect => {
            let inspection = manager.inspect()?;
            out.emit(&inspection, || {
                println!(
                    "Checkpoint {} (created {})",
                    inspection.batch_id,
                    inspection.created_at.format("%Y-%m-%d %H:%M:%S")
                );
                println!("{:<16} {:<10} Task status", "Task", "Outcome");
                for slot in &inspection.slots {
                    println!(
                        "{:<16} {:<10} {}",
                        slot.task_id,
                        format!("{:?}", slot.outcome).to_lowercase(),
                        slot.task_status
                    );
                }
                println!();
                println!("Pending: {}", join_or_none(&inspection.pending));
            })
        }
        CheckpointCommands::Clear { force } => {
            let batch_id = manager.clear(*force)?;
            out.emit(&json!({ "batch_id": batch_id, "cleared": true }), || {
                println!("Checkpoint {} cleared.", batch_id);
            })
        }
        CheckpointCommands::Resolve { id, decision } => {
            let outcome = manager.resolve(id, *decision)?;
            out.emit(
                &json!({ "task_id": id, "decision": decision, "outcome": outcome }),
                || {
                    println!("Orphan {} resolved: {:?}", id, decision);
                },
            )
        }
    }
}

pub fn cmd_recover(config: &Config, out: &Output, command: Option<&RecoverCommands>) -> Result<()> {
    let repo = config.repository();
    match command {
        None | Some(RecoverCommands::Checkpoint) => {
            let recovery = CheckpointManager::new(&repo, config.max_parallel).recover()?;
            out.emit(&recovery, || {
                let Some(batch_id) = &recovery.batch_id else {
                    println!("No checkpoint to recover.");
                    return;
                };
                println!("Recovering checkpoint {}", style(batch_id).dim());
                for item in &recovery.reconciled {
                    let source = match item.source {
                        ReconcileSource::Status => "task status",
                        ReconcileSource::ResultFile => "result file",
                    };
                    println!(
                        "  {} {} -> {:?} (from {})",
                        style("reconciled").green(),
                        item.task_id,
                        item.outcome,
                        source
                    );
                }
                for id in &recovery.orphans {
                    println!(
                        "  {} {} (decide with 'tasker checkpoint resolve {} --decision retry|fail')",
                        style("orphaned").red().bold(),
                        id,
                        id
                    );
                }
                if recovery.cleared {
                    println!("  Batch settled; checkpoint cleared.");
                }
            })?;
            // Orphans were persisted as-is; the caller still has to decide.
            recovery.into_result()?;
            Ok(())
        }
        Some(RecoverCommands::State) => {
            let report = repo.recover()?;
            out.emit(&report, || {
                if report.restored {
                    println!(
                        "{} state from journal ({} task(s))",
                        style("Restored").yellow().bold(),
                        report.task_count
                    );
                    if let Some(backup) = &report.backup {
                        println!("  Damaged copy saved to {}", backup.display());
                    }
                } else {
                    println!("State is intact ({} task(s)).", report.task_count);
                }
            })
        }
    }
}
