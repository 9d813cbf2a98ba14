//! Session-wide commands: `init`, `status`, `phase`, `halt`, `tokens`.

use anyhow::{Context, Result};
use console::style;
use serde_json::json;
use tasker::config::Config;
use tasker::errors::TaskerError;
use tasker::state::{StatusReport, Usage, halt, log_tokens, workflow};

use super::{Output, join_or_none};
use crate::{HaltCommands, PhaseCommands, TokensCommands};

pub fn cmd_init(config: &Config, out: &Output, target_dir: Option<&str>) -> Result<()> {
    let target = target_dir
        .map(str::to_string)
        .or_else(|| config.target_dir.clone())
        .ok_or_else(|| {
            TaskerError::invalid("no target directory given; pass one or set target_dir in tasker.toml")
        })?;

    let repo = config.repository();
    let doc = repo.init(&target)?;
    for dir in [repo.tasks_dir(), repo.bundles_dir()] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    out.emit(
        &json!({
            "state_file": repo.state_path(),
            "target_dir": doc.target_dir,
            "phase": doc.phase.current,
        }),
        || {
            println!(
                "{} session in {}",
                style("Initialized").green().bold(),
                repo.planning_dir().display()
            );
            println!("  Target: {}", doc.target_dir);
            println!("  Phase:  {}", doc.phase.current);
            println!();
            println!(
                "Add task definitions to {} and run 'tasker tasks load'.",
                repo.tasks_dir().display()
            );
        },
    )
}

pub fn cmd_status(config: &Config, out: &Output) -> Result<()> {
    let doc = config.repository().load_required()?;
    let report = StatusReport::from_document(&doc);

    out.emit(&report, || {
        println!();
        println!("Tasker Session Status");
        println!("=====================");
        println!();
        println!("Workflow phase: {}", style(report.workflow_phase).cyan());
        println!("Target:         {}", report.target_dir);
        println!(
            "Progress:       {}/{} ({:.0}%)",
            report.done,
            report.total,
            report.progress_percent()
        );
        if report.current_phase > 0 {
            println!("Current phase:  {}", report.current_phase);
        }
        if report.halted {
            println!("Halt:           {}", style("requested").red().bold());
        }
        println!();

        for (status, count) in &report.counts {
            if *count > 0 {
                println!("  {:<10} {}", status, count);
            }
        }
        println!();
        println!("Ready:   {}", join_or_none(&report.ready));
        println!("Running: {}", join_or_none(&report.active));
        if !report.failed.is_empty() {
            println!("Failed:  {}", style(report.failed.join(", ")).red());
        }
        if !report.blocked.is_empty() {
            println!("Blocked: {}", style(report.blocked.join(", ")).yellow());
        }
        if !report.steel_thread.is_empty() {
            println!("Steel thread: {}", report.steel_thread.join(" -> "));
        }
        if let Some(cp) = &report.checkpoint {
            println!();
            println!(
                "Checkpoint {} ({} task(s), pending: {})",
                style(&cp.batch_id).dim(),
                cp.tasks.len(),
                join_or_none(&cp.pending)
            );
        }
        println!();
        println!(
            "Tokens: {}  Cost: ${:.4}",
            report.total_tokens, report.total_cost_usd
        );
        println!();
    })
}

pub fn cmd_phase(config: &Config, out: &Output, command: &PhaseCommands) -> Result<()> {
    let repo = config.repository();
    match command {
        PhaseCommands::Show => {
            let doc = repo.load_required()?;
            out.emit(&doc.phase, || {
                println!("{}", doc.phase.current);
            })
        }
        PhaseCommands::Advance => {
            let next = repo.update(workflow::advance)?;
            out.emit(&json!({ "phase": next }), || {
                println!("Workflow phase is now {}", style(next).cyan());
            })
        }
    }
}

pub fn cmd_halt(config: &Config, out: &Output, command: &HaltCommands) -> Result<()> {
    let repo = config.repository();
    match command {
        HaltCommands::Request { reason, by } => {
            repo.update(|doc| halt::request(doc, reason, by))?;
            out.emit(&json!({ "halt_requested": true, "reason": reason }), || {
                println!("{} requested: {}", style("Halt").red().bold(), reason);
            })
        }
        HaltCommands::Check => {
            let doc = repo.load_required()?;
            let halted = doc.halt_requested();
            out.emit(&json!({ "halted": halted, "halt": doc.halt }), || {
                println!("{}", if halted { "halted" } else { "running" });
            })
        }
        HaltCommands::Confirm => {
            let confirmation = repo.update(halt::confirm)?;
            out.emit(&confirmation, || {
                println!("Session halted.");
                if let Some(reason) = &confirmation.reason {
                    println!("  Reason: {}", reason);
                }
                if !confirmation.running.is_empty() {
                    println!("  Still running: {}", confirmation.running.join(", "));
                }
            })
        }
        HaltCommands::Resume => {
            let resumed = repo.update(|doc| Ok(halt::resume(doc)))?;
            out.emit(&json!({ "resumed": resumed }), || {
                if resumed {
                    println!("Execution resumed.");
                } else {
                    println!("No halt was requested.");
                }
            })
        }
    }
}

pub fn cmd_tokens(config: &Config, out: &Output, command: &TokensCommands) -> Result<()> {
    match command {
        TokensCommands::Log {
            id,
            input,
            output,
            cost,
            model,
        } => {
            let usage = Usage {
                input_tokens: *input,
                output_tokens: *output,
                cost_usd: *cost,
                model: model.clone(),
            };
            let execution = config.repository().update(|doc| {
                log_tokens(doc, id, &usage)?;
                Ok(doc.execution.clone())
            })?;
            out.emit(&execution, || {
                println!(
                    "Logged {} tokens for {} (session total {}, ${:.4})",
                    input + output,
                    id,
                    execution.total_tokens,
                    execution.total_cost_usd
                );
            })
        }
    }
}
