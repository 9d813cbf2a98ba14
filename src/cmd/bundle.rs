//! Execution bundle commands (`tasker bundle`).

use anyhow::Result;
use console::style;
use serde_json::json;
use tasker::bundle::{self, IntegrityStatus};
use tasker::config::Config;

use super::Output;
use crate::BundleCommands;

pub fn cmd_bundle(config: &Config, out: &Output, command: &BundleCommands) -> Result<()> {
    let repo = config.repository();
    let bundles_dir = repo.bundles_dir();
    match command {
        BundleCommands::Prepare { id } => {
            let (prepared, path) = repo.update(|doc| bundle::prepare(doc, id, &bundles_dir))?;
            out.emit(&prepared, || {
                println!("{} {}", style("Wrote").green(), path.display());
                for dep in &prepared.dependency_files {
                    println!("  {}  {}", &dep.checksum[..12.min(dep.checksum.len())], dep.path);
                }
            })
        }
        BundleCommands::Check { id } => {
            let report = repo.update(|doc| bundle::check(doc, id, &bundles_dir))?;
            out.emit(&report, || match report.status {
                IntegrityStatus::Valid => println!("{} {}", style("valid").green(), id),
                IntegrityStatus::Drift => {
                    println!("{} {} (bundle regenerated)", style("drift").yellow(), id);
                    for d in &report.drifted {
                        println!("  {}", d.path);
                    }
                }
                // The failure is reported on stderr below.
                IntegrityStatus::Missing => {}
            })?;
            report.into_result()?;
            Ok(())
        }
        BundleCommands::List => {
            let bundles = bundle::list(&bundles_dir)?;
            out.emit(&bundles, || {
                if bundles.is_empty() {
                    println!("No bundles in {}", bundles_dir.display());
                }
                for b in &bundles {
                    let result = if b.has_result { "result" } else { "" };
                    println!("{:<16} {}", b.task_id, result);
                }
            })
        }
        BundleCommands::Clean { all } => {
            let doc = repo.load_required()?;
            let removed = bundle::clean(&doc, &bundles_dir, *all)?;
            out.emit(&json!({ "removed": removed }), || {
                println!("Removed {} file(s)", removed.len());
            })
        }
    }
}
