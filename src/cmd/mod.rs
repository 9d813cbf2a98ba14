//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module       | Commands handled                                        |
//! |--------------|---------------------------------------------------------|
//! | `session`    | `Init`, `Status`, `Phase`, `Halt`, `Tokens`             |
//! | `tasks`      | `Tasks`, `Ready`, `Task`, `Verify`, `Graph`             |
//! | `checkpoint` | `Checkpoint`, `Recover`                                 |
//! | `bundle`     | `Bundle`                                                |
//! | `config`     | `Config`                                                |

pub mod bundle;
pub mod checkpoint;
pub mod config;
pub mod session;
pub mod tasks;

pub use bundle::cmd_bundle;
pub use checkpoint::{cmd_checkpoint, cmd_recover};
pub use config::cmd_config;
pub use session::{cmd_halt, cmd_init, cmd_phase, cmd_status, cmd_tokens};
pub use tasks::{cmd_graph, cmd_ready, cmd_task, cmd_tasks, cmd_verify};

use anyhow::Result;
use serde::Serialize;

/// Where command results go: human text or one JSON document on stdout.
pub struct Output {
    json: bool,
}

impl Output {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    /// Print `value` as JSON when `--json` is set, otherwise run `text`.
    pub fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce()) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            text();
        }
        Ok(())
    }
}

fn join_or_none(ids: &[String]) -> String {
    if ids.is_empty() {
        "(none)".to_string()
    } else {
        ids.join(", ")
    }
}
