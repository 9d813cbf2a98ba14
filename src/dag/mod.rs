//! Dependency graph and phase sequencer.
//!
//! Tasks declare the tasks they depend on. The builder turns them into a
//! graph, rejecting duplicate ids, unknown dependencies and cycles (with the
//! exact cycle path). The sequencer then assigns each task a phase, groups
//! tasks into waves that may run concurrently and picks out the steel
//! thread, the primary end-to-end chain.
//!
//! ## Example
//!
//! ```
//! use tasker::dag::{DagBuilder, TaskNode, sequence};
//!
//! let graph = DagBuilder::new(vec![
//!     TaskNode::new("T1", &[]),
//!     TaskNode::new("T2", &["T1"]),
//!     TaskNode::new("T3", &["T1"]),
//! ])
//! .build()
//! .unwrap();
//!
//! let plan = sequence(&graph).unwrap();
//! assert_eq!(plan.waves, vec![vec!["T1"], vec!["T2", "T3"]]);
//! ```

mod builder;
mod sequencer;

pub use builder::{DagBuilder, TaskGraph, TaskIndex, TaskNode, find_cycle};
pub use sequencer::{SequencePlan, sequence, sequence_document};
