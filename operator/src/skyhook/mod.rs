//! The Skyhook controller: dependency DAG, per-node state machine,
//! scheduler, interrupt coordination, runner pod dispatch, and status
//! aggregation (spec.md §3–§8). [`reconciler::run`] is the entrypoint.

pub mod admin;
pub mod dag;
pub mod dispatcher;
pub mod interrupt;
pub mod migration;
pub mod node_wrapper;
pub mod reconciler;
pub mod scheduler;
pub mod state_machine;
pub mod status;
