//! Harvest - metrics-collection orchestrator plugin.
//!
//! A long-lived supervisor that discovers collection-job configuration,
//! decides whether each job can run, keeps the healthy ones on a one-second
//! tick, retries those that may succeed later, and emits the resulting
//! metrics on a line-oriented stream to the parent host process.
//!
//! # Architecture
//!
//! Data flows strictly left to right:
//!
//! ```text
//! filesystem -> Discovery --groups--> Build --jobs--> Run --ticks--> collectors -> output
//!                                       |
//!                                       +-> State (periodic snapshot, read on startup)
//! ```
//!
//! - [`discovery`]: watches the filesystem, produces configuration groups
//!   keyed by source file, and coalesces bursts to at most one batch per
//!   second.
//! - [`build`]: diffs incoming groups against the live set, auto-detects
//!   viability, schedules retries and owns per-plugin plus cross-plugin
//!   uniqueness.
//! - [`run`]: holds active jobs and broadcasts a wall-aligned one-second
//!   tick.
//! - [`state`]: persists per-job status so a restarted plugin can bias
//!   recovery of previously healthy jobs.
//!
//! Collector modules implement the [`module::Module`] contract
//! (`init → check → charts → collect`, optional `cleanup`); the orchestrator
//! never computes metrics itself.

pub mod agent;
pub mod apiwriter;
pub mod build;
pub mod cli;
pub mod confgroup;
pub mod discovery;
pub mod job;
pub mod module;
pub mod registry;
pub mod run;
pub mod state;
pub mod ticker;

pub use agent::{Agent, AgentError};
pub use apiwriter::{ApiWriter, SharedOutput, shared_output};
pub use build::JobStatus;
pub use confgroup::{Config, Group};
pub use job::Job;
pub use module::Module;
