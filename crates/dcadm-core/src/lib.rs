//! # dcadm-core
//!
//! The update/rollout engine behind the `dcadm` CLI: it plans and executes
//! coordinated lifecycle operations over a fleet of datacenter
//! infrastructure services by driving a small set of remote APIs (services
//! registry, VM manager, compute-node manager, image registries, workflow
//! engine).
//!
//! ## Pipeline
//!
//! The update flow is **validate → resolve → coordinate → execute**:
//!
//! 1. [`changes::validate`] checks a user change set for field and
//!    conflict violations, reporting every violation at once.
//! 2. [`resolve::resolve_changes`] swaps identifiers for inventory records
//!    and chooses a target image per change.
//! 3. [`plan::build_plan`] snapshots the inventory and produces the
//!    serializable update plan plus its ordered procedure pipeline.
//! 4. [`executor::execute`] takes the process-wide lock, persists
//!    `plan.json` into a timestamped work directory, and runs procedures
//!    in order, fail-fast, with no rollback.
//!
//! The rolling-reboot flow lives in [`reboot`]: plans are owned by the
//! compute-node manager; the engine drives them with bounded concurrency,
//! serialized core-node batches, and freeze/thaw coordination with the
//! primary data-store shard.
//!
//! ## Modules
//!
//! - [`api`] — typed clients for sapi, vmapi, cnapi, imgapi, wfapi, updates
//! - [`inventory`] — fleet enumeration and identifier resolution
//! - [`catalog`] — image lookup and candidate computation
//! - [`changes`] — change-set parsing and validation
//! - [`resolve`] — change resolution and post-resolution filters
//! - [`plan`] — update-plan assembly
//! - [`procedures`] — the procedure taxonomy and coordinator
//! - [`executor`] — locked plan execution
//! - [`health`] — per-instance health probing
//! - [`reboot`] — reboot-plan creation and the execution engine
//! - [`selfupdate`] — atomic replacement of the tool binary
//! - [`maint`] — datacenter maintenance mode
//! - [`lock`] — the process-wide file lock

/// Typed clients for the remote APIs, sharing one HTTP client and a
/// uniform error envelope.
pub mod api;

/// Image lookup with local-then-updates fall-through and candidate
/// filtering.
pub mod catalog;

/// Change-set parsing and validation.
pub mod changes;

/// Locked plan execution and the work-directory layout.
pub mod executor;

/// Per-instance health probing via the compute-node manager.
pub mod health;

/// Fleet enumeration and identifier resolution.
pub mod inventory;

/// Process-wide file lock.
pub mod lock;

/// Datacenter maintenance mode.
pub mod maint;

/// Update-plan assembly.
pub mod plan;

/// Procedure taxonomy and the coordinator that orders them.
pub mod procedures;

/// Rolling reboot engine.
pub mod reboot;

/// Change resolution and post-resolution filters.
pub mod resolve;

/// Self-update from the update registry.
pub mod selfupdate;

/// Human progress reporting, decoupled from stdout for tests.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Reporter that drops everything; used by tests and the reboot agent.
#[derive(Debug, Default)]
pub struct QuietReporter;

impl Reporter for QuietReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}
