//! Locked plan execution.
//!
//! The executor takes the process-wide lock, creates a timestamped work
//! directory under `<state>/updates/`, serializes the plan to `plan.json`,
//! and runs the procedure pipeline in order. The first error stops the run
//! and is surfaced as-is; there is no rollback. The plan file and the
//! remote state are the record of how far execution got. The lock is
//! released on every exit path, Drop included.

use std::fs;

use anyhow::{Context as _, Result};
use chrono::Utc;

use dcadm_config::Config;
use dcadm_types::UpdatePlan;

use crate::api::SdcClients;
use crate::catalog::Catalog;
use crate::lock;
use crate::plan::plan_id;
use crate::procedures::{Context, ProcedureKind, coordinate};
use crate::Reporter;

pub const PLAN_FILE: &str = "plan.json";

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    pub dry_run: bool,
}

/// Execute an update plan. `plan.just_images` restricts the pipeline to
/// its image imports.
pub fn execute(
    plan: &UpdatePlan,
    clients: &SdcClients,
    catalog: &Catalog,
    config: &Config,
    reporter: &mut dyn Reporter,
    opts: &ExecuteOptions,
) -> Result<()> {
    let mut held = lock::acquire(&config.lock_path, reporter)?;

    let mut procedures = coordinate(plan);
    if plan.just_images {
        procedures.retain(|p| p.kind() == ProcedureKind::ImportImage);
    }

    if procedures.is_empty() {
        reporter.info("Up-to-date.");
        held.release()?;
        return Ok(());
    }

    reporter.info(&format!("This update will make {} changes:", procedures.len()));
    for procedure in &procedures {
        reporter.info(&format!("  {}", procedure.summarize()));
    }

    if opts.dry_run {
        reporter.info("Dry-run. No changes made.");
        held.release()?;
        return Ok(());
    }

    let started = Utc::now();
    let stamp = started.format("%Y%m%dT%H%M%SZ").to_string();
    let workdir = config.state_dir.join("updates").join(&stamp);
    fs::create_dir_all(&workdir)
        .with_context(|| format!("failed to create work dir {}", workdir.display()))?;

    let id = plan_id(plan)?;
    held.set_plan_id(&id)?;

    let serialized =
        serde_json::to_string_pretty(plan).context("failed to serialize plan")?;
    let plan_path = workdir.join(PLAN_FILE);
    fs::write(&plan_path, serialized)
        .with_context(|| format!("failed to write {}", plan_path.display()))?;
    reporter.info(&format!("wrote plan to {}", plan_path.display()));

    let total = procedures.len();
    for (idx, procedure) in procedures.iter().enumerate() {
        reporter.info(&format!(
            "[{}/{}] {}",
            idx + 1,
            total,
            procedure.summarize()
        ));
        let mut ctx = Context {
            clients,
            catalog,
            config,
            plan,
            workdir: &workdir,
            reporter: &mut *reporter,
        };
        procedure
            .execute(&mut ctx)
            .with_context(|| format!("procedure failed: {}", procedure.summarize()))?;
    }

    let elapsed = Utc::now().signed_duration_since(started);
    reporter.info(&format!(
        "Completed successfully ({}s).",
        elapsed.num_seconds()
    ));
    held.release()?;
    Ok(())
}
