//! Remove instances: registry-managed core VMs and per-node agents.

use anyhow::{Result, bail};
use uuid::Uuid;

use dcadm_types::{DcadmError, Instance};

use super::{Context, Procedure, ProcedureKind};

pub struct DeleteVmInstance {
    instance: Instance,
}

impl DeleteVmInstance {
    pub fn new(instance: Instance) -> Self {
        Self { instance }
    }
}

impl Procedure for DeleteVmInstance {
    fn kind(&self) -> ProcedureKind {
        ProcedureKind::DeleteVmInstance
    }

    fn summarize(&self) -> String {
        format!(
            "delete VM instance {} ({})",
            self.instance.alias.as_deref().unwrap_or(&self.instance.id),
            self.instance.service
        )
    }

    fn execute(&self, ctx: &mut Context<'_>) -> Result<()> {
        let uuid: Uuid = self.instance.id.parse().map_err(|_| {
            DcadmError::internal(format!(
                "VM instance id is not a uuid: {:?}",
                self.instance.id
            ))
        })?;
        ctx.clients.sapi.delete_instance(uuid)?;
        ctx.reporter
            .info(&format!("deleted instance {}", self.instance.id));
        Ok(())
    }
}

pub struct DeleteAgentInstance {
    server: Uuid,
    service: String,
}

impl DeleteAgentInstance {
    pub fn new(server: Uuid, service: String) -> Self {
        Self { server, service }
    }
}

impl Procedure for DeleteAgentInstance {
    fn kind(&self) -> ProcedureKind {
        ProcedureKind::DeleteAgentInstance
    }

    fn summarize(&self) -> String {
        format!("uninstall agent {} from node {}", self.service, self.server)
    }

    fn execute(&self, ctx: &mut Context<'_>) -> Result<()> {
        let output = ctx.clients.cnapi.execute_command(
            self.server,
            &format!("/opt/agents/bin/agent-uninstall {}", self.service),
        )?;
        if output.exit_status != 0 {
            bail!(
                "agent uninstall of {} on {} exited {}: {}",
                self.service,
                self.server,
                output.exit_status,
                output.stderr.trim()
            );
        }
        ctx.reporter.info(&format!(
            "uninstalled {} from node {}",
            self.service, self.server
        ));
        Ok(())
    }
}
