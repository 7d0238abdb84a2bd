//! Drive the VM manager through a reprovision of one core VM.

use anyhow::{Context as _, Result};
use uuid::Uuid;

use dcadm_retry::Poller;
use dcadm_types::{DcadmError, Image, Instance};

use super::{Context, Procedure, ProcedureKind};

pub struct ReprovisionVm {
    instance: Instance,
    image: Image,
}

impl ReprovisionVm {
    pub fn new(instance: Instance, image: Image) -> Self {
        Self { instance, image }
    }

    fn vm_uuid(&self) -> Result<Uuid> {
        self.instance.id.parse().map_err(|_| {
            DcadmError::internal(format!(
                "VM instance id is not a uuid: {:?}",
                self.instance.id
            ))
            .into()
        })
    }
}

impl Procedure for ReprovisionVm {
    fn kind(&self) -> ProcedureKind {
        ProcedureKind::ReprovisionVm
    }

    fn summarize(&self) -> String {
        format!(
            "reprovision VM {} ({}) to image {} ({})",
            self.instance.alias.as_deref().unwrap_or(&self.instance.id),
            self.instance.service,
            self.image.uuid,
            self.image.version
        )
    }

    fn execute(&self, ctx: &mut Context<'_>) -> Result<()> {
        let vm_uuid = self.vm_uuid()?;
        let job = ctx.clients.vmapi.reprovision(vm_uuid, self.image.uuid)?;
        ctx.reporter.info(&format!(
            "reprovisioning {} (job {})",
            self.instance.alias.as_deref().unwrap_or(&self.instance.id),
            job.job_uuid
        ));

        ctx.clients
            .wfapi
            .wait_for_job(job.job_uuid, &Poller::hourly())
            .with_context(|| format!("reprovision of {} did not complete", self.instance.id))?;

        ctx.reporter.info(&format!(
            "{} now on image {}",
            self.instance.alias.as_deref().unwrap_or(&self.instance.id),
            self.image.uuid
        ));
        Ok(())
    }
}
