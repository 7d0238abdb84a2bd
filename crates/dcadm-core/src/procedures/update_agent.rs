//! Run the agent installer on a remote node.

use anyhow::{Context as _, Result};
use uuid::Uuid;

use dcadm_retry::Poller;
use dcadm_types::Image;

use super::{Context, Procedure, ProcedureKind};

pub struct UpdateAgentOnNode {
    server: Uuid,
    service: String,
    image: Image,
}

impl UpdateAgentOnNode {
    pub fn new(server: Uuid, service: String, image: Image) -> Self {
        Self {
            server,
            service,
            image,
        }
    }
}

impl Procedure for UpdateAgentOnNode {
    fn kind(&self) -> ProcedureKind {
        ProcedureKind::UpdateAgentOnNode
    }

    fn summarize(&self) -> String {
        format!(
            "update agent {} on node {} to image {} ({})",
            self.service, self.server, self.image.uuid, self.image.version
        )
    }

    fn execute(&self, ctx: &mut Context<'_>) -> Result<()> {
        let job = ctx
            .clients
            .cnapi
            .install_agent(self.server, &self.service, self.image.uuid)?;
        ctx.reporter.info(&format!(
            "installing {} on {} (job {})",
            self.service, self.server, job.job_uuid
        ));

        ctx.clients
            .wfapi
            .wait_for_job(job.job_uuid, &Poller::hourly())
            .with_context(|| {
                format!(
                    "agent install of {} on {} did not complete",
                    self.service, self.server
                )
            })?;
        Ok(())
    }
}
