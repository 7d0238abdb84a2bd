//! Instantiate a new core VM through the services registry.

use anyhow::Result;
use serde_json::json;
use uuid::Uuid;

use dcadm_types::{Image, Service};

use super::{Context, Procedure, ProcedureKind};

pub struct CreateVmInstance {
    service: Service,
    server: Uuid,
    image: Image,
}

impl CreateVmInstance {
    pub fn new(service: Service, server: Uuid, image: Image) -> Self {
        Self {
            service,
            server,
            image,
        }
    }
}

impl Procedure for CreateVmInstance {
    fn kind(&self) -> ProcedureKind {
        ProcedureKind::CreateVmInstance
    }

    fn summarize(&self) -> String {
        format!(
            "create a {:?} instance on node {} (image {})",
            self.service.name, self.server, self.image.version
        )
    }

    fn execute(&self, ctx: &mut Context<'_>) -> Result<()> {
        let created = ctx.clients.sapi.create_instance(
            self.service.uuid,
            &json!({
                "server_uuid": self.server,
                "image_uuid": self.image.uuid,
            }),
        )?;
        ctx.reporter.info(&format!(
            "created {:?} instance {} on node {}",
            self.service.name, created.uuid, self.server
        ));
        Ok(())
    }
}
