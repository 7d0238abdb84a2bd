//! Write a service's new default image to the services registry.

use anyhow::Result;
use serde_json::json;

use dcadm_types::{Image, Service};

use super::{Context, Procedure, ProcedureKind};

pub struct UpdateServiceParams {
    service: Service,
    image: Image,
}

impl UpdateServiceParams {
    pub fn new(service: Service, image: Image) -> Self {
        Self { service, image }
    }
}

impl Procedure for UpdateServiceParams {
    fn kind(&self) -> ProcedureKind {
        ProcedureKind::UpdateServiceParams
    }

    fn summarize(&self) -> String {
        format!(
            "update {:?} service params: image {} ({})",
            self.service.name, self.image.uuid, self.image.version
        )
    }

    fn execute(&self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.clients.sapi.update_service_params(
            self.service.uuid,
            &json!({ "image_uuid": self.image.uuid }),
        )?;
        ctx.reporter.info(&format!(
            "service {:?} now defaults to image {}",
            self.service.name, self.image.uuid
        ));
        Ok(())
    }
}
