//! Ensure an image is present in the local registry.

use anyhow::Result;

use dcadm_types::Image;

use super::{Context, Procedure, ProcedureKind};

pub struct ImportImage {
    image: Image,
}

impl ImportImage {
    pub fn new(image: Image) -> Self {
        Self { image }
    }
}

impl Procedure for ImportImage {
    fn kind(&self) -> ProcedureKind {
        ProcedureKind::ImportImage
    }

    fn summarize(&self) -> String {
        format!(
            "import image {} ({}@{})",
            self.image.uuid, self.image.name, self.image.version
        )
    }

    fn execute(&self, ctx: &mut Context<'_>) -> Result<()> {
        if ctx.clients.imgapi.get_image_opt(self.image.uuid)?.is_some() {
            ctx.reporter.info(&format!(
                "image {} already in the local registry",
                self.image.uuid
            ));
            return Ok(());
        }

        ctx.clients
            .imgapi
            .import_from(self.image.uuid, &ctx.config.updates_url)?;
        ctx.reporter.info(&format!(
            "imported image {} ({}@{})",
            self.image.uuid, self.image.name, self.image.version
        ));
        Ok(())
    }
}
