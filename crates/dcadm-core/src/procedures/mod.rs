//! The procedure taxonomy and the coordinator that orders a resolved
//! change set into an executable pipeline.
//!
//! Ordering rules: image imports come first (deduplicated across changes);
//! a service's registry params update precedes its per-instance work;
//! deletes run last so creates of the same service precede them. Agent
//! updates are independent across nodes but still run sequentially within
//! one plan.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Result;
use uuid::Uuid;

use dcadm_config::Config;
use dcadm_types::{ChangeKind, InstanceKind, UpdatePlan};

use crate::Reporter;
use crate::api::SdcClients;
use crate::catalog::Catalog;

mod create_instance;
mod delete_instance;
mod import_image;
mod reprovision;
mod update_agent;
mod update_service;

pub use create_instance::CreateVmInstance;
pub use delete_instance::{DeleteAgentInstance, DeleteVmInstance};
pub use import_image::ImportImage;
pub use reprovision::ReprovisionVm;
pub use update_agent::UpdateAgentOnNode;
pub use update_service::UpdateServiceParams;

/// Everything a procedure may touch while executing.
pub struct Context<'a> {
    pub clients: &'a SdcClients,
    pub catalog: &'a Catalog,
    pub config: &'a Config,
    pub plan: &'a UpdatePlan,
    pub workdir: &'a Path,
    pub reporter: &'a mut dyn Reporter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureKind {
    ImportImage,
    UpdateServiceParams,
    ReprovisionVm,
    UpdateAgentOnNode,
    CreateVmInstance,
    DeleteVmInstance,
    DeleteAgentInstance,
}

/// One concrete step of an update plan.
pub trait Procedure {
    fn kind(&self) -> ProcedureKind;
    /// One-line human description.
    fn summarize(&self) -> String;
    fn execute(&self, ctx: &mut Context<'_>) -> Result<()>;
}

/// Map a plan's resolved change set to its ordered procedure pipeline.
pub fn coordinate(plan: &UpdatePlan) -> Vec<Box<dyn Procedure>> {
    let mut imports: Vec<Box<dyn Procedure>> = Vec::new();
    let mut params: Vec<Box<dyn Procedure>> = Vec::new();
    let mut work: Vec<Box<dyn Procedure>> = Vec::new();
    let mut deletes: Vec<Box<dyn Procedure>> = Vec::new();

    let mut imported: BTreeSet<Uuid> = BTreeSet::new();

    for change in &plan.changes {
        if let Some(image) = &change.image {
            if imported.insert(image.uuid) {
                imports.push(Box::new(ImportImage::new(image.clone())));
            }
        }

        match change.kind {
            ChangeKind::UpdateService => {
                let Some(image) = &change.image else { continue };
                params.push(Box::new(UpdateServiceParams::new(
                    change.service.clone(),
                    image.clone(),
                )));
                for instance in plan.curr.iter().filter(|i| i.service == change.service.name) {
                    match instance.kind {
                        InstanceKind::Vm => work.push(Box::new(ReprovisionVm::new(
                            instance.clone(),
                            image.clone(),
                        ))),
                        InstanceKind::Agent => {
                            if let Some(server) = instance.server {
                                work.push(Box::new(UpdateAgentOnNode::new(
                                    server,
                                    change.service.name.clone(),
                                    image.clone(),
                                )));
                            }
                        }
                    }
                }
            }
            ChangeKind::UpdateInstance => {
                let (Some(instance), Some(image)) = (&change.instance, &change.image) else {
                    continue;
                };
                match instance.kind {
                    InstanceKind::Vm => work.push(Box::new(ReprovisionVm::new(
                        instance.clone(),
                        image.clone(),
                    ))),
                    InstanceKind::Agent => {
                        if let Some(server) = instance.server {
                            work.push(Box::new(UpdateAgentOnNode::new(
                                server,
                                instance.service.clone(),
                                image.clone(),
                            )));
                        }
                    }
                }
            }
            ChangeKind::CreateInstance => {
                let (Some(server), Some(image)) = (change.server, &change.image) else {
                    continue;
                };
                work.push(Box::new(CreateVmInstance::new(
                    change.service.clone(),
                    server,
                    image.clone(),
                )));
            }
            ChangeKind::DeleteInstance => {
                let Some(instance) = &change.instance else { continue };
                match instance.kind {
                    InstanceKind::Vm => {
                        deletes.push(Box::new(DeleteVmInstance::new(instance.clone())));
                    }
                    InstanceKind::Agent => {
                        if let Some(server) = instance.server {
                            deletes.push(Box::new(DeleteAgentInstance::new(
                                server,
                                instance.service.clone(),
                            )));
                        }
                    }
                }
            }
            ChangeKind::DeleteService => {
                for instance in plan.curr.iter().filter(|i| i.service == change.service.name) {
                    match instance.kind {
                        InstanceKind::Vm => {
                            deletes.push(Box::new(DeleteVmInstance::new(instance.clone())));
                        }
                        InstanceKind::Agent => {
                            if let Some(server) = instance.server {
                                deletes.push(Box::new(DeleteAgentInstance::new(
                                    server,
                                    instance.service.clone(),
                                )));
                            }
                        }
                    }
                }
            }
        }
    }

    let mut pipeline = imports;
    pipeline.extend(params);
    pipeline.extend(work);
    pipeline.extend(deletes);
    pipeline
}
