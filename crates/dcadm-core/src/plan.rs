//! Update-plan assembly.
//!
//! The plan snapshots the current inventory, computes the target inventory
//! the change set implies, and is serializable to the stable wire form
//! (`{"v":1,"targ":...,"changes":...,"justImages":...}`). Given fixed
//! inventory and catalog responses the serialized plan is byte-identical
//! across runs.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use dcadm_types::{
    ChangeKind, Instance, InstanceKind, PLAN_FORMAT_VERSION, ResolvedChange, UpdatePlan,
};

use crate::inventory::FleetSnapshot;

pub fn build_plan(
    snapshot: &FleetSnapshot,
    changes: Vec<ResolvedChange>,
    just_images: bool,
) -> UpdatePlan {
    let curr = snapshot.instances.clone();
    let targ = compute_target(&curr, &changes);
    UpdatePlan {
        v: PLAN_FORMAT_VERSION,
        curr,
        targ,
        changes,
        just_images,
    }
}

/// Stable identity of a plan: the SHA-256 of its serialized form.
pub fn plan_id(plan: &UpdatePlan) -> Result<String> {
    let json = serde_json::to_string(plan).context("failed to serialize plan")?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Apply the resolved changes to the current instance snapshot.
fn compute_target(curr: &[Instance], changes: &[ResolvedChange]) -> Vec<Instance> {
    let mut targ: Vec<Instance> = curr.to_vec();

    for change in changes {
        match change.kind {
            ChangeKind::UpdateService => {
                for instance in targ.iter_mut().filter(|i| i.service == change.service.name) {
                    retarget(instance, change);
                }
            }
            ChangeKind::UpdateInstance => {
                if let Some(target) = &change.instance {
                    if let Some(instance) = targ.iter_mut().find(|i| i.id == target.id) {
                        retarget(instance, change);
                    }
                }
            }
            ChangeKind::DeleteService => {
                targ.retain(|i| i.service != change.service.name);
            }
            ChangeKind::DeleteInstance => {
                if let Some(target) = &change.instance {
                    targ.retain(|i| i.id != target.id);
                }
            }
            ChangeKind::CreateInstance => {
                if let (Some(server), Some(image)) = (change.server, &change.image) {
                    // The real id is assigned by the VM manager; the target
                    // snapshot uses a deterministic placeholder.
                    targ.push(Instance {
                        id: format!("new-{}-{server}", change.service.name),
                        service: change.service.name.clone(),
                        kind: InstanceKind::Vm,
                        alias: None,
                        server: Some(server),
                        hostname: None,
                        image: Some(image.uuid),
                        version: Some(image.version.clone()),
                    });
                }
            }
        }
    }

    targ
}

fn retarget(instance: &mut Instance, change: &ResolvedChange) {
    if let Some(image) = &change.image {
        instance.image = Some(image.uuid);
        instance.version = Some(image.version.clone());
    }
}
