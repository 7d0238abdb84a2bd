//! Change resolution: swap identifiers for inventory records and choose a
//! target image per change, then apply the post-resolution filters.
//!
//! When a change names an instance without its service, the owning service
//! is read from the inventory record's `service` field. Dependency
//! resolution is a single hook with a latest-available policy until
//! cross-service constraints exist.

use anyhow::Result;
use uuid::Uuid;

use dcadm_config::Config;
use dcadm_types::{
    Change, ChangeKind, DcadmError, Image, Instance, ResolvedChange, Service, order_images,
};

use crate::catalog::Catalog;
use crate::inventory::FleetSnapshot;

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Allow updates to denylisted services (the message broker).
    pub force_rabbitmq: bool,
    /// Keep changes whose chosen image is already in use everywhere.
    pub force_same_image: bool,
}

/// A change mid-resolution, as seen by the dependency hook: the candidate
/// list is still open.
#[derive(Debug, Clone)]
pub struct PendingChange {
    pub change: Change,
    pub service: Service,
    pub instance: Option<Instance>,
    pub server: Option<Uuid>,
    /// Explicitly pinned image, when the user gave one.
    pub pinned: Option<Image>,
    /// Candidates for changes without a pinned image.
    pub candidates: Vec<Image>,
}

/// Dependency-resolution hook. The current policy is latest-available, so
/// the set passes through unchanged; cross-service ordering constraints
/// get implemented here when they exist.
pub fn resolve_dependencies(pending: Vec<PendingChange>) -> Vec<PendingChange> {
    pending
}

/// Resolve a validated change set against the fleet.
pub fn resolve_changes(
    changes: &[Change],
    snapshot: &FleetSnapshot,
    catalog: &Catalog,
    config: &Config,
    opts: &ResolveOptions,
) -> Result<Vec<ResolvedChange>> {
    let mut pending: Vec<PendingChange> = Vec::with_capacity(changes.len());
    for change in changes {
        pending.push(resolve_one(change, snapshot, catalog, config, opts)?);
    }

    let pending = resolve_dependencies(pending);

    let mut resolved: Vec<ResolvedChange> = Vec::new();
    for p in pending {
        let kind = p.change.kind();

        let image = match (&p.pinned, kind) {
            (_, ChangeKind::DeleteService | ChangeKind::DeleteInstance) => None,
            (Some(image), _) => Some(image.clone()),
            (None, _) => {
                let mut candidates = p.candidates.clone();
                if candidates.is_empty() {
                    // A service-level change with nothing to move to is
                    // dropped, not an error.
                    if kind == ChangeKind::UpdateService {
                        continue;
                    }
                    return Err(DcadmError::update(format!(
                        "no candidate images for service {:?}",
                        p.service.name
                    ))
                    .into());
                }
                order_images(&mut candidates);
                candidates.last().cloned()
            }
        };

        // Drop no-op updates: the chosen image is already running on every
        // matching instance.
        if !opts.force_same_image
            && matches!(kind, ChangeKind::UpdateService | ChangeKind::UpdateInstance)
        {
            if let Some(image) = &image {
                let matching: Vec<&Instance> = match &p.instance {
                    Some(instance) => vec![instance],
                    None => snapshot.instances_of(&p.service.name),
                };
                if !matching.is_empty() && matching.iter().all(|i| i.image == Some(image.uuid)) {
                    continue;
                }
            }
        }

        resolved.push(ResolvedChange {
            kind,
            service: p.service,
            instance: p.instance,
            server: p.server,
            image,
        });
    }

    Ok(resolved)
}

fn resolve_one(
    change: &Change,
    snapshot: &FleetSnapshot,
    catalog: &Catalog,
    config: &Config,
    opts: &ResolveOptions,
) -> Result<PendingChange> {
    let instance = resolve_instance(change, snapshot)?;

    let service = match change.service_token() {
        Some(name) => snapshot
            .service_by_name(name)
            .cloned()
            .ok_or_else(|| DcadmError::update(format!("unknown service: {name:?}")))?,
        None => {
            let inst = instance.as_ref().ok_or_else(|| {
                DcadmError::usage("change names neither a service nor an instance")
            })?;
            snapshot
                .service_by_name(&inst.service)
                .cloned()
                .ok_or_else(|| {
                    DcadmError::update(format!(
                        "instance {} belongs to unknown service {:?}",
                        inst.id, inst.service
                    ))
                })?
        }
    };

    if config.update_denylist.contains(&service.name) && !opts.force_rabbitmq {
        return Err(DcadmError::update(format!(
            "updates to {:?} are disabled (pass the override flag to proceed)",
            service.name
        ))
        .into());
    }

    let server = resolve_server(change, snapshot, instance.as_ref())?;

    check_min_platform(change, &instance, snapshot, config)?;

    let pinned = match change.image_token() {
        Some(token) => {
            let uuid: Uuid = token.parse().map_err(|_| {
                DcadmError::usage(format!("image must be a uuid, got {token:?}"))
            })?;
            Some(catalog.get_image(uuid)?)
        }
        None => match change {
            Change::CreateInstance { .. } => {
                // New instances default to the service's registered image.
                let uuid = service.params.image_uuid.ok_or_else(|| {
                    DcadmError::update(format!(
                        "service {:?} has no default image for create-instance",
                        service.name
                    ))
                })?;
                Some(catalog.get_image(uuid)?)
            }
            _ => None,
        },
    };

    let candidates = if pinned.is_none()
        && matches!(
            change.kind(),
            ChangeKind::UpdateService | ChangeKind::UpdateInstance
        ) {
        catalog.candidates(&service.name, &snapshot.instances_of(&service.name))?
    } else {
        Vec::new()
    };

    Ok(PendingChange {
        change: change.clone(),
        service,
        instance,
        server,
        pinned,
        candidates,
    })
}

fn resolve_instance(change: &Change, snapshot: &FleetSnapshot) -> Result<Option<Instance>> {
    if let Some(token) = change.instance_token() {
        let instance = snapshot
            .instance_by_id(token)
            .or_else(|| snapshot.instance_by_alias(token))
            .cloned()
            .ok_or_else(|| DcadmError::update(format!("unknown instance: {token:?}")))?;
        return Ok(Some(instance));
    }

    // The (service, server) form names one instance for delete/update.
    if matches!(
        change,
        Change::DeleteInstance { .. } | Change::UpdateInstance { .. }
    ) {
        let (Some(service), Some(server_token)) = (change.service_token(), change.server_token())
        else {
            // Field-shape problems are the validator's to report.
            return Ok(None);
        };
        let node = lookup_node(server_token, snapshot)?;
        let instance = snapshot
            .instances_of(service)
            .into_iter()
            .find(|i| i.server == Some(node.uuid))
            .cloned()
            .ok_or_else(|| {
                DcadmError::update(format!(
                    "no instance of {service:?} on node {}",
                    node.hostname
                ))
            })?;
        return Ok(Some(instance));
    }

    Ok(None)
}

fn resolve_server(
    change: &Change,
    snapshot: &FleetSnapshot,
    instance: Option<&Instance>,
) -> Result<Option<Uuid>> {
    if let Some(token) = change.server_token() {
        let node = lookup_node(token, snapshot)?;
        return Ok(Some(node.uuid));
    }
    Ok(instance.and_then(|i| i.server))
}

fn lookup_node<'a>(
    token: &str,
    snapshot: &'a FleetSnapshot,
) -> Result<&'a dcadm_types::ComputeNode> {
    let node = match token.parse::<Uuid>() {
        Ok(uuid) => snapshot.node_by_uuid(uuid),
        Err(_) => snapshot.node_by_hostname(token),
    };
    node.ok_or_else(|| DcadmError::update(format!("unknown server: {token:?}")).into())
}

/// VM updates may not land on a host below the configured platform floor.
fn check_min_platform(
    change: &Change,
    instance: &Option<Instance>,
    snapshot: &FleetSnapshot,
    config: &Config,
) -> Result<()> {
    let Some(min) = &config.min_vm_platform else {
        return Ok(());
    };
    if !matches!(change, Change::UpdateInstance { .. }) {
        return Ok(());
    }
    let Some(instance) = instance else {
        return Ok(());
    };
    if instance.kind != dcadm_types::InstanceKind::Vm {
        return Ok(());
    }
    let Some(node) = instance.server.and_then(|s| snapshot.node_by_uuid(s)) else {
        return Ok(());
    };
    // Platform stamps compare lexicographically.
    if node.current_platform.as_str() < min.as_str() {
        return Err(DcadmError::update(format!(
            "instance {} is on platform {} older than the required minimum {}",
            instance.id, node.current_platform, min
        ))
        .into());
    }
    Ok(())
}
