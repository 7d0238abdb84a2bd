//! Change-set parsing and validation.
//!
//! Validation collects every violation and reports them as one aggregate
//! error. Conflict detection is a two-pass scan: pass one populates the
//! service and instance maps, flagging duplicates; pass two flags
//! service-level changes overlapping instance-level changes on the same
//! service.

use std::collections::BTreeMap;

use anyhow::Result;

use dcadm_types::{Change, DcadmError, MultiError};

use crate::catalog::image_name_for_service;
use crate::inventory::{FleetSnapshot, Resolution};

/// Fields accepted per change type; anything else is a validation error.
const CHANGE_FIELDS: &[(&str, &[&str])] = &[
    ("create-instance", &["service", "server", "image"]),
    ("delete-instance", &["instance", "service", "server", "image"]),
    ("delete-service", &["service"]),
    ("update-instance", &["instance", "service", "server", "image"]),
    ("update-service", &["service", "image"]),
];

/// Parse a user-supplied change set. Extraneous fields and malformed
/// shapes are validation errors.
pub fn parse_changes(json: &str) -> Result<Vec<Change>, DcadmError> {
    let raw: Vec<serde_json::Value> = serde_json::from_str(json)
        .map_err(|e| DcadmError::validation(format!("invalid change set: {e}")))?;

    let mut changes = Vec::with_capacity(raw.len());
    for (idx, value) in raw.into_iter().enumerate() {
        let object = value
            .as_object()
            .ok_or_else(|| DcadmError::validation(format!("change #{idx} is not an object")))?;
        let kind = object
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DcadmError::validation(format!("change #{idx} has no type")))?;
        let allowed = CHANGE_FIELDS
            .iter()
            .find(|(name, _)| *name == kind)
            .map(|(_, fields)| *fields)
            .ok_or_else(|| {
                DcadmError::validation(format!("change #{idx} has unknown type {kind:?}"))
            })?;
        for key in object.keys() {
            if key != "type" && !allowed.contains(&key.as_str()) {
                return Err(DcadmError::validation(format!(
                    "change #{idx} ({kind}): unknown field {key:?}"
                )));
            }
        }

        let change: Change = serde_json::from_value(value)
            .map_err(|e| DcadmError::validation(format!("change #{idx}: {e}")))?;
        changes.push(change);
    }
    Ok(changes)
}

/// Build the implicit change set for positional CLI targets: a service
/// name becomes `update-service`, an instance alias or uuid becomes
/// `update-instance`.
pub fn changes_from_targets(targets: &[String], snapshot: &FleetSnapshot) -> Result<Vec<Change>> {
    let mut changes = Vec::with_capacity(targets.len());
    for target in targets {
        let change = match snapshot.resolve(target)? {
            Resolution::Service(service) => Change::UpdateService {
                service: service.name,
                image: None,
            },
            Resolution::Instance(instance) => Change::UpdateInstance {
                instance: Some(instance.id),
                service: None,
                server: None,
                image: None,
            },
            Resolution::Uuid(uuid) => {
                // A uuid may name either; prefer the instance record.
                if let Some(instance) = snapshot.instance_by_id(&uuid.to_string()) {
                    Change::UpdateInstance {
                        instance: Some(instance.id.clone()),
                        service: None,
                        server: None,
                        image: None,
                    }
                } else if let Some(service) = snapshot.services.iter().find(|s| s.uuid == uuid) {
                    Change::UpdateService {
                        service: service.name.clone(),
                        image: None,
                    }
                } else {
                    return Err(
                        DcadmError::update(format!("unknown uuid target: {uuid}")).into(),
                    );
                }
            }
            Resolution::Node(node) => {
                return Err(DcadmError::usage(format!(
                    "cannot update a node directly: {}",
                    node.hostname
                ))
                .into());
            }
        };
        changes.push(change);
    }
    Ok(changes)
}

/// One `update-service` change per updatable service in the snapshot.
pub fn changes_for_all(snapshot: &FleetSnapshot) -> Vec<Change> {
    snapshot
        .services
        .iter()
        .filter(|s| image_name_for_service(&s.name).is_some())
        .map(|s| Change::UpdateService {
            service: s.name.clone(),
            image: None,
        })
        .collect()
}

/// Validate a change set against the fleet snapshot. All violations are
/// collected; none short-circuits.
pub fn validate(changes: &[Change], snapshot: &FleetSnapshot) -> Result<(), DcadmError> {
    let mut errors = MultiError::new();

    for (idx, change) in changes.iter().enumerate() {
        check_identifier_form(idx, change, &mut errors);
    }

    // Pass 1: populate the maps, flagging duplicates.
    let mut by_service: BTreeMap<String, usize> = BTreeMap::new();
    let mut by_instance: BTreeMap<String, usize> = BTreeMap::new();

    for (idx, change) in changes.iter().enumerate() {
        if let Some(instance) = change.instance_token() {
            if by_instance.insert(instance.to_string(), idx).is_some() {
                errors.push(DcadmError::validation(format!(
                    "multiple changes for instance {instance:?}"
                )));
            }
        }
        if let Some(service) = change_service(change, snapshot) {
            // Same-level duplicates are flagged here; mixed service vs.
            // instance level is pass 2's job.
            if let Some(prev) = by_service.insert(service.clone(), idx) {
                if change.is_service_level() && changes[prev].is_service_level() {
                    errors.push(DcadmError::validation(format!(
                        "multiple changes for service {service:?}"
                    )));
                }
            }
        }
    }

    // Pass 2: a service-level change conflicts with any instance-level
    // change on the same service.
    for (idx, change) in changes.iter().enumerate() {
        if !change.is_service_level() {
            continue;
        }
        let Some(service) = change_service(change, snapshot) else {
            continue;
        };
        for (other_idx, other) in changes.iter().enumerate() {
            if other_idx == idx || other.is_service_level() {
                continue;
            }
            if change_service(other, snapshot).as_deref() == Some(service.as_str()) {
                errors.push(DcadmError::validation(format!(
                    "change for service {service:?} conflicts with an instance-level change on the same service"
                )));
            }
        }
    }

    errors.into_result()
}

/// The service a change touches, resolving instance tokens through the
/// snapshot when the change does not name the service itself.
fn change_service(change: &Change, snapshot: &FleetSnapshot) -> Option<String> {
    if let Some(service) = change.service_token() {
        return Some(service.to_string());
    }
    let token = change.instance_token()?;
    snapshot
        .instance_by_id(token)
        .or_else(|| snapshot.instance_by_alias(token))
        .map(|i| i.service.clone())
}

fn check_identifier_form(idx: usize, change: &Change, errors: &mut MultiError) {
    if let Change::DeleteInstance {
        instance,
        service,
        server,
        ..
    }
    | Change::UpdateInstance {
        instance,
        service,
        server,
        ..
    } = change
    {
        let by_id = instance.is_some();
        let by_location = service.is_some() || server.is_some();
        match (by_id, by_location) {
            (true, true) => errors.push(DcadmError::validation(format!(
                "change #{idx}: give either an instance id or (service, server), not both"
            ))),
            (false, false) => errors.push(DcadmError::validation(format!(
                "change #{idx}: an instance id or (service, server) is required"
            ))),
            (false, true) if service.is_none() || server.is_none() => {
                errors.push(DcadmError::validation(format!(
                    "change #{idx}: both service and server are required to locate an instance"
                )));
            }
            _ => {}
        }
    }
}
