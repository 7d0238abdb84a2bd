//! Rolling reboot engine.
//!
//! Plans are owned by the compute-node manager; this module creates them
//! from a node selection and drives pending plans to completion. Nodes
//! hosting core VMs reboot strictly one at a time, before everything else;
//! the rest reboot in batches bounded by the plan's concurrency.

use std::collections::BTreeSet;

use anyhow::Result;
use uuid::Uuid;

use dcadm_types::{ComputeNode, InstanceKind, Reboot};

use crate::api::SdcClients;
use crate::api::cnapi::RebootPlanRef;
use crate::inventory::FleetSnapshot;

pub mod runner;
pub mod shard;

#[derive(Debug, Clone, Copy)]
pub struct CreateOptions {
    pub concurrency: u32,
    /// Skip nodes already booted into their next platform.
    pub skip_current: bool,
    /// Run one batch, then stop for inspection.
    pub single_step: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            skip_current: false,
            single_step: false,
        }
    }
}

/// One node in a previewed plan.
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub node: ComputeNode,
    pub core: bool,
}

/// The plan as shown for confirmation: entries kept, warnings to print.
#[derive(Debug, Clone, Default)]
pub struct PlanPreview {
    pub entries: Vec<PlanEntry>,
    pub warnings: Vec<String>,
}

/// Server uuids hosting at least one core VM.
pub fn core_servers(snapshot: &FleetSnapshot) -> BTreeSet<Uuid> {
    snapshot
        .instances
        .iter()
        .filter(|i| i.kind == InstanceKind::Vm)
        .filter_map(|i| i.server)
        .collect()
}

/// Classify the selected nodes and collect platform warnings.
pub fn preview(snapshot: &FleetSnapshot, selected: &[ComputeNode], opts: &CreateOptions) -> PlanPreview {
    let core = core_servers(snapshot);
    let mut preview = PlanPreview::default();

    for node in selected {
        if node.current_platform == node.boot_platform {
            if opts.skip_current {
                preview.warnings.push(format!(
                    "{}: already on boot platform {}, skipping",
                    node.hostname, node.boot_platform
                ));
                continue;
            }
            preview.warnings.push(format!(
                "{}: will reboot onto the same platform {}",
                node.hostname, node.boot_platform
            ));
        } else if node.current_platform.as_str() > node.boot_platform.as_str() {
            preview.warnings.push(format!(
                "{}: boot platform {} is a downgrade from {}",
                node.hostname, node.boot_platform, node.current_platform
            ));
        }

        preview.entries.push(PlanEntry {
            core: core.contains(&node.uuid),
            node: node.clone(),
        });
    }

    preview
}

/// Submit the previewed plan to the compute-node manager.
pub fn create(
    clients: &SdcClients,
    preview: &PlanPreview,
    opts: &CreateOptions,
) -> Result<RebootPlanRef> {
    let servers: Vec<Uuid> = preview.entries.iter().map(|e| e.node.uuid).collect();
    let created =
        clients
            .cnapi
            .create_reboot_plan(&servers, opts.concurrency, opts.single_step)?;
    Ok(created)
}

/// Partition the remaining reboots into ordered batches: core-node reboots
/// first, one per batch; non-core reboots after, chunked by concurrency.
/// Reboots within a batch have no mutual order.
pub fn partition(
    remaining: Vec<Reboot>,
    core: &BTreeSet<Uuid>,
    concurrency: u32,
) -> Vec<Vec<Reboot>> {
    let chunk = concurrency.max(1) as usize;

    let (core_reboots, non_core): (Vec<Reboot>, Vec<Reboot>) = remaining
        .into_iter()
        .partition(|r| core.contains(&r.server_uuid) || r.headnode);

    let mut batches: Vec<Vec<Reboot>> = core_reboots.into_iter().map(|r| vec![r]).collect();
    let mut rest = non_core.into_iter().peekable();
    while rest.peek().is_some() {
        batches.push(rest.by_ref().take(chunk).collect());
    }
    batches
}

#[cfg(test)]
mod tests {
    use dcadm_types::Instance;
    use proptest::prelude::*;

    use super::*;

    fn node(hostname: &str, current: &str, boot: &str) -> ComputeNode {
        ComputeNode {
            uuid: Uuid::new_v4(),
            hostname: hostname.to_string(),
            status: "running".to_string(),
            transitional_status: String::new(),
            current_platform: current.to_string(),
            boot_platform: boot.to_string(),
            headnode: false,
            agents: vec![],
        }
    }

    fn reboot_of(server: Uuid, hostname: &str) -> Reboot {
        Reboot {
            server_uuid: server,
            server_hostname: hostname.to_string(),
            current_platform: "20230101T000000Z".to_string(),
            boot_platform: "20230201T000000Z".to_string(),
            headnode: false,
            job_uuid: None,
            reboot_uuid: None,
            started_at: None,
            finished_at: None,
            operational_at: None,
            canceled_at: None,
        }
    }

    fn snapshot_with_core_vm_on(server: Uuid) -> FleetSnapshot {
        FleetSnapshot {
            services: vec![],
            instances: vec![Instance {
                id: Uuid::new_v4().to_string(),
                service: "vmapi".to_string(),
                kind: InstanceKind::Vm,
                alias: None,
                server: Some(server),
                hostname: None,
                image: None,
                version: None,
            }],
            nodes: vec![],
        }
    }

    #[test]
    fn partition_serializes_core_nodes_first() {
        let core_node = Uuid::new_v4();
        let core: BTreeSet<Uuid> = [core_node].into_iter().collect();

        let remaining = vec![
            reboot_of(Uuid::new_v4(), "cn1"),
            reboot_of(core_node, "cn-core"),
            reboot_of(Uuid::new_v4(), "cn2"),
            reboot_of(Uuid::new_v4(), "cn3"),
        ];

        let batches = partition(remaining, &core, 2);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].server_hostname, "cn-core");
        assert_eq!(batches[1].len(), 2);
        assert_eq!(batches[2].len(), 1);
    }

    #[test]
    fn partition_three_non_core_with_concurrency_two() {
        let remaining = vec![
            reboot_of(Uuid::new_v4(), "cn1"),
            reboot_of(Uuid::new_v4(), "cn2"),
            reboot_of(Uuid::new_v4(), "cn3"),
        ];
        let batches = partition(remaining, &BTreeSet::new(), 2);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
    }

    #[test]
    fn partition_core_batches_always_have_size_one() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let core: BTreeSet<Uuid> = [a, b].into_iter().collect();
        let remaining = vec![reboot_of(a, "core-a"), reboot_of(b, "core-b")];

        let batches = partition(remaining, &core, 4);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 1));
    }

    #[test]
    fn headnode_reboots_are_treated_as_core() {
        let mut reboot = reboot_of(Uuid::new_v4(), "headnode");
        reboot.headnode = true;
        let other = reboot_of(Uuid::new_v4(), "cn1");

        let batches = partition(vec![other, reboot], &BTreeSet::new(), 4);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].server_hostname, "headnode");
    }

    #[test]
    fn preview_flags_same_platform_and_downgrade() {
        let same = node("cn-same", "20230101T000000Z", "20230101T000000Z");
        let downgrade = node("cn-down", "20230201T000000Z", "20230101T000000Z");
        let upgrade = node("cn-up", "20230101T000000Z", "20230201T000000Z");

        let snapshot = snapshot_with_core_vm_on(Uuid::new_v4());
        let preview = preview(
            &snapshot,
            &[same, downgrade, upgrade],
            &CreateOptions::default(),
        );

        assert_eq!(preview.entries.len(), 3);
        assert!(preview.warnings.iter().any(|w| w.contains("same platform")));
        assert!(preview.warnings.iter().any(|w| w.contains("downgrade")));
    }

    #[test]
    fn preview_skip_current_drops_settled_nodes() {
        let same = node("cn-same", "20230101T000000Z", "20230101T000000Z");
        let snapshot = snapshot_with_core_vm_on(Uuid::new_v4());
        let opts = CreateOptions {
            skip_current: true,
            ..Default::default()
        };
        let preview = preview(&snapshot, &[same], &opts);
        assert!(preview.entries.is_empty());
        assert!(preview.warnings.iter().any(|w| w.contains("skipping")));
    }

    proptest! {
        #[test]
        fn partition_core_singletons_always_precede_non_core(
            core_flags in prop::collection::vec(any::<bool>(), 0..12),
            concurrency in 1u32..4,
        ) {
            let mut core: BTreeSet<Uuid> = BTreeSet::new();
            let remaining: Vec<Reboot> = core_flags
                .iter()
                .enumerate()
                .map(|(i, is_core)| {
                    let server = Uuid::new_v4();
                    if *is_core {
                        core.insert(server);
                    }
                    reboot_of(server, &format!("cn{i}"))
                })
                .collect();
            let total = remaining.len();

            let batches = partition(remaining, &core, concurrency);

            prop_assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), total);
            let mut seen_non_core = false;
            for batch in &batches {
                let has_core = batch.iter().any(|r| core.contains(&r.server_uuid));
                if has_core {
                    prop_assert_eq!(batch.len(), 1);
                    prop_assert!(!seen_non_core, "core batch after a non-core batch");
                } else {
                    prop_assert!(batch.len() <= concurrency as usize);
                    seen_non_core = true;
                }
            }
        }
    }

    #[test]
    fn preview_marks_core_nodes() {
        let core_host = node("cn-core", "a", "b");
        let plain = node("cn-plain", "a", "b");
        let snapshot = snapshot_with_core_vm_on(core_host.uuid);

        let preview = preview(&snapshot, &[core_host, plain], &CreateOptions::default());
        assert!(preview.entries[0].core);
        assert!(!preview.entries[1].core);
    }
}
