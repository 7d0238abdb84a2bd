//! Fleet enumeration and identifier resolution.
//!
//! The inventory produces two ordered sequences: *services* (registry
//! services plus the fixed list of known agent services) and *instances*
//! (core VMs plus one entry per declared agent on every node). Core VMs
//! are identified by the `smartdc_role` tag and the admin owner account.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use dcadm_config::Config;
use dcadm_types::{
    ComputeNode, DcadmError, Image, Instance, InstanceKind, Service, ServiceKind, ServiceParams,
};

use crate::api::SdcClients;
use crate::api::vmapi::Vm;

/// Agent services that exist on every node whether or not the registry
/// knows them.
pub const KNOWN_AGENT_SERVICES: &[&str] = &[
    "agents_core",
    "amon-agent",
    "cn-agent",
    "config-agent",
    "firewaller",
    "net-agent",
    "smartlogin",
    "vm-agent",
];

/// Application name grouping the control-plane services in the registry.
pub const CONTROL_APPLICATION: &str = "sdc";

/// A point-in-time view of the fleet, fetched once per command.
#[derive(Debug, Clone)]
pub struct FleetSnapshot {
    pub services: Vec<Service>,
    pub instances: Vec<Instance>,
    pub nodes: Vec<ComputeNode>,
}

/// What a user-supplied token resolved to.
#[derive(Debug, Clone)]
pub enum Resolution {
    Uuid(Uuid),
    Service(Service),
    Instance(Instance),
    Node(ComputeNode),
}

pub struct Inventory<'a> {
    clients: &'a SdcClients,
    config: &'a Config,
}

impl<'a> Inventory<'a> {
    pub fn new(clients: &'a SdcClients, config: &'a Config) -> Self {
        Self { clients, config }
    }

    /// Registry services plus the fixed agent list, ordered by name.
    pub fn services(&self) -> Result<Vec<Service>> {
        let apps = self
            .clients
            .sapi
            .list_applications(CONTROL_APPLICATION)
            .context("failed to list control application")?;
        let app = apps
            .into_iter()
            .next()
            .with_context(|| format!("no {CONTROL_APPLICATION} application in the registry"))?;

        let mut services = self
            .clients
            .sapi
            .list_services(Some(app.uuid), None)
            .context("failed to list services")?;

        for name in KNOWN_AGENT_SERVICES {
            if !services.iter().any(|s| s.name == *name) {
                services.push(synthetic_agent_service(name));
            }
        }

        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    pub fn nodes(&self) -> Result<Vec<ComputeNode>> {
        let mut nodes: Vec<ComputeNode> = self
            .clients
            .cnapi
            .list_servers(true)
            .context("failed to list servers")?
            .into_iter()
            .map(|payload| payload.into_node())
            .collect();
        nodes.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        Ok(nodes)
    }

    /// All instances: one per core VM, one per declared agent per node,
    /// ordered by `(service, id)`. Each record carries image and version
    /// when an image lookup finds them.
    pub fn instances(&self, nodes: &[ComputeNode]) -> Result<Vec<Instance>> {
        let owner = self
            .config
            .admin_owner_uuid
            .ok_or_else(|| DcadmError::usage("no admin owner uuid configured"))?;
        let vms = self
            .clients
            .vmapi
            .list_admin_vms(owner)
            .context("failed to list admin VMs")?;

        let mut image_cache: BTreeMap<Uuid, Option<Image>> = BTreeMap::new();
        let mut lookup = |uuid: Uuid| -> Result<Option<Image>> {
            if let Some(cached) = image_cache.get(&uuid) {
                return Ok(cached.clone());
            }
            let image = self.clients.imgapi.get_image_opt(uuid)?;
            image_cache.insert(uuid, image.clone());
            Ok(image)
        };

        let hostnames: BTreeMap<Uuid, &str> = nodes
            .iter()
            .map(|n| (n.uuid, n.hostname.as_str()))
            .collect();

        let mut instances: Vec<Instance> = Vec::new();
        for vm in &vms {
            if vm.smartdc_role().is_none() {
                continue;
            }
            let image = match vm.image_uuid {
                Some(uuid) => lookup(uuid)?,
                None => None,
            };
            instances.push(vm_instance(vm, hostnames.get(&vm.server_uuid).copied(), image));
        }

        for node in nodes {
            instances.extend(agent_instances(node));
        }

        instances.sort_by(|a, b| {
            (a.service.as_str(), a.id.as_str()).cmp(&(b.service.as_str(), b.id.as_str()))
        });
        Ok(instances)
    }

    pub fn snapshot(&self) -> Result<FleetSnapshot> {
        let services = self.services()?;
        let nodes = self.nodes()?;
        let instances = self.instances(&nodes)?;
        Ok(FleetSnapshot {
            services,
            instances,
            nodes,
        })
    }
}

/// Placeholder registry entry for an agent service the registry does not
/// track. The nil uuid keeps plans deterministic.
fn synthetic_agent_service(name: &str) -> Service {
    Service {
        uuid: Uuid::nil(),
        name: name.to_string(),
        kind: ServiceKind::Agent,
        params: ServiceParams::default(),
        metadata: BTreeMap::new(),
    }
}

fn vm_instance(vm: &Vm, hostname: Option<&str>, image: Option<Image>) -> Instance {
    let role = vm.smartdc_role().unwrap_or_default().to_string();
    Instance {
        id: vm.uuid.to_string(),
        service: role,
        kind: InstanceKind::Vm,
        alias: vm.alias.clone(),
        server: Some(vm.server_uuid),
        hostname: hostname.map(str::to_string),
        image: vm.image_uuid,
        version: image.map(|i| i.version),
    }
}

fn agent_instances(node: &ComputeNode) -> Vec<Instance> {
    node.agents
        .iter()
        .map(|agent| Instance {
            id: Instance::agent_id(node.uuid, &agent.name),
            service: agent.name.clone(),
            kind: InstanceKind::Agent,
            alias: None,
            server: Some(node.uuid),
            hostname: Some(node.hostname.clone()),
            image: agent.image_uuid,
            version: agent.version.clone(),
        })
        .collect()
}

impl FleetSnapshot {
    /// Resolve a human token: a UUID literal, else a service name, else a
    /// VM alias, else a node hostname. More than one match is fatal.
    pub fn resolve(&self, token: &str) -> Result<Resolution> {
        if let Ok(uuid) = token.parse::<Uuid>() {
            return Ok(Resolution::Uuid(uuid));
        }

        let mut matches: Vec<Resolution> = Vec::new();
        if let Some(service) = self.services.iter().find(|s| s.name == token) {
            matches.push(Resolution::Service(service.clone()));
        }
        if let Some(instance) = self
            .instances
            .iter()
            .find(|i| i.alias.as_deref() == Some(token))
        {
            matches.push(Resolution::Instance(instance.clone()));
        }
        if let Some(node) = self.nodes.iter().find(|n| n.hostname == token) {
            matches.push(Resolution::Node(node.clone()));
        }

        match matches.len() {
            0 => bail!(DcadmError::update(format!("unknown name: {token:?}"))),
            1 => Ok(matches.remove(0)),
            n => bail!(DcadmError::update(format!(
                "ambiguous name {token:?}: matches {n} of service/alias/hostname"
            ))),
        }
    }

    pub fn service_by_name(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn instance_by_id(&self, id: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn instance_by_alias(&self, alias: &str) -> Option<&Instance> {
        self.instances
            .iter()
            .find(|i| i.alias.as_deref() == Some(alias))
    }

    pub fn instances_of(&self, service: &str) -> Vec<&Instance> {
        self.instances
            .iter()
            .filter(|i| i.service == service)
            .collect()
    }

    pub fn node_by_uuid(&self, uuid: Uuid) -> Option<&ComputeNode> {
        self.nodes.iter().find(|n| n.uuid == uuid)
    }

    pub fn node_by_hostname(&self, hostname: &str) -> Option<&ComputeNode> {
        self.nodes.iter().find(|n| n.hostname == hostname)
    }
}

#[cfg(test)]
mod tests {
    use dcadm_types::NodeAgent;

    use super::*;

    fn node(hostname: &str, agents: &[&str]) -> ComputeNode {
        ComputeNode {
            uuid: Uuid::new_v4(),
            hostname: hostname.to_string(),
            status: "running".to_string(),
            transitional_status: String::new(),
            current_platform: "20230101T000000Z".to_string(),
            boot_platform: "20230101T000000Z".to_string(),
            headnode: hostname == "headnode",
            agents: agents
                .iter()
                .map(|name| NodeAgent {
                    name: name.to_string(),
                    version: Some("1.0.0".to_string()),
                    image_uuid: None,
                })
                .collect(),
        }
    }

    fn vm_named(alias: &str, role: &str) -> Vm {
        serde_json::from_value(serde_json::json!({
            "uuid": Uuid::new_v4(),
            "alias": alias,
            "state": "running",
            "owner_uuid": Uuid::new_v4(),
            "server_uuid": Uuid::new_v4(),
            "image_uuid": Uuid::new_v4(),
            "tags": {"smartdc_role": role}
        }))
        .expect("vm")
    }

    fn snapshot() -> FleetSnapshot {
        let vm = vm_named("vmapi0", "vmapi");
        let n0 = node("headnode", &["net-agent"]);
        let n1 = node("cn0", &["net-agent"]);
        FleetSnapshot {
            services: vec![
                Service {
                    uuid: Uuid::new_v4(),
                    name: "vmapi".to_string(),
                    kind: ServiceKind::Vm,
                    params: ServiceParams::default(),
                    metadata: BTreeMap::new(),
                },
                synthetic_agent_service("net-agent"),
            ],
            instances: vec![vm_instance(&vm, Some("headnode"), None)],
            nodes: vec![n0, n1],
        }
    }

    #[test]
    fn resolve_prefers_uuid_literal() {
        let snap = snapshot();
        let uuid = Uuid::new_v4();
        match snap.resolve(&uuid.to_string()).expect("resolve") {
            Resolution::Uuid(resolved) => assert_eq!(resolved, uuid),
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn resolve_finds_service_alias_and_hostname() {
        let snap = snapshot();
        assert!(matches!(
            snap.resolve("vmapi").expect("service"),
            Resolution::Service(_)
        ));
        assert!(matches!(
            snap.resolve("vmapi0").expect("alias"),
            Resolution::Instance(_)
        ));
        assert!(matches!(
            snap.resolve("cn0").expect("hostname"),
            Resolution::Node(_)
        ));
    }

    #[test]
    fn resolve_unknown_token_fails() {
        let snap = snapshot();
        let err = snap.resolve("nope").expect_err("unknown");
        assert!(err.to_string().contains("unknown name"));
    }

    #[test]
    fn resolve_ambiguity_is_fatal() {
        let mut snap = snapshot();
        // A node whose hostname collides with a service name.
        snap.nodes.push(node("vmapi", &[]));
        let err = snap.resolve("vmapi").expect_err("ambiguous");
        assert!(err.to_string().contains("ambiguous name"));
    }

    #[test]
    fn agent_instances_use_composite_ids() {
        let n = node("cn0", &["net-agent", "config-agent"]);
        let instances = agent_instances(&n);
        assert_eq!(instances.len(), 2);
        for inst in &instances {
            assert_eq!(inst.kind, InstanceKind::Agent);
            assert_eq!(
                inst.id,
                Instance::agent_id(n.uuid, &inst.service),
                "composite id is <node>/<service>"
            );
        }
    }

    #[test]
    fn vm_instance_carries_version_from_image_lookup() {
        let vm = vm_named("sapi0", "sapi");
        let image = Image {
            uuid: vm.image_uuid.expect("image uuid"),
            name: "sapi".to_string(),
            version: "master-20230131T004516Z-gabc".to_string(),
            published_at: "2023-01-31T01:00:00Z".parse().expect("time"),
            files: vec![],
            tags: BTreeMap::new(),
        };
        let inst = vm_instance(&vm, Some("headnode"), Some(image));
        assert_eq!(inst.service, "sapi");
        assert_eq!(
            inst.version.as_deref(),
            Some("master-20230131T004516Z-gabc")
        );
    }
}
