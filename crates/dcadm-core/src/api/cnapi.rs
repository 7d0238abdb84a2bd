//! Compute-node-manager client: servers, agent installs, remote command
//! execution, instance health, and the reboot-plan resource.

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dcadm_types::{
    ComputeNode, DcadmError, HealthFilter, InstanceHealth, NodeAgent, RebootPlan, RebootPlanState,
    Upstream,
};

use super::Endpoint;
use super::vmapi::JobRef;

/// Server record on the wire. The sysinfo extra carries the agent list;
/// [`ServerPayload::into_node`] flattens it into the inventory shape.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerPayload {
    pub uuid: Uuid,
    pub hostname: String,
    pub status: String,
    #[serde(default)]
    pub transitional_status: String,
    pub current_platform: String,
    pub boot_platform: String,
    #[serde(default)]
    pub headnode: bool,
    #[serde(default)]
    pub sysinfo: Option<Sysinfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sysinfo {
    #[serde(rename = "SDC Agents", default)]
    pub agents: Vec<NodeAgent>,
}

impl ServerPayload {
    pub fn into_node(self) -> ComputeNode {
        ComputeNode {
            uuid: self.uuid,
            hostname: self.hostname,
            status: self.status,
            transitional_status: self.transitional_status,
            current_platform: self.current_platform,
            boot_platform: self.boot_platform,
            headnode: self.headnode,
            agents: self.sysinfo.map(|s| s.agents).unwrap_or_default(),
        }
    }
}

/// Output of a command executed on a node.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandOutput {
    #[serde(default)]
    pub exit_status: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

#[derive(Debug, Serialize)]
struct RebootBody {
    drain: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reboot_plan: Option<Uuid>,
}

#[derive(Debug, Serialize)]
struct InstallAgentBody<'a> {
    agent: &'a str,
    image_uuid: Uuid,
}

#[derive(Debug, Serialize)]
struct ExecuteBody<'a> {
    script: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateRebootPlanBody<'a> {
    servers: &'a [Uuid],
    concurrency: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    single_step: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RebootPlanRef {
    pub uuid: Uuid,
}

/// Actions accepted by `PUT /reboot-plans/<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RebootPlanAction {
    Run,
    Stop,
    Cancel,
    Finish,
}

#[derive(Debug, Serialize)]
struct PlanActionBody {
    action: RebootPlanAction,
}

/// Timestamp write against one reboot within a plan. Exactly one field is
/// set per call.
#[derive(Debug, Default, Serialize)]
pub struct RebootUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operational_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canceled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CnapiClient {
    ep: Endpoint,
}

impl CnapiClient {
    pub fn new(http: Client, base: &str) -> Self {
        Self {
            ep: Endpoint::new(http, base, Upstream::Cnapi),
        }
    }

    pub fn list_servers(&self, include_sysinfo: bool) -> Result<Vec<ServerPayload>, DcadmError> {
        let query: Vec<(&str, String)> = if include_sysinfo {
            vec![("extras", "sysinfo".to_string())]
        } else {
            vec![]
        };
        self.ep.get_json("/servers", &query, "list servers")
    }

    pub fn get_server(&self, uuid: Uuid) -> Result<ServerPayload, DcadmError> {
        self.ep.get_json(
            &format!("/servers/{uuid}"),
            &[("extras", "sysinfo".to_string())],
            "get server",
        )
    }

    /// Submit a reboot of one node. `drain` lets workloads finish first;
    /// the reboot-plan reference ties the job back to its plan.
    pub fn reboot_server(
        &self,
        uuid: Uuid,
        drain: bool,
        reboot_plan: Option<Uuid>,
    ) -> Result<JobRef, DcadmError> {
        self.ep.post_json(
            &format!("/servers/{uuid}/reboot"),
            &RebootBody { drain, reboot_plan },
            "reboot server",
        )
    }

    /// Run the agent installer for `agent` on a node.
    pub fn install_agent(
        &self,
        server: Uuid,
        agent: &str,
        image_uuid: Uuid,
    ) -> Result<JobRef, DcadmError> {
        self.ep.post_json(
            &format!("/servers/{server}/install-agent"),
            &InstallAgentBody { agent, image_uuid },
            "install agent",
        )
    }

    /// Execute a command on a node, returning its output. Used for the
    /// data-store admin tool during reboot coordination.
    pub fn execute_command(&self, server: Uuid, script: &str) -> Result<CommandOutput, DcadmError> {
        self.ep.post_json(
            &format!("/servers/{server}/execute"),
            &ExecuteBody { script },
            "execute command",
        )
    }

    /// Per-instance health, as judged by the compute-node manager.
    pub fn instance_health(
        &self,
        filter: &HealthFilter,
    ) -> Result<Vec<InstanceHealth>, DcadmError> {
        self.ep
            .post_json("/instances/health", filter, "instance health")
    }

    pub fn list_reboot_plans(
        &self,
        state: Option<RebootPlanState>,
        include_reboots: bool,
    ) -> Result<Vec<RebootPlan>, DcadmError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(state) = state {
            query.push(("state", state.to_string()));
        }
        if include_reboots {
            query.push(("include_reboots", "true".to_string()));
        }
        self.ep.get_json("/reboot-plans", &query, "list reboot plans")
    }

    pub fn get_reboot_plan(&self, uuid: Uuid) -> Result<RebootPlan, DcadmError> {
        self.ep.get_json(
            &format!("/reboot-plans/{uuid}"),
            &[("include_reboots", "true".to_string())],
            "get reboot plan",
        )
    }

    pub fn create_reboot_plan(
        &self,
        servers: &[Uuid],
        concurrency: u32,
        single_step: bool,
    ) -> Result<RebootPlanRef, DcadmError> {
        self.ep.post_json(
            "/reboot-plans",
            &CreateRebootPlanBody {
                servers,
                concurrency,
                single_step: if single_step { Some(true) } else { None },
            },
            "create reboot plan",
        )
    }

    pub fn update_reboot_plan(
        &self,
        uuid: Uuid,
        action: RebootPlanAction,
    ) -> Result<(), DcadmError> {
        self.ep.put_ok(
            &format!("/reboot-plans/{uuid}"),
            &PlanActionBody { action },
            "update reboot plan",
        )
    }

    pub fn update_reboot(
        &self,
        plan: Uuid,
        reboot: Uuid,
        update: &RebootUpdate,
    ) -> Result<(), DcadmError> {
        self.ep.put_ok(
            &format!("/reboot-plans/{plan}/reboots/{reboot}"),
            update,
            "update reboot",
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::api::build_http_client;
    use crate::api::testutil::{json_response, with_server};

    use super::*;

    fn client(base: &str) -> CnapiClient {
        CnapiClient::new(build_http_client().expect("client"), base)
    }

    const SERVER: &str = r#"{
        "uuid": "55555555-5555-4555-8555-555555555555",
        "hostname": "cn0",
        "status": "running",
        "current_platform": "20230101T000000Z",
        "boot_platform": "20230201T000000Z",
        "headnode": false,
        "sysinfo": {"SDC Agents": [{"name": "net-agent", "version": "1.0.0"}]}
    }"#;

    #[test]
    fn list_servers_requests_sysinfo_extra() {
        let (base, handle) = with_server(|req| {
            assert_eq!(req.url(), "/servers?extras=sysinfo");
            req.respond(json_response(&format!("[{SERVER}]")))
                .expect("respond");
        });

        let servers = client(&base).list_servers(true).expect("list");
        let node = servers.into_iter().next().expect("one server").into_node();
        assert_eq!(node.hostname, "cn0");
        assert_eq!(node.agents.len(), 1);
        assert_eq!(node.agents[0].name, "net-agent");
        assert!(node.is_settled());
        handle.join().expect("join");
    }

    #[test]
    fn reboot_server_carries_drain_and_plan() {
        let (base, handle) = with_server(|mut req| {
            assert_eq!(req.method(), &tiny_http::Method::Post);
            assert_eq!(
                req.url(),
                "/servers/55555555-5555-4555-8555-555555555555/reboot"
            );
            let mut body = String::new();
            req.as_reader().read_to_string(&mut body).expect("body");
            let parsed: serde_json::Value = serde_json::from_str(&body).expect("json");
            assert_eq!(parsed["drain"], true);
            assert_eq!(
                parsed["reboot_plan"],
                "aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaaa"
            );
            req.respond(json_response(
                r#"{"job_uuid":"bbbbbbbb-bbbb-4bbb-8bbb-bbbbbbbbbbbb"}"#,
            ))
            .expect("respond");
        });

        let job = client(&base)
            .reboot_server(
                "55555555-5555-4555-8555-555555555555".parse().expect("uuid"),
                true,
                Some("aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaaa".parse().expect("uuid")),
            )
            .expect("reboot");
        assert_eq!(
            job.job_uuid.to_string(),
            "bbbbbbbb-bbbb-4bbb-8bbb-bbbbbbbbbbbb"
        );
        handle.join().expect("join");
    }

    #[test]
    fn list_reboot_plans_filters_state() {
        let (base, handle) = with_server(|req| {
            assert_eq!(req.url(), "/reboot-plans?state=pending&include_reboots=true");
            req.respond(json_response(
                r#"[{"uuid":"cccccccc-cccc-4ccc-8ccc-cccccccccccc","state":"pending","concurrency":2,"reboots":[]}]"#,
            ))
            .expect("respond");
        });

        let plans = client(&base)
            .list_reboot_plans(Some(RebootPlanState::Pending), true)
            .expect("list");
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].state, RebootPlanState::Pending);
        assert_eq!(plans[0].concurrency, 2);
        handle.join().expect("join");
    }

    #[test]
    fn update_reboot_puts_exactly_one_timestamp() {
        let (base, handle) = with_server(|mut req| {
            assert_eq!(req.method(), &tiny_http::Method::Put);
            assert_eq!(
                req.url(),
                "/reboot-plans/cccccccc-cccc-4ccc-8ccc-cccccccccccc/reboots/dddddddd-dddd-4ddd-8ddd-dddddddddddd"
            );
            let mut body = String::new();
            req.as_reader().read_to_string(&mut body).expect("body");
            let parsed: serde_json::Value = serde_json::from_str(&body).expect("json");
            assert!(parsed.get("operational_at").is_some());
            assert!(parsed.get("canceled_at").is_none());
            req.respond(tiny_http::Response::empty(tiny_http::StatusCode(204)))
                .expect("respond");
        });

        client(&base)
            .update_reboot(
                "cccccccc-cccc-4ccc-8ccc-cccccccccccc".parse().expect("uuid"),
                "dddddddd-dddd-4ddd-8ddd-dddddddddddd".parse().expect("uuid"),
                &RebootUpdate {
                    operational_at: Some(Utc::now()),
                    canceled_at: None,
                },
            )
            .expect("update");
        handle.join().expect("join");
    }

    #[test]
    fn instance_health_posts_filter() {
        let (base, handle) = with_server(|mut req| {
            assert_eq!(req.method(), &tiny_http::Method::Post);
            assert_eq!(req.url(), "/instances/health");
            let mut body = String::new();
            req.as_reader().read_to_string(&mut body).expect("body");
            let parsed: serde_json::Value = serde_json::from_str(&body).expect("json");
            assert_eq!(parsed["type"], "vm");
            req.respond(json_response(
                r#"[{"service":"vmapi","instance":"x","hostname":"headnode","healthy":true,"health_errors":[]}]"#,
            ))
            .expect("respond");
        });

        let health = client(&base)
            .instance_health(&HealthFilter {
                servers: None,
                uuids: None,
                kind: Some(dcadm_types::InstanceKind::Vm),
            })
            .expect("health");
        assert!(health[0].healthy);
        handle.join().expect("join");
    }
}
