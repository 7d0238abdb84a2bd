//! VM-manager client.

use std::collections::BTreeMap;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dcadm_types::{DcadmError, Upstream};

use super::Endpoint;

/// A virtual machine as reported by the VM manager.
#[derive(Debug, Clone, Deserialize)]
pub struct Vm {
    pub uuid: Uuid,
    #[serde(default)]
    pub alias: Option<String>,
    pub state: String,
    pub owner_uuid: Uuid,
    pub server_uuid: Uuid,
    #[serde(default)]
    pub image_uuid: Option<Uuid>,
    #[serde(default)]
    pub tags: BTreeMap<String, serde_json::Value>,
}

impl Vm {
    /// Core VMs carry a `smartdc_role` tag.
    pub fn smartdc_role(&self) -> Option<&str> {
        self.tags.get("smartdc_role").and_then(|v| v.as_str())
    }
}

/// Reference to an asynchronous VM-manager job.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRef {
    pub job_uuid: Uuid,
    #[serde(default)]
    pub vm_uuid: Option<Uuid>,
}

#[derive(Debug, Serialize)]
struct ReprovisionBody {
    image_uuid: Uuid,
}

#[derive(Debug, Serialize)]
struct MetadataAction<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    set_customer_metadata: Option<&'a BTreeMap<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remove_customer_metadata: Option<&'a [String]>,
}

#[derive(Debug, Clone)]
pub struct VmapiClient {
    ep: Endpoint,
}

impl VmapiClient {
    pub fn new(http: Client, base: &str) -> Self {
        Self {
            ep: Endpoint::new(http, base, Upstream::Vmapi),
        }
    }

    /// List VMs matching the query. Callers filter further client-side;
    /// the manager's query language stays out of the type system.
    pub fn list_vms(&self, query: &[(&str, String)]) -> Result<Vec<Vm>, DcadmError> {
        self.ep.get_json("/vms", query, "list vms")
    }

    /// Active VMs owned by the admin account; the inventory narrows these
    /// to core VMs by tag.
    pub fn list_admin_vms(&self, owner_uuid: Uuid) -> Result<Vec<Vm>, DcadmError> {
        self.list_vms(&[
            ("state", "active".to_string()),
            ("owner_uuid", owner_uuid.to_string()),
        ])
    }

    pub fn get_vm(&self, uuid: Uuid) -> Result<Vm, DcadmError> {
        self.ep.get_json(&format!("/vms/{uuid}"), &[], "get vm")
    }

    /// Reprovision a VM onto a new image. Returns the workflow job driving
    /// the operation.
    pub fn reprovision(&self, vm_uuid: Uuid, image_uuid: Uuid) -> Result<JobRef, DcadmError> {
        self.ep.post_json(
            &format!("/vms/{vm_uuid}?action=reprovision"),
            &ReprovisionBody { image_uuid },
            "reprovision vm",
        )
    }

    /// Set customer metadata keys on a VM.
    pub fn set_metadata(
        &self,
        vm_uuid: Uuid,
        metadata: &BTreeMap<String, serde_json::Value>,
    ) -> Result<JobRef, DcadmError> {
        self.ep.post_json(
            &format!("/vms/{vm_uuid}?action=update"),
            &MetadataAction {
                set_customer_metadata: Some(metadata),
                remove_customer_metadata: None,
            },
            "set vm metadata",
        )
    }

    /// Remove customer metadata keys from a VM.
    pub fn delete_metadata(&self, vm_uuid: Uuid, keys: &[String]) -> Result<JobRef, DcadmError> {
        self.ep.post_json(
            &format!("/vms/{vm_uuid}?action=update"),
            &MetadataAction {
                set_customer_metadata: None,
                remove_customer_metadata: Some(keys),
            },
            "delete vm metadata",
        )
    }

    pub fn delete_vm(&self, uuid: Uuid) -> Result<JobRef, DcadmError> {
        self.ep.delete_json(&format!("/vms/{uuid}"), "delete vm")
    }
}

#[cfg(test)]
mod tests {
    use crate::api::build_http_client;
    use crate::api::testutil::{json_response, with_server};

    use super::*;

    fn client(base: &str) -> VmapiClient {
        VmapiClient::new(build_http_client().expect("client"), base)
    }

    const VM: &str = r#"{
        "uuid": "44444444-4444-4444-8444-444444444444",
        "alias": "vmapi0",
        "state": "running",
        "owner_uuid": "930896af-bf8c-48d4-885c-6573a94b1853",
        "server_uuid": "55555555-5555-4555-8555-555555555555",
        "image_uuid": "66666666-6666-4666-8666-666666666666",
        "tags": {"smartdc_role": "vmapi"}
    }"#;

    #[test]
    fn list_admin_vms_passes_owner_and_state() {
        let (base, handle) = with_server(|req| {
            let url = req.url().to_string();
            assert!(url.starts_with("/vms?"));
            assert!(url.contains("state=active"));
            assert!(url.contains("owner_uuid=930896af-bf8c-48d4-885c-6573a94b1853"));
            req.respond(json_response(&format!("[{VM}]"))).expect("respond");
        });

        let vms = client(&base)
            .list_admin_vms("930896af-bf8c-48d4-885c-6573a94b1853".parse().expect("uuid"))
            .expect("list");
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].smartdc_role(), Some("vmapi"));
        handle.join().expect("join");
    }

    #[test]
    fn reprovision_posts_action_and_image() {
        let (base, handle) = with_server(|mut req| {
            assert_eq!(req.method(), &tiny_http::Method::Post);
            assert_eq!(
                req.url(),
                "/vms/44444444-4444-4444-8444-444444444444?action=reprovision"
            );
            let mut body = String::new();
            req.as_reader().read_to_string(&mut body).expect("body");
            let parsed: serde_json::Value = serde_json::from_str(&body).expect("json");
            assert_eq!(
                parsed["image_uuid"],
                "77777777-7777-4777-8777-777777777777"
            );
            req.respond(json_response(
                r#"{"job_uuid":"88888888-8888-4888-8888-888888888888","vm_uuid":"44444444-4444-4444-8444-444444444444"}"#,
            ))
            .expect("respond");
        });

        let job = client(&base)
            .reprovision(
                "44444444-4444-4444-8444-444444444444".parse().expect("uuid"),
                "77777777-7777-4777-8777-777777777777".parse().expect("uuid"),
            )
            .expect("reprovision");
        assert_eq!(
            job.job_uuid.to_string(),
            "88888888-8888-4888-8888-888888888888"
        );
        handle.join().expect("join");
    }

    #[test]
    fn delete_vm_returns_job() {
        let (base, handle) = with_server(|req| {
            assert_eq!(req.method(), &tiny_http::Method::Delete);
            req.respond(json_response(
                r#"{"job_uuid":"99999999-9999-4999-8999-999999999999"}"#,
            ))
            .expect("respond");
        });

        let job = client(&base)
            .delete_vm("44444444-4444-4444-8444-444444444444".parse().expect("uuid"))
            .expect("delete");
        assert!(job.vm_uuid.is_none());
        handle.join().expect("join");
    }
}
