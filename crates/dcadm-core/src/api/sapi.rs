//! Services-registry client.

use std::collections::BTreeMap;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dcadm_types::{DcadmError, Service, Upstream};

use super::Endpoint;

/// An application grouping services in the registry.
#[derive(Debug, Clone, Deserialize)]
pub struct Application {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// A registry-side instance record. Thin: the inventory joins it against
/// the VM manager and compute-node manager for the full picture.
#[derive(Debug, Clone, Deserialize)]
pub struct SapiInstance {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct MetadataUpdate<'a> {
    action: &'a str,
    metadata: &'a BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ParamsUpdate<'a> {
    action: &'a str,
    params: &'a serde_json::Value,
}

#[derive(Debug, Serialize)]
struct CreateInstanceBody<'a> {
    service_uuid: Uuid,
    params: &'a serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct SapiClient {
    ep: Endpoint,
}

impl SapiClient {
    pub fn new(http: Client, base: &str) -> Self {
        Self {
            ep: Endpoint::new(http, base, Upstream::Sapi),
        }
    }

    pub fn list_applications(&self, name: &str) -> Result<Vec<Application>, DcadmError> {
        self.ep.get_json(
            "/applications",
            &[("name", name.to_string())],
            "list applications",
        )
    }

    /// Merge (`update`) or remove (`delete`) application metadata keys.
    pub fn update_application_metadata(
        &self,
        uuid: Uuid,
        action: &str,
        metadata: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), DcadmError> {
        self.ep.put_ok(
            &format!("/applications/{uuid}"),
            &MetadataUpdate { action, metadata },
            "update application metadata",
        )
    }

    pub fn list_services(
        &self,
        application_uuid: Option<Uuid>,
        name: Option<&str>,
    ) -> Result<Vec<Service>, DcadmError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(app) = application_uuid {
            query.push(("application_uuid", app.to_string()));
        }
        if let Some(name) = name {
            query.push(("name", name.to_string()));
        }
        self.ep.get_json("/services", &query, "list services")
    }

    /// Update service parameters, returning the updated service.
    pub fn update_service_params(
        &self,
        uuid: Uuid,
        params: &serde_json::Value,
    ) -> Result<Service, DcadmError> {
        self.ep.put_json(
            &format!("/services/{uuid}"),
            &ParamsUpdate {
                action: "update",
                params,
            },
            "update service params",
        )
    }

    /// Merge (`update`) or remove (`delete`) service metadata keys.
    pub fn update_service_metadata(
        &self,
        uuid: Uuid,
        action: &str,
        metadata: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), DcadmError> {
        self.ep.put_ok(
            &format!("/services/{uuid}"),
            &MetadataUpdate { action, metadata },
            "update service metadata",
        )
    }

    pub fn delete_service(&self, uuid: Uuid) -> Result<(), DcadmError> {
        self.ep
            .delete_ok(&format!("/services/{uuid}"), "delete service")
    }

    pub fn list_instances(&self, service_uuid: Uuid) -> Result<Vec<SapiInstance>, DcadmError> {
        self.ep.get_json(
            "/instances",
            &[("service_uuid", service_uuid.to_string())],
            "list instances",
        )
    }

    pub fn create_instance(
        &self,
        service_uuid: Uuid,
        params: &serde_json::Value,
    ) -> Result<SapiInstance, DcadmError> {
        self.ep.post_json(
            "/instances",
            &CreateInstanceBody {
                service_uuid,
                params,
            },
            "create instance",
        )
    }

    pub fn delete_instance(&self, uuid: Uuid) -> Result<(), DcadmError> {
        self.ep
            .delete_ok(&format!("/instances/{uuid}"), "delete instance")
    }
}
