//! Datacenter maintenance mode.
//!
//! Maintenance flips the cloud API into read-only through its registry
//! metadata and records the start time in `<state>/dc-maint.json`. Stop is
//! the exact mirror: clear the flag, delete the file.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use dcadm_config::Config;
use dcadm_types::DcadmError;

use crate::Reporter;
use crate::api::SdcClients;

pub const MAINT_FILE: &str = "dc-maint.json";
pub const CLOUD_API_SERVICE: &str = "cloudapi";
pub const READONLY_KEY: &str = "CLOUDAPI_READONLY";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MaintRecord {
    #[serde(rename = "startTime")]
    start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintStatus {
    pub maintenance: bool,
    pub start_time: Option<DateTime<Utc>>,
}

fn maint_path(config: &Config) -> PathBuf {
    config.state_dir.join(MAINT_FILE)
}

fn cloud_api_uuid(clients: &SdcClients) -> Result<uuid::Uuid> {
    let services = clients.sapi.list_services(None, Some(CLOUD_API_SERVICE))?;
    services
        .into_iter()
        .next()
        .map(|s| s.uuid)
        .ok_or_else(|| DcadmError::update(format!("no {CLOUD_API_SERVICE:?} service registered")).into())
}

pub fn start(clients: &SdcClients, config: &Config, reporter: &mut dyn Reporter) -> Result<()> {
    let path = maint_path(config);
    if path.exists() {
        let status = status(config)?;
        reporter.info(&format!(
            "already in maintenance since {}",
            status
                .start_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string())
        ));
        return Ok(());
    }

    let uuid = cloud_api_uuid(clients)?;
    let mut metadata: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    metadata.insert(READONLY_KEY.to_string(), json!(true));
    clients
        .sapi
        .update_service_metadata(uuid, "update", &metadata)?;

    let record = MaintRecord {
        start_time: Utc::now(),
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(
        &path,
        serde_json::to_string_pretty(&record).context("failed to serialize maintenance record")?,
    )
    .with_context(|| format!("failed to write {}", path.display()))?;

    reporter.info("datacenter placed in maintenance (cloud API is read-only)");
    Ok(())
}

pub fn stop(clients: &SdcClients, config: &Config, reporter: &mut dyn Reporter) -> Result<()> {
    let uuid = cloud_api_uuid(clients)?;
    let mut metadata: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    metadata.insert(READONLY_KEY.to_string(), json!(false));
    clients
        .sapi
        .update_service_metadata(uuid, "update", &metadata)?;

    let path = maint_path(config);
    if path.exists() {
        fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
    }

    reporter.info("datacenter maintenance ended (cloud API is read-write)");
    Ok(())
}

pub fn status(config: &Config) -> Result<MaintStatus> {
    let path = maint_path(config);
    if !path.exists() {
        return Ok(MaintStatus {
            maintenance: false,
            start_time: None,
        });
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let record: MaintRecord = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(MaintStatus {
        maintenance: true,
        start_time: Some(record.start_time),
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::QuietReporter;
    use crate::api::testutil::{json_response, with_multi_server};

    use super::*;

    fn config_with(state_dir: &std::path::Path, sapi_url: String) -> Config {
        let mut config = Config::defaults();
        config.state_dir = state_dir.to_path_buf();
        config.sapi_url = sapi_url;
        config.cnapi_url = "http://127.0.0.1:1".to_string();
        config.vmapi_url = "http://127.0.0.1:1".to_string();
        config.imgapi_url = "http://127.0.0.1:1".to_string();
        config.wfapi_url = "http://127.0.0.1:1".to_string();
        config
    }

    fn sapi_mock() -> String {
        let (base, _handle) = with_multi_server(
            |req| {
                if req.url().starts_with("/services?") {
                    req.respond(json_response(
                        r#"[{"uuid":"22222222-2222-4222-8222-222222222222","name":"cloudapi","type":"vm"}]"#,
                    ))
                    .expect("respond");
                } else {
                    req.respond(tiny_http::Response::empty(tiny_http::StatusCode(204)))
                        .expect("respond");
                }
            },
            4,
        );
        base
    }

    #[test]
    fn start_then_status_then_stop_round_trips() {
        let td = tempdir().expect("tempdir");
        let config = config_with(td.path(), sapi_mock());
        let clients = SdcClients::new(&config).expect("clients");

        assert!(!status(&config).expect("status").maintenance);

        start(&clients, &config, &mut QuietReporter).expect("start");
        let active = status(&config).expect("status");
        assert!(active.maintenance);
        assert!(active.start_time.is_some());
        assert!(td.path().join(MAINT_FILE).exists());

        stop(&clients, &config, &mut QuietReporter).expect("stop");
        assert!(!status(&config).expect("status").maintenance);
        assert!(!td.path().join(MAINT_FILE).exists());
    }

    #[test]
    fn start_twice_is_idempotent() {
        let td = tempdir().expect("tempdir");
        let config = config_with(td.path(), sapi_mock());
        let clients = SdcClients::new(&config).expect("clients");

        start(&clients, &config, &mut QuietReporter).expect("first start");
        let first = status(&config).expect("status").start_time;
        start(&clients, &config, &mut QuietReporter).expect("second start");
        let second = status(&config).expect("status").start_time;
        assert_eq!(first, second, "start time survives a repeated start");
    }
}
