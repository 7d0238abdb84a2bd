//! Layered configuration for dcadm.
//!
//! Three layers merge in order: shipped defaults, then the JSON config file
//! at `/var/dcadm/dcadm.conf` when present, then values derived from the
//! host's system configuration (DNS domain, datacenter name, admin owner).
//! Remote API URLs derive as `http://<service>.<dc>.<dns-domain>` unless the
//! config file pinned them explicitly.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_CONFIG_PATH: &str = "/var/dcadm/dcadm.conf";
pub const DEFAULT_STATE_DIR: &str = "/var/dcadm";
pub const DEFAULT_LOCK_PATH: &str = "/var/run/dcadm.lock";
pub const DEFAULT_UPDATES_URL: &str = "https://updates.dcadm.io";

/// Message-broker coordinates, parsed from `login:password:host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmqpConfig {
    pub login: String,
    pub password: String,
    pub host: String,
    pub port: u16,
}

impl AmqpConfig {
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != 4 {
            bail!("amqp config must be login:password:host:port, got {raw:?}");
        }
        let port: u16 = parts[3]
            .parse()
            .with_context(|| format!("invalid amqp port: {:?}", parts[3]))?;
        Ok(Self {
            login: parts[0].to_string(),
            password: parts[1].to_string(),
            host: parts[2].to_string(),
            port,
        })
    }
}

/// Fully merged runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub datacenter_name: String,
    pub dns_domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_owner_uuid: Option<Uuid>,
    pub state_dir: PathBuf,
    pub lock_path: PathBuf,
    pub sapi_url: String,
    pub cnapi_url: String,
    pub vmapi_url: String,
    pub imgapi_url: String,
    pub wfapi_url: String,
    pub updates_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amqp: Option<AmqpConfig>,
    /// Minimum host platform a VM update may target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_vm_platform: Option<String>,
    /// Services an update may not touch without an explicit override.
    pub update_denylist: Vec<String>,
}

impl Config {
    /// Shipped defaults. URLs are empty until the system layer fills them
    /// in or the config file pins them.
    pub fn defaults() -> Self {
        Self {
            datacenter_name: String::new(),
            dns_domain: String::new(),
            admin_owner_uuid: None,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
            sapi_url: String::new(),
            cnapi_url: String::new(),
            vmapi_url: String::new(),
            imgapi_url: String::new(),
            wfapi_url: String::new(),
            updates_url: DEFAULT_UPDATES_URL.to_string(),
            amqp: None,
            min_vm_platform: None,
            update_denylist: vec!["rabbitmq".to_string()],
        }
    }

    /// Load and merge all three layers. `file` and `system` default to the
    /// well-known paths when `None`; a missing file at either path is not
    /// an error.
    pub fn load(file: Option<&Path>, system: Option<&Path>) -> Result<Self> {
        let mut config = Self::defaults();

        let file_path = file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        if file_path.exists() {
            let overlay = FileOverlay::read(&file_path)?;
            overlay.apply(&mut config)?;
        }

        if let Some(system_path) = system {
            if system_path.exists() {
                let values = SystemValues::read(system_path)?;
                values.apply(&mut config);
            }
        }

        config.derive_urls();
        Ok(config)
    }

    /// Fill in any URL the earlier layers left empty using the
    /// `http://<service>.<dc>.<dns-domain>` pattern.
    fn derive_urls(&mut self) {
        if self.datacenter_name.is_empty() || self.dns_domain.is_empty() {
            return;
        }
        let derive = |service: &str, dc: &str, dns: &str| format!("http://{service}.{dc}.{dns}");
        for (slot, name) in [
            (&mut self.sapi_url, "sapi"),
            (&mut self.cnapi_url, "cnapi"),
            (&mut self.vmapi_url, "vmapi"),
            (&mut self.imgapi_url, "imgapi"),
            (&mut self.wfapi_url, "workflow"),
        ] {
            if slot.is_empty() {
                *slot = derive(name, &self.datacenter_name, &self.dns_domain);
            }
        }
    }

    /// Fail unless every API URL is known. Called by commands that talk to
    /// the fleet; read-only commands like `check-config` skip it.
    pub fn require_urls(&self) -> Result<()> {
        for (url, name) in [
            (&self.sapi_url, "sapi"),
            (&self.cnapi_url, "cnapi"),
            (&self.vmapi_url, "vmapi"),
            (&self.imgapi_url, "imgapi"),
            (&self.wfapi_url, "wfapi"),
        ] {
            if url.is_empty() {
                bail!(
                    "no {name} URL configured (set it in the config file or provide the system config)"
                );
            }
        }
        Ok(())
    }
}

/// The config-file layer. Every field optional; unknown keys are rejected.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileOverlay {
    datacenter_name: Option<String>,
    dns_domain: Option<String>,
    admin_owner_uuid: Option<Uuid>,
    state_dir: Option<PathBuf>,
    lock_path: Option<PathBuf>,
    sapi_url: Option<String>,
    cnapi_url: Option<String>,
    vmapi_url: Option<String>,
    imgapi_url: Option<String>,
    wfapi_url: Option<String>,
    updates_url: Option<String>,
    amqp: Option<String>,
    min_vm_platform: Option<String>,
    update_denylist: Option<Vec<String>>,
}

impl FileOverlay {
    fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let overlay: FileOverlay = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config JSON from {}", path.display()))?;
        Ok(overlay)
    }

    fn apply(self, config: &mut Config) -> Result<()> {
        macro_rules! take {
            ($field:ident) => {
                if let Some(value) = self.$field {
                    config.$field = value;
                }
            };
        }
        take!(datacenter_name);
        take!(dns_domain);
        take!(state_dir);
        take!(lock_path);
        take!(sapi_url);
        take!(cnapi_url);
        take!(vmapi_url);
        take!(imgapi_url);
        take!(wfapi_url);
        take!(updates_url);
        take!(update_denylist);
        if let Some(value) = self.min_vm_platform {
            config.min_vm_platform = Some(value);
        }
        if let Some(uuid) = self.admin_owner_uuid {
            config.admin_owner_uuid = Some(uuid);
        }
        if let Some(raw) = self.amqp {
            config.amqp = Some(AmqpConfig::parse(&raw)?);
        }
        Ok(())
    }
}

/// Values derived from the host's system configuration: flat
/// `key=value` lines, `#` comments allowed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SystemValues {
    pub dns_domain: Option<String>,
    pub datacenter_name: Option<String>,
    pub admin_owner_uuid: Option<String>,
    pub amqp: Option<String>,
}

impl SystemValues {
    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read system config {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut map: BTreeMap<&str, &str> = BTreeMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                map.insert(key.trim(), value.trim());
            }
        }
        Self {
            dns_domain: map.get("dns_domain").map(|s| s.to_string()),
            datacenter_name: map.get("datacenter_name").map(|s| s.to_string()),
            admin_owner_uuid: map.get("ufds_admin_uuid").map(|s| s.to_string()),
            amqp: map.get("rabbitmq").map(|s| s.to_string()),
        }
    }

    fn apply(self, config: &mut Config) {
        if let Some(dns) = self.dns_domain {
            config.dns_domain = dns;
        }
        if let Some(dc) = self.datacenter_name {
            config.datacenter_name = dc;
        }
        if let Some(raw) = self.admin_owner_uuid {
            if let Ok(uuid) = raw.parse() {
                config.admin_owner_uuid = Some(uuid);
            }
        }
        if config.amqp.is_none() {
            if let Some(raw) = self.amqp {
                if let Ok(parsed) = AmqpConfig::parse(&raw) {
                    config.amqp = Some(parsed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use proptest::prelude::*;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn amqp_parse_splits_four_fields() {
        let amqp = AmqpConfig::parse("guest:secret:rabbit.local:5672").expect("parse");
        assert_eq!(amqp.login, "guest");
        assert_eq!(amqp.password, "secret");
        assert_eq!(amqp.host, "rabbit.local");
        assert_eq!(amqp.port, 5672);
    }

    #[test]
    fn amqp_parse_rejects_wrong_shape() {
        let err = AmqpConfig::parse("guest:secret:rabbit.local").expect_err("three fields");
        assert!(err.to_string().contains("login:password:host:port"));

        let err = AmqpConfig::parse("g:s:h:notaport").expect_err("bad port");
        assert!(format!("{err:#}").contains("invalid amqp port"));
    }

    #[test]
    fn defaults_have_wellknown_paths() {
        let config = Config::defaults();
        assert_eq!(config.state_dir, PathBuf::from("/var/dcadm"));
        assert_eq!(config.lock_path, PathBuf::from("/var/run/dcadm.lock"));
        assert_eq!(config.update_denylist, vec!["rabbitmq".to_string()]);
    }

    #[test]
    fn load_merges_file_over_defaults() {
        let td = tempdir().expect("tempdir");
        let file = td.path().join("dcadm.conf");
        fs::write(
            &file,
            r#"{"datacenter_name":"us-west-1","dns_domain":"dc.example.com","updates_url":"https://updates.internal"}"#,
        )
        .expect("write");

        let config = Config::load(Some(&file), None).expect("load");
        assert_eq!(config.datacenter_name, "us-west-1");
        assert_eq!(config.updates_url, "https://updates.internal");
        // Derived from the file-provided dc + dns.
        assert_eq!(config.sapi_url, "http://sapi.us-west-1.dc.example.com");
        assert_eq!(config.wfapi_url, "http://workflow.us-west-1.dc.example.com");
    }

    #[test]
    fn load_rejects_unknown_keys() {
        let td = tempdir().expect("tempdir");
        let file = td.path().join("dcadm.conf");
        fs::write(&file, r#"{"datacentre_name":"typo"}"#).expect("write");

        let err = Config::load(Some(&file), None).expect_err("unknown key");
        assert!(format!("{err:#}").contains("failed to parse config JSON"));
    }

    #[test]
    fn system_layer_wins_over_file_for_derived_values() {
        let td = tempdir().expect("tempdir");
        let file = td.path().join("dcadm.conf");
        fs::write(&file, r#"{"datacenter_name":"from-file"}"#).expect("write");

        let system = td.path().join("system.conf");
        fs::write(
            &system,
            "# system config\ndatacenter_name=from-system\ndns_domain=dc.example.com\nufds_admin_uuid=930896af-bf8c-48d4-885c-6573a94b1853\n",
        )
        .expect("write");

        let config = Config::load(Some(&file), Some(&system)).expect("load");
        assert_eq!(config.datacenter_name, "from-system");
        assert_eq!(
            config.admin_owner_uuid.expect("admin uuid").to_string(),
            "930896af-bf8c-48d4-885c-6573a94b1853"
        );
        assert_eq!(config.cnapi_url, "http://cnapi.from-system.dc.example.com");
    }

    #[test]
    fn explicit_file_urls_are_not_overwritten_by_derivation() {
        let td = tempdir().expect("tempdir");
        let file = td.path().join("dcadm.conf");
        fs::write(
            &file,
            r#"{"datacenter_name":"dc1","dns_domain":"example.com","sapi_url":"http://10.0.0.1"}"#,
        )
        .expect("write");

        let config = Config::load(Some(&file), None).expect("load");
        assert_eq!(config.sapi_url, "http://10.0.0.1");
        assert_eq!(config.vmapi_url, "http://vmapi.dc1.example.com");
    }

    #[test]
    fn system_values_parse_skips_comments_and_blanks() {
        let values = SystemValues::parse("\n# comment\n\nrabbitmq=guest:guest:rabbit:5672\n");
        assert_eq!(values.amqp.as_deref(), Some("guest:guest:rabbit:5672"));
        assert!(values.dns_domain.is_none());
    }

    #[test]
    fn require_urls_names_the_missing_service() {
        let config = Config::defaults();
        let err = config.require_urls().expect_err("no urls");
        assert!(err.to_string().contains("sapi"));
    }

    proptest! {
        #[test]
        fn amqp_parse_round_trips_colon_free_fields(
            login in "[a-z]{1,8}",
            password in "[a-z0-9]{1,8}",
            host in "[a-z][a-z.]{0,11}",
            port in 1u16..,
        ) {
            let parsed = AmqpConfig::parse(&format!("{login}:{password}:{host}:{port}"))
                .expect("parse");
            prop_assert_eq!(parsed.login, login);
            prop_assert_eq!(parsed.password, password);
            prop_assert_eq!(parsed.host, host);
            prop_assert_eq!(parsed.port, port);
        }
    }

    #[test]
    fn missing_config_file_is_not_an_error() {
        let td = tempdir().expect("tempdir");
        let config =
            Config::load(Some(&td.path().join("absent.conf")), None).expect("load defaults");
        assert_eq!(config, {
            let mut c = Config::defaults();
            c.derive_urls();
            c
        });
    }
}
