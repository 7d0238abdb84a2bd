//! Data-store shard coordination.
//!
//! The primary data-store shard runs a replication state machine with one
//! primary, one sync, and any number of async peers. Rebooting the node
//! that hosts the primary must not trigger an automatic failover, so the
//! engine freezes the shard first and thaws it once the node is healthy
//! again. Role determination and freeze/thaw run through the data-store
//! admin tool, executed on a node that hosts a replica.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use uuid::Uuid;

use dcadm_retry::{PollOutcome, Poller};

use crate::api::SdcClients;

/// Service name of the replicated data store.
pub const DATA_STORE_SERVICE: &str = "manatee";

const ADM_STATUS: &str = "manatee-adm status";
const ADM_FREEZE: &str = "manatee-adm freeze -r 'dcadm reboot'";
const ADM_UNFREEZE: &str = "manatee-adm unfreeze";

/// Role of one node within the shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardRole {
    Primary,
    Sync,
    Async,
    None,
}

/// One peer as reported by the admin tool.
#[derive(Debug, Clone, Deserialize)]
pub struct ShardPeer {
    pub server_uuid: Uuid,
    #[serde(default)]
    pub ok: bool,
}

/// Status output of the admin tool.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShardStatus {
    #[serde(default)]
    pub primary: Option<ShardPeer>,
    #[serde(default)]
    pub sync: Option<ShardPeer>,
    #[serde(default, rename = "async")]
    pub asyncs: Vec<ShardPeer>,
    #[serde(default)]
    pub frozen: bool,
}

impl ShardStatus {
    pub fn parse(stdout: &str) -> Result<Self> {
        serde_json::from_str(stdout).context("failed to parse data-store status JSON")
    }

    /// The role this server currently holds in the shard.
    pub fn role_of(&self, server: Uuid) -> ShardRole {
        if self.primary.as_ref().is_some_and(|p| p.server_uuid == server) {
            return ShardRole::Primary;
        }
        if self.sync.as_ref().is_some_and(|p| p.server_uuid == server) {
            return ShardRole::Sync;
        }
        if self.asyncs.iter().any(|p| p.server_uuid == server) {
            return ShardRole::Async;
        }
        ShardRole::None
    }
}

/// What `prepare` did, and what the teardown half must undo.
#[derive(Debug, Clone)]
pub struct ShardPrep {
    pub role: ShardRole,
    pub frozen: bool,
    /// Node the admin tool runs on; chosen to survive the reboot when
    /// another replica host exists.
    pub exec_server: Option<Uuid>,
}

impl ShardPrep {
    pub fn untouched() -> Self {
        Self {
            role: ShardRole::None,
            frozen: false,
            exec_server: None,
        }
    }
}

fn run_adm(clients: &SdcClients, server: Uuid, command: &str) -> Result<String> {
    let output = clients.cnapi.execute_command(server, command)?;
    if output.exit_status != 0 {
        bail!(
            "{command:?} on {server} exited {}: {}",
            output.exit_status,
            output.stderr.trim()
        );
    }
    Ok(output.stdout)
}

pub fn read_status(clients: &SdcClients, exec_server: Uuid) -> Result<ShardStatus> {
    let stdout = run_adm(clients, exec_server, ADM_STATUS)?;
    ShardStatus::parse(&stdout)
}

/// Identify the rebooting node's shard role; freeze the shard iff the node
/// hosts the primary.
///
/// `shard_hosts` are the nodes hosting data-store replicas, from the
/// inventory. A node hosting no replica needs no preparation.
pub fn prepare(
    clients: &SdcClients,
    shard_hosts: &[Uuid],
    server: Uuid,
) -> Result<ShardPrep> {
    if !shard_hosts.contains(&server) {
        return Ok(ShardPrep::untouched());
    }

    // Run the admin tool on a peer that stays up during the reboot when
    // one exists.
    let exec_server = shard_hosts
        .iter()
        .copied()
        .find(|h| *h != server)
        .unwrap_or(server);

    let status = read_status(clients, exec_server)?;
    let role = status.role_of(server);

    let frozen = if role == ShardRole::Primary && !status.frozen {
        run_adm(clients, exec_server, ADM_FREEZE)?;
        true
    } else {
        false
    };

    Ok(ShardPrep {
        role,
        frozen,
        exec_server: Some(exec_server),
    })
}

/// Wait for the shard to settle back into steady state with the rebooted
/// node holding its original role.
pub fn await_sync(
    clients: &SdcClients,
    prep: &ShardPrep,
    server: Uuid,
    poller: &Poller,
) -> Result<()> {
    if prep.role == ShardRole::None {
        return Ok(());
    }
    let exec_server = prep
        .exec_server
        .context("shard prep has a role but no exec server")?;

    poller.run(&format!("data-store sync on {server}"), || {
        let status = read_status(clients, exec_server)?;
        let settled = status.role_of(server) == prep.role
            && status.primary.as_ref().is_some_and(|p| p.ok)
            && status.sync.as_ref().is_none_or(|p| p.ok);
        if settled {
            Ok(PollOutcome::Ready(()))
        } else {
            Ok(PollOutcome::Pending)
        }
    })?;
    Ok(())
}

/// Undo a freeze. Only ever called for a prep that froze.
pub fn thaw(clients: &SdcClients, prep: &ShardPrep) -> Result<()> {
    if !prep.frozen {
        return Ok(());
    }
    let exec_server = prep
        .exec_server
        .context("frozen shard prep has no exec server")?;
    run_adm(clients, exec_server, ADM_UNFREEZE)?;
    Ok(())
}
