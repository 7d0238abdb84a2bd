//! Per-instance health probing.
//!
//! The definition of *healthy* belongs to the compute-node manager; this
//! module reports what it says and provides the readiness gate the reboot
//! engine polls on.

use anyhow::Result;
use uuid::Uuid;

use dcadm_retry::{PollOutcome, Poller};
use dcadm_types::{HealthFilter, InstanceHealth};

use crate::api::SdcClients;

/// One-shot health check; results ordered by `(service, instance)`.
pub fn check(clients: &SdcClients, filter: &HealthFilter) -> Result<Vec<InstanceHealth>> {
    let mut results = clients.cnapi.instance_health(filter)?;
    results.sort_by(|a, b| {
        (a.service.as_str(), a.instance.as_str()).cmp(&(b.service.as_str(), b.instance.as_str()))
    });
    Ok(results)
}

/// Poll one node until every instance on it reports healthy.
pub fn await_healthy(clients: &SdcClients, server: Uuid, poller: &Poller) -> Result<Vec<InstanceHealth>> {
    let filter = HealthFilter {
        servers: Some(vec![server]),
        uuids: None,
        kind: None,
    };
    let healthy = poller.run(&format!("healthy services on {server}"), || {
        let results = clients.cnapi.instance_health(&filter)?;
        if !results.is_empty() && results.iter().all(|r| r.healthy) {
            Ok(PollOutcome::Ready(results))
        } else {
            Ok(PollOutcome::Pending)
        }
    })?;
    Ok(healthy)
}
