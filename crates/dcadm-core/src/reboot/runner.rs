//! The reboot-plan execution process.
//!
//! Runs as a standalone process under the service manager: it polls the
//! compute-node manager for a pending or running reboot plan and drives it
//! to completion. One reboot failure cancels the whole plan. The plan in
//! the compute-node manager is the shared state; the in-memory copy is a
//! cache, re-read before every state-changing step.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use dcadm_config::Config;
use dcadm_retry::{PollOutcome, Poller};
use dcadm_types::{DcadmError, Reboot, RebootPlan, RebootPlanState};

use crate::Reporter;
use crate::api::SdcClients;
use crate::api::cnapi::{RebootPlanAction, RebootUpdate};
use crate::health;

use super::shard::{self, DATA_STORE_SERVICE, ShardPrep};
use super::partition;

/// How a run of the execution process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No pending or running plan; exit 0.
    NothingToDo,
    /// Every reboot reached operational; the plan was marked finished.
    Finished,
    /// A single-step plan completed one batch and was stopped.
    Stopped,
    /// The plan left the running state under our feet (external stop or
    /// cancel).
    Interrupted,
}

/// Initialization window: the remote services may still be starting on a
/// freshly booted control host.
fn init_poller() -> Poller {
    Poller::new(Duration::from_secs(5), 180).with_error_budget(180)
}

/// Find and drive a pending or running reboot plan.
pub fn run_pending(
    clients: &SdcClients,
    config: &Config,
    reporter: &mut dyn Reporter,
) -> Result<Outcome> {
    let found = init_poller().run("reboot plan discovery", || {
        Ok(PollOutcome::Ready(find_plan(clients)?))
    })?;

    let Some(plan) = found else {
        reporter.info("no pending reboot plan; nothing to do");
        return Ok(Outcome::NothingToDo);
    };

    if plan.state == RebootPlanState::Pending {
        clients
            .cnapi
            .update_reboot_plan(plan.uuid, RebootPlanAction::Run)?;
    }

    reporter.info(&format!(
        "executing reboot plan {} ({} reboots, concurrency {})",
        plan.uuid,
        plan.reboots.len(),
        plan.concurrency
    ));
    drive(clients, config, reporter, plan.uuid)
}

fn find_plan(clients: &SdcClients) -> Result<Option<RebootPlan>, DcadmError> {
    let running = clients
        .cnapi
        .list_reboot_plans(Some(RebootPlanState::Running), true)?;
    if let Some(plan) = running.into_iter().next() {
        return Ok(Some(plan));
    }
    let pending = clients
        .cnapi
        .list_reboot_plans(Some(RebootPlanState::Pending), true)?;
    Ok(pending.into_iter().next())
}

/// Drive one plan: batch the remaining reboots and execute batch by batch
/// until none remain.
pub fn drive(
    clients: &SdcClients,
    config: &Config,
    reporter: &mut dyn Reporter,
    plan_uuid: Uuid,
) -> Result<Outcome> {
    let poller = Poller::hourly();

    loop {
        let plan = clients.cnapi.get_reboot_plan(plan_uuid)?;
        if plan.state != RebootPlanState::Running {
            reporter.warn(&format!(
                "reboot plan {} is {}; leaving it alone",
                plan.uuid, plan.state
            ));
            return Ok(Outcome::Interrupted);
        }

        let remaining: Vec<Reboot> = plan
            .reboots
            .iter()
            .filter(|r| !r.is_done())
            .cloned()
            .collect();
        if remaining.is_empty() {
            clients
                .cnapi
                .update_reboot_plan(plan_uuid, RebootPlanAction::Finish)?;
            reporter.info(&format!("reboot plan {plan_uuid} finished"));
            return Ok(Outcome::Finished);
        }

        let (core, shard_hosts) = fleet_topology(clients, config)?;
        let batches = partition(remaining, &core, plan.concurrency);

        for batch in batches {
            let fresh = clients.cnapi.get_reboot_plan(plan_uuid)?;
            if fresh.state != RebootPlanState::Running {
                reporter.warn(&format!(
                    "reboot plan {} is {}; not starting the next batch",
                    plan_uuid, fresh.state
                ));
                return Ok(Outcome::Interrupted);
            }

            reporter.info(&format!(
                "rebooting {} node(s): {}",
                batch.len(),
                batch
                    .iter()
                    .map(|r| r.server_hostname.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));

            if let Err(err) = execute_batch(clients, plan_uuid, &batch, &shard_hosts, &poller) {
                let _ = clients
                    .cnapi
                    .update_reboot_plan(plan_uuid, RebootPlanAction::Cancel);
                return Err(err.context(format!("reboot plan {plan_uuid} canceled")));
            }

            if plan.single_step {
                clients
                    .cnapi
                    .update_reboot_plan(plan_uuid, RebootPlanAction::Stop)?;
                reporter.info("single-step plan: stopping after one batch");
                return Ok(Outcome::Stopped);
            }
        }
    }
}

/// Servers hosting core VMs, and the subset hosting data-store replicas.
fn fleet_topology(
    clients: &SdcClients,
    config: &Config,
) -> Result<(BTreeSet<Uuid>, Vec<Uuid>)> {
    let owner = config
        .admin_owner_uuid
        .ok_or_else(|| DcadmError::usage("no admin owner uuid configured"))?;
    let vms = clients.vmapi.list_admin_vms(owner)?;

    let mut core: BTreeSet<Uuid> = BTreeSet::new();
    let mut shard_hosts: Vec<Uuid> = Vec::new();
    for vm in &vms {
        let Some(role) = vm.smartdc_role() else {
            continue;
        };
        core.insert(vm.server_uuid);
        if role == DATA_STORE_SERVICE && !shard_hosts.contains(&vm.server_uuid) {
            shard_hosts.push(vm.server_uuid);
        }
    }
    Ok((core, shard_hosts))
}

/// Execute one batch in parallel; reboots within a batch have no mutual
/// ordering. The first error wins.
fn execute_batch(
    clients: &SdcClients,
    plan_uuid: Uuid,
    batch: &[Reboot],
    shard_hosts: &[Uuid],
    poller: &Poller,
) -> Result<()> {
    let results: Vec<Result<()>> = std::thread::scope(|scope| {
        let handles: Vec<_> = batch
            .iter()
            .map(|reboot| {
                scope.spawn(move || run_one_reboot(clients, plan_uuid, reboot, shard_hosts, poller))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(DcadmError::internal("reboot thread panicked").into()))
            })
            .collect()
    });

    for result in results {
        result?;
    }
    Ok(())
}

/// The per-reboot state machine. Idempotent on `job_uuid`: a restart of
/// the execution process reuses the job already submitted for a reboot.
fn run_one_reboot(
    clients: &SdcClients,
    plan_uuid: Uuid,
    reboot: &Reboot,
    shard_hosts: &[Uuid],
    poller: &Poller,
) -> Result<()> {
    let server = reboot.server_uuid;

    // Re-read the plan: both to refuse work on a stopped plan and to pick
    // up job state written by a previous run of this process.
    let plan = clients.cnapi.get_reboot_plan(plan_uuid)?;
    if plan.state != RebootPlanState::Running {
        bail!("reboot plan {plan_uuid} is no longer running");
    }
    let current = plan
        .reboots
        .iter()
        .find(|r| r.server_uuid == server)
        .cloned()
        .unwrap_or_else(|| reboot.clone());
    if current.is_done() {
        return Ok(());
    }

    // A headnode must be fully healthy before we touch it.
    if current.headnode {
        let results = health::check(
            clients,
            &dcadm_types::HealthFilter {
                servers: Some(vec![server]),
                uuids: None,
                kind: None,
            },
        )?;
        let sick: Vec<&str> = results
            .iter()
            .filter(|r| !r.healthy)
            .map(|r| r.instance.as_str())
            .collect();
        if !sick.is_empty() {
            bail!(
                "headnode {} has unhealthy services before reboot: {}",
                current.server_hostname,
                sick.join(", ")
            );
        }
    }

    let prep = shard::prepare(clients, shard_hosts, server)?;
    if prep.frozen {
        info!(server = %server, "data-store shard frozen for primary reboot");
    }

    let mut discovered: Option<Uuid> = current.reboot_uuid;
    let mut thawed = false;
    let steps = reboot_steps(
        clients,
        plan_uuid,
        &current,
        &prep,
        poller,
        &mut discovered,
        &mut thawed,
    );

    if let Err(err) = steps {
        if prep.frozen && !thawed {
            if let Err(thaw_err) = shard::thaw(clients, &prep) {
                warn!(server = %server, error = %thaw_err, "failed to thaw data-store shard");
            }
        }
        if let Some(reboot_uuid) = discovered {
            let _ = clients.cnapi.update_reboot(
                plan_uuid,
                reboot_uuid,
                &RebootUpdate {
                    operational_at: None,
                    canceled_at: Some(Utc::now()),
                },
            );
        }
        return Err(err.context(format!(
            "reboot of {} ({server}) failed",
            reboot.server_hostname
        )));
    }

    let reboot_uuid = discovered.context("reboot id was never discovered")?;
    clients.cnapi.update_reboot(
        plan_uuid,
        reboot_uuid,
        &RebootUpdate {
            operational_at: Some(Utc::now()),
            canceled_at: None,
        },
    )?;
    info!(server = %server, hostname = %reboot.server_hostname, "node operational");
    Ok(())
}

/// Steps 4–9: submit, discover, await job, await health, await shard sync,
/// thaw. The caller handles teardown on error.
#[allow(clippy::too_many_arguments)]
fn reboot_steps(
    clients: &SdcClients,
    plan_uuid: Uuid,
    current: &Reboot,
    prep: &ShardPrep,
    poller: &Poller,
    discovered: &mut Option<Uuid>,
    thawed: &mut bool,
) -> Result<()> {
    let server = current.server_uuid;

    let job_uuid = match current.job_uuid {
        Some(existing) => existing,
        None => {
            let job = clients.cnapi.reboot_server(server, true, Some(plan_uuid))?;
            info!(server = %server, job = %job.job_uuid, "reboot job submitted");
            job.job_uuid
        }
    };

    if discovered.is_none() {
        let reboot_uuid = poller.run(&format!("reboot id of job {job_uuid}"), || {
            let job = clients.wfapi.get_job(job_uuid)?;
            match job.params.get("reboot_uuid").and_then(|v| v.as_str()) {
                Some(raw) => Ok(PollOutcome::Ready(raw.parse::<Uuid>().map_err(|_| {
                    DcadmError::internal(format!("job {job_uuid} has a malformed reboot_uuid"))
                })?)),
                None => Ok(PollOutcome::Pending),
            }
        })?;
        *discovered = Some(reboot_uuid);
    }

    clients
        .wfapi
        .wait_for_job(job_uuid, poller)
        .with_context(|| format!("reboot job of {} did not succeed", current.server_hostname))?;

    health::await_healthy(clients, server, poller).with_context(|| {
        format!(
            "services on {} did not return to healthy",
            current.server_hostname
        )
    })?;

    shard::await_sync(clients, prep, server, poller)?;

    if prep.frozen {
        shard::thaw(clients, prep)?;
        *thawed = true;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::thread;

    use tiny_http::{Header, Response, Server, StatusCode};

    use crate::QuietReporter;

    use super::*;

    const PLAN: &str = "cccccccc-cccc-4ccc-8ccc-cccccccccccc";
    const SERVER: &str = "55555555-5555-4555-8555-555555555555";
    const JOB: &str = "bbbbbbbb-bbbb-4bbb-8bbb-bbbbbbbbbbbb";
    const RID: &str = "dddddddd-dddd-4ddd-8ddd-dddddddddddd";

    fn json(body: &str) -> Response<std::io::Cursor<Vec<u8>>> {
        Response::from_string(body)
            .with_status_code(StatusCode(200))
            .with_header(Header::from_bytes("Content-Type", "application/json").expect("header"))
    }

    fn reboot_json(job: Option<&str>, done: bool) -> String {
        let job_field = job
            .map(|j| format!(r#""job_uuid":"{j}","#))
            .unwrap_or_default();
        let done_field = if done {
            format!(r#""operational_at":"2023-01-01T00:00:00Z","reboot_uuid":"{RID}","#)
        } else {
            String::new()
        };
        format!(
            r#"{{{job_field}{done_field}"server_uuid":"{SERVER}","server_hostname":"cn0","current_platform":"a","boot_platform":"b","headnode":false}}"#
        )
    }

    fn plan_json(state: &str, reboots: &[String]) -> String {
        format!(
            r#"{{"uuid":"{PLAN}","state":"{state}","concurrency":2,"reboots":[{}]}}"#,
            reboots.join(",")
        )
    }

    /// Routed multi-request mock server; records PUT bodies.
    fn routed_server<F>(handler: F) -> (String, std::sync::Arc<Mutex<Vec<String>>>)
    where
        F: Fn(&str, &str, &str) -> Option<String> + Send + 'static,
    {
        let server = Server::http("127.0.0.1:0").expect("server");
        let addr = format!("http://{}", server.server_addr());
        let seen = std::sync::Arc::new(Mutex::new(Vec::<String>::new()));
        let seen_thread = seen.clone();
        thread::spawn(move || {
            while let Ok(Some(mut req)) = server.recv_timeout(Duration::from_secs(5)) {
                let mut body = String::new();
                use std::io::Read as _;
                let _ = req.as_reader().read_to_string(&mut body);
                let method = req.method().to_string().to_uppercase();
                let url = req.url().to_string();
                seen_thread
                    .lock()
                    .expect("lock")
                    .push(format!("{method} {url} {body}"));
                match handler(&method, &url, &body) {
                    Some(response_body) => req.respond(json(&response_body)).expect("respond"),
                    None => req
                        .respond(Response::empty(StatusCode(204)))
                        .expect("respond"),
                }
            }
        });
        (addr, seen)
    }

    fn config_with(cnapi: String, wfapi: String) -> Config {
        let mut config = Config::defaults();
        config.cnapi_url = cnapi;
        config.wfapi_url = wfapi;
        config.sapi_url = "http://127.0.0.1:1".to_string();
        config.vmapi_url = "http://127.0.0.1:1".to_string();
        config.imgapi_url = "http://127.0.0.1:1".to_string();
        config.admin_owner_uuid = Some(Uuid::new_v4());
        config
    }

    #[test]
    fn run_one_reboot_walks_the_state_machine() {
        let (cnapi, cnapi_seen) = routed_server(|method, url, _body| match (method, url) {
            ("GET", u) if u.starts_with("/reboot-plans/") => {
                Some(plan_json("running", &[reboot_json(None, false)]))
            }
            ("POST", u) if u.contains("/reboot") => Some(format!(r#"{{"job_uuid":"{JOB}"}}"#)),
            ("POST", "/instances/health") => Some(
                r#"[{"service":"net-agent","instance":"a","hostname":"cn0","healthy":true,"health_errors":[]}]"#
                    .to_string(),
            ),
            ("PUT", u) if u.contains("/reboots/") => None,
            other => panic!("unexpected cnapi request: {other:?}"),
        });
        let (wfapi, _wfapi_seen) = routed_server(|method, url, _body| match (method, url) {
            ("GET", u) if u.starts_with("/jobs/") => Some(format!(
                r#"{{"uuid":"{JOB}","name":"server-reboot","execution":"succeeded","params":{{"reboot_uuid":"{RID}"}}}}"#
            )),
            other => panic!("unexpected wfapi request: {other:?}"),
        });

        let config = config_with(cnapi, wfapi);
        let clients = SdcClients::new(&config).expect("clients");

        let reboot: Reboot =
            serde_json::from_str(&reboot_json(None, false)).expect("reboot record");
        let poller = Poller::new(Duration::from_millis(1), 10);
        run_one_reboot(
            &clients,
            PLAN.parse().expect("uuid"),
            &reboot,
            &[],
            &poller,
        )
        .expect("reboot succeeds");

        let seen = cnapi_seen.lock().expect("lock");
        let put = seen
            .iter()
            .find(|line| line.starts_with("PUT"))
            .expect("operational PUT");
        assert!(put.contains(&format!("/reboot-plans/{PLAN}/reboots/{RID}")));
        assert!(put.contains("operational_at"));
        assert!(!put.contains("canceled_at"));
    }

    #[test]
    fn failed_job_writes_canceled_at_after_discovery() {
        let (cnapi, cnapi_seen) = routed_server(|method, url, _body| match (method, url) {
            ("GET", u) if u.starts_with("/reboot-plans/") => {
                Some(plan_json("running", &[reboot_json(None, false)]))
            }
            ("POST", u) if u.contains("/reboot") => Some(format!(r#"{{"job_uuid":"{JOB}"}}"#)),
            ("PUT", u) if u.contains("/reboots/") => None,
            other => panic!("unexpected cnapi request: {other:?}"),
        });
        let (wfapi, _) = routed_server(|_method, _url, _body| {
            Some(format!(
                r#"{{"uuid":"{JOB}","name":"server-reboot","execution":"failed","params":{{"reboot_uuid":"{RID}"}}}}"#
            ))
        });

        let config = config_with(cnapi, wfapi);
        let clients = SdcClients::new(&config).expect("clients");
        let reboot: Reboot =
            serde_json::from_str(&reboot_json(None, false)).expect("reboot record");
        let poller = Poller::new(Duration::from_millis(1), 10);

        let err = run_one_reboot(
            &clients,
            PLAN.parse().expect("uuid"),
            &reboot,
            &[],
            &poller,
        )
        .expect_err("job failed");
        assert!(format!("{err:#}").contains("did not succeed"));

        let seen = cnapi_seen.lock().expect("lock");
        let put = seen
            .iter()
            .find(|line| line.starts_with("PUT"))
            .expect("canceled PUT");
        assert!(put.contains("canceled_at"));
        assert!(!put.contains("operational_at"));
    }

    #[test]
    fn reboot_reuses_existing_job_uuid() {
        let (cnapi, cnapi_seen) = routed_server(|method, url, _body| match (method, url) {
            ("GET", u) if u.starts_with("/reboot-plans/") => {
                Some(plan_json("running", &[reboot_json(Some(JOB), false)]))
            }
            ("POST", "/instances/health") => Some(
                r#"[{"service":"net-agent","instance":"a","hostname":"cn0","healthy":true,"health_errors":[]}]"#
                    .to_string(),
            ),
            ("PUT", u) if u.contains("/reboots/") => None,
            other => panic!("unexpected cnapi request (job must not be resubmitted): {other:?}"),
        });
        let (wfapi, _) = routed_server(|_method, _url, _body| {
            Some(format!(
                r#"{{"uuid":"{JOB}","name":"server-reboot","execution":"succeeded","params":{{"reboot_uuid":"{RID}"}}}}"#
            ))
        });

        let config = config_with(cnapi, wfapi);
        let clients = SdcClients::new(&config).expect("clients");
        let reboot: Reboot =
            serde_json::from_str(&reboot_json(Some(JOB), false)).expect("reboot record");
        let poller = Poller::new(Duration::from_millis(1), 10);

        run_one_reboot(
            &clients,
            PLAN.parse().expect("uuid"),
            &reboot,
            &[],
            &poller,
        )
        .expect("idempotent resume");

        let seen = cnapi_seen.lock().expect("lock");
        assert!(
            !seen.iter().any(|line| line.contains("/servers/")),
            "no reboot job resubmission: {seen:?}"
        );
    }

    #[test]
    fn primary_shard_host_freezes_before_reboot_and_thaws_before_operational() {
        let server: Uuid = SERVER.parse().expect("uuid");
        let shard_status = serde_json::json!({
            "primary": {"server_uuid": server, "ok": true},
            "sync": null,
            "async": [],
            "frozen": false
        })
        .to_string();

        let (cnapi, cnapi_seen) = routed_server(move |method, url, body| match (method, url) {
            ("GET", u) if u.starts_with("/reboot-plans/") => {
                Some(plan_json("running", &[reboot_json(None, false)]))
            }
            ("POST", u) if u.contains("/execute") => {
                let output = if body.contains("status") {
                    serde_json::json!({"exit_status": 0, "stdout": &shard_status, "stderr": ""})
                } else {
                    serde_json::json!({"exit_status": 0, "stdout": "", "stderr": ""})
                };
                Some(output.to_string())
            }
            ("POST", u) if u.contains("/reboot") => Some(format!(r#"{{"job_uuid":"{JOB}"}}"#)),
            ("POST", "/instances/health") => Some(
                r#"[{"service":"manatee","instance":"a","hostname":"cn0","healthy":true,"health_errors":[]}]"#
                    .to_string(),
            ),
            ("PUT", u) if u.contains("/reboots/") => None,
            other => panic!("unexpected cnapi request: {other:?}"),
        });
        let (wfapi, _) = routed_server(|_method, _url, _body| {
            Some(format!(
                r#"{{"uuid":"{JOB}","name":"server-reboot","execution":"succeeded","params":{{"reboot_uuid":"{RID}"}}}}"#
            ))
        });

        let config = config_with(cnapi, wfapi);
        let clients = SdcClients::new(&config).expect("clients");
        let reboot: Reboot =
            serde_json::from_str(&reboot_json(None, false)).expect("reboot record");
        let poller = Poller::new(Duration::from_millis(1), 10);

        run_one_reboot(
            &clients,
            PLAN.parse().expect("uuid"),
            &reboot,
            &[server],
            &poller,
        )
        .expect("primary reboot succeeds");

        let seen = cnapi_seen.lock().expect("lock");
        let idx_of = |needle: &str| {
            seen.iter()
                .position(|line| line.contains(needle))
                .unwrap_or_else(|| panic!("no request containing {needle:?}: {seen:?}"))
        };
        let freeze = idx_of("freeze -r");
        let submit = idx_of("drain");
        let thaw = idx_of("unfreeze");
        let operational = idx_of("operational_at");
        assert!(freeze < submit, "freeze happens before the reboot job");
        assert!(thaw < operational, "thaw happens before operational");
    }

    #[test]
    fn drive_finishes_a_plan_with_nothing_remaining() {
        let (cnapi, cnapi_seen) = routed_server(|method, url, _body| match (method, url) {
            ("GET", u) if u.starts_with("/reboot-plans/") => {
                Some(plan_json("running", &[reboot_json(Some(JOB), true)]))
            }
            ("PUT", u) if u.starts_with("/reboot-plans/") => None,
            other => panic!("unexpected request: {other:?}"),
        });

        let config = config_with(cnapi, "http://127.0.0.1:1".to_string());
        let clients = SdcClients::new(&config).expect("clients");

        let outcome = drive(
            &clients,
            &config,
            &mut QuietReporter,
            PLAN.parse().expect("uuid"),
        )
        .expect("drive");
        assert_eq!(outcome, Outcome::Finished);

        let seen = cnapi_seen.lock().expect("lock");
        let put = seen
            .iter()
            .find(|line| line.starts_with("PUT"))
            .expect("finish PUT");
        assert!(put.contains("finish"));
    }

    #[test]
    fn drive_leaves_a_stopped_plan_alone() {
        let (cnapi, _seen) = routed_server(|method, url, _body| match (method, url) {
            ("GET", u) if u.starts_with("/reboot-plans/") => {
                Some(plan_json("stopped", &[reboot_json(None, false)]))
            }
            other => panic!("unexpected request: {other:?}"),
        });

        let config = config_with(cnapi, "http://127.0.0.1:1".to_string());
        let clients = SdcClients::new(&config).expect("clients");

        let outcome = drive(
            &clients,
            &config,
            &mut QuietReporter,
            PLAN.parse().expect("uuid"),
        )
        .expect("drive");
        assert_eq!(outcome, Outcome::Interrupted);
    }

    #[test]
    fn run_pending_with_no_plans_is_a_noop() {
        let (cnapi, _seen) = routed_server(|method, url, _body| match (method, url) {
            ("GET", u) if u.starts_with("/reboot-plans") => Some("[]".to_string()),
            other => panic!("unexpected request: {other:?}"),
        });

        let config = config_with(cnapi, "http://127.0.0.1:1".to_string());
        let clients = SdcClients::new(&config).expect("clients");

        let outcome = run_pending(&clients, &config, &mut QuietReporter).expect("noop");
        assert_eq!(outcome, Outcome::NothingToDo);
    }
}
