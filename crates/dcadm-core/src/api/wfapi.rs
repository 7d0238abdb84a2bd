//! Workflow-engine client.

use anyhow::{Result, bail};
use reqwest::blocking::Client;
use uuid::Uuid;

use dcadm_retry::{PollOutcome, Poller};
use dcadm_types::{DcadmError, Job, JobExecution, Upstream};

use super::Endpoint;

#[derive(Debug, Clone)]
pub struct WfapiClient {
    ep: Endpoint,
}

impl WfapiClient {
    pub fn new(http: Client, base: &str) -> Self {
        Self {
            ep: Endpoint::new(http, base, Upstream::Wfapi),
        }
    }

    pub fn get_job(&self, uuid: Uuid) -> Result<Job, DcadmError> {
        self.ep.get_json(&format!("/jobs/{uuid}"), &[], "get job")
    }

    /// Poll a job to a terminal state. Succeeded returns the job; failed or
    /// canceled is an error naming the job.
    pub fn wait_for_job(&self, uuid: Uuid, poller: &Poller) -> Result<Job> {
        let job = poller.run(&format!("job {uuid}"), || {
            let job = self.get_job(uuid)?;
            if job.execution.is_terminal() {
                Ok(PollOutcome::Ready(job))
            } else {
                Ok(PollOutcome::Pending)
            }
        })?;

        match job.execution {
            JobExecution::Succeeded => Ok(job),
            JobExecution::Failed => bail!("job {} ({}) failed", job.uuid, job.name),
            JobExecution::Canceled => bail!("job {} ({}) was canceled", job.uuid, job.name),
            _ => unreachable!("poll stops only on terminal execution"),
        }
    }
}
