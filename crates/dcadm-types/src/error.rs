//! Error taxonomy for dcadm.
//!
//! Kinds, not types: usage and validation failures are never retried,
//! upstream errors carry the upstream tag, transport and parse failures are
//! `Internal`, and aggregating steps report a `MultiError`.

use std::fmt;

use thiserror::Error;

/// Which remote API produced an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    Sapi,
    Cnapi,
    Vmapi,
    Imgapi,
    Wfapi,
    Updates,
}

impl Upstream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Upstream::Sapi => "sapi",
            Upstream::Cnapi => "cnapi",
            Upstream::Vmapi => "vmapi",
            Upstream::Imgapi => "imgapi",
            Upstream::Wfapi => "wfapi",
            Upstream::Updates => "updates",
        }
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum DcadmError {
    /// Bad CLI invocation or bad change fields.
    #[error("usage error: {0}")]
    Usage(String),

    /// A change-set rule failed.
    #[error("validation error: {0}")]
    Validation(String),

    /// Semantic update failure: unknown service, no candidate image,
    /// denylisted target.
    #[error("update error: {0}")]
    Update(String),

    /// An upstream returned an error response.
    #[error("{upstream} error{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    SdcClient {
        upstream: Upstream,
        status: Option<u16>,
        message: String,
    },

    /// Transport failures, I/O, unexpected payloads.
    #[error("internal error: {0}")]
    Internal(String),

    /// Aggregate of several failures.
    #[error("{0}")]
    Multi(MultiError),
}

impl DcadmError {
    pub fn usage(msg: impl Into<String>) -> Self {
        DcadmError::Usage(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        DcadmError::Validation(msg.into())
    }

    pub fn update(msg: impl Into<String>) -> Self {
        DcadmError::Update(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        DcadmError::Internal(msg.into())
    }

    pub fn upstream(upstream: Upstream, status: Option<u16>, msg: impl Into<String>) -> Self {
        DcadmError::SdcClient {
            upstream,
            status,
            message: msg.into(),
        }
    }

    /// Upstream "resource not found" responses, used by fall-through lookups.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DcadmError::SdcClient {
                status: Some(404),
                ..
            }
        )
    }

    /// The upstream tag, when this error came from a remote API.
    pub fn upstream_tag(&self) -> Option<Upstream> {
        match self {
            DcadmError::SdcClient { upstream, .. } => Some(*upstream),
            _ => None,
        }
    }
}

/// Several errors reported as one, preserving every violation.
#[derive(Debug, Default)]
pub struct MultiError {
    pub errors: Vec<DcadmError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn push(&mut self, err: DcadmError) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Collapse into a result: `Ok` when nothing was collected, the sole
    /// error when there is one, `Multi` otherwise.
    pub fn into_result(mut self) -> Result<(), DcadmError> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(DcadmError::Multi(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} errors:", self.errors.len())?;
        for err in &self.errors {
            writeln!(f, "  - {err}")?;
        }
        Ok(())
    }
}
