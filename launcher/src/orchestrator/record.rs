//! Deployment records and the outcome reported to callers.

use crate::{
    bootstrap::Exit, naming::ChildStackName, request::ProvisionRequest,
    template::TemplateReference, Error,
};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::info;

/// Returns the current time in seconds since the unix epoch.
pub(crate) fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Logical status of a deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Submitted but not yet observed on the backend.
    Submitting,
    InProgress,
    Succeeded,
    Failed,
    RolledBack,
    /// Torn down by an explicit request.
    Destroyed,
}

impl Status {
    /// Maps a native backend status onto a logical status.
    ///
    /// Unknown statuses map to [Status::InProgress] so they are never treated as terminal.
    pub fn from_native(status: &str) -> Self {
        match status {
            "DELETE_COMPLETE" => Status::Destroyed,
            "CREATE_COMPLETE" | "UPDATE_COMPLETE" | "IMPORT_COMPLETE" => Status::Succeeded,
            s if s.ends_with("_IN_PROGRESS") => Status::InProgress,
            s if s.ends_with("ROLLBACK_COMPLETE") => Status::RolledBack,
            s if s.ends_with("_FAILED") => Status::Failed,
            _ => Status::InProgress,
        }
    }

    /// Returns true if no further transitions are expected.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Succeeded | Status::Failed | Status::RolledBack | Status::Destroyed
        )
    }

    /// Returns true if the deployment ended without succeeding.
    pub fn is_failure(&self) -> bool {
        matches!(self, Status::Failed | Status::RolledBack)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Submitting => "SUBMITTING",
            Status::InProgress => "IN_PROGRESS",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::RolledBack => "ROLLED_BACK",
            Status::Destroyed => "DESTROYED",
        };
        f.write_str(s)
    }
}

/// How the latest submission reached the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Submission {
    /// A new stack was created.
    Created,
    /// An existing stack was updated (or already matched the request).
    Resubmitted,
}

/// Local view of one child deployment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub name: ChildStackName,
    pub status: Status,
    pub parameters: ProvisionRequest,
    pub template: TemplateReference,
    pub submission: Submission,
    /// Backend-assigned stack id (once known).
    pub stack_id: Option<String>,
    /// Last native status observed on the backend.
    pub native_status: Option<String>,
    pub diagnostic: Option<String>,
    pub cancel_requested: bool,
    /// Set while a teardown is waiting for the stack to disappear.
    pub teardown_requested: bool,
    pub created_at: u64,
    pub last_transition_at: u64,
}

impl DeploymentRecord {
    pub(crate) fn new(
        name: ChildStackName,
        parameters: ProvisionRequest,
        template: TemplateReference,
    ) -> Self {
        let now = now();
        Self {
            name,
            status: Status::Submitting,
            parameters,
            template,
            submission: Submission::Created,
            stack_id: None,
            native_status: None,
            diagnostic: None,
            cancel_requested: false,
            teardown_requested: false,
            created_at: now,
            last_transition_at: now,
        }
    }

    /// Moves to `status`, recording the transition time if the status changed.
    pub(crate) fn transition(&mut self, status: Status) {
        if self.status == status {
            return;
        }
        info!(
            name = self.name.as_str(),
            from = %self.status,
            to = %status,
            "status transition"
        );
        self.status = status;
        self.last_transition_at = now();
    }
}

/// Result reported to the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub status: Status,
    pub child_stack_name: Option<ChildStackName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic_message: Option<String>,
}

impl Outcome {
    /// Reports the current state of a record.
    pub fn from_record(record: &DeploymentRecord) -> Self {
        Self {
            status: record.status,
            child_stack_name: Some(record.name.clone()),
            diagnostic_message: record.diagnostic.clone(),
        }
    }

    /// Reports an error.
    ///
    /// A timeout reports the last known status of the deployment rather than a failure.
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::Timeout(record) => Self {
                status: record.status,
                child_stack_name: Some(record.name.clone()),
                diagnostic_message: Some(error.to_string()),
            },
            Error::AlreadyFailed(name)
            | Error::Destroyed(name)
            | Error::Backend {
                name: Some(name), ..
            } => Self {
                status: Status::Failed,
                child_stack_name: Some(name.clone()),
                diagnostic_message: Some(error.to_string()),
            },
            _ => Self {
                status: Status::Failed,
                child_stack_name: None,
                diagnostic_message: Some(error.to_string()),
            },
        }
    }

    /// Combines the deployment status with the bootstrap exit status.
    ///
    /// Provisioning succeeded only if the deployment succeeded and the bootstrap artifact
    /// exited zero.
    pub fn evaluate(record: &DeploymentRecord, bootstrap: Option<Exit>) -> Self {
        let mut outcome = Self::from_record(record);
        if record.status != Status::Succeeded {
            return outcome;
        }
        match bootstrap {
            Some(exit) if exit.success() => {}
            Some(exit) => {
                outcome.status = Status::Failed;
                outcome.diagnostic_message = Some(format!("bootstrap failed with {exit}"));
            }
            None => {
                outcome.status = Status::Failed;
                outcome.diagnostic_message = Some("bootstrap did not report completion".into());
            }
        }
        outcome
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Succeeded
    }
}
