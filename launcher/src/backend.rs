//! Interface to the deployment backend that drives child stacks.

use crate::bootstrap::Exit;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, future::Future};
use thiserror::Error;

/// Template parameter carrying the inbound CIDR block.
pub const INBOUND_CIDR_PARAMETER: &str = "InboundCidrParam";

/// Template parameter carrying the key-pair name.
pub const KEY_PAIR_PARAMETER: &str = "KeyPairName";

/// Tag recording the prefix a stack was created under.
pub const PREFIX_TAG: &str = "launcher:prefix";

/// Tag recording the request a stack was created for.
pub const REQUEST_TAG: &str = "launcher:request";

/// Backend operations (each maps onto exactly one permission-checked action).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Describe,
    CancelUpdate,
    Delete,
    List,
    Tag,
    Events,
}

impl Operation {
    /// Returns the action that must be allowed before issuing the operation.
    pub fn action(&self) -> &'static str {
        match self {
            Operation::Create => "cloudformation:CreateStack",
            Operation::Update => "cloudformation:UpdateStack",
            Operation::Describe => "cloudformation:DescribeStacks",
            Operation::CancelUpdate => "cloudformation:CancelUpdateStack",
            Operation::Delete => "cloudformation:DeleteStack",
            Operation::List => "cloudformation:ListStacks",
            Operation::Tag => "cloudformation:TagResource",
            Operation::Events => "cloudformation:DescribeStackEvents",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "CreateStack"),
            Operation::Update => write!(f, "UpdateStack"),
            Operation::Describe => write!(f, "DescribeStacks"),
            Operation::CancelUpdate => write!(f, "CancelUpdateStack"),
            Operation::Delete => write!(f, "DeleteStack"),
            Operation::List => write!(f, "ListStacks"),
            Operation::Tag => write!(f, "TagResource"),
            Operation::Events => write!(f, "DescribeStackEvents"),
        }
    }
}

/// Everything needed to create or update a child stack.
///
/// Stacks are submitted with the `CAPABILITY_NAMED_IAM` capability and are left in place
/// (`DO_NOTHING`) if creation fails, so the failure can be inspected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackSpec {
    pub name: String,
    pub template_url: String,
    pub parameters: Vec<(String, String)>,
    pub tags: BTreeMap<String, String>,
}

/// Backend view of a stack.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackState {
    /// Backend-assigned stack id.
    pub id: String,
    /// Native status string (e.g. `CREATE_IN_PROGRESS`).
    pub status: String,
    /// Reason attached to the native status, if any.
    pub reason: Option<String>,
}

/// A stack returned by [Backend::list_stacks].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSummary {
    pub name: String,
    pub id: String,
    pub status: String,
}

/// Errors reported by a [Backend].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("stack already exists")]
    AlreadyExists,
    #[error("no updates are to be performed")]
    NoChanges,
    #[error("stack is busy: {0}")]
    Busy(String),
    #[error("stack can no longer be updated: {0}")]
    Unrecoverable(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("stack not found: {0}")]
    NotFound(String),
    #[error("{code}: {message}")]
    Failure { code: String, message: String },
}

impl Error {
    /// Returns the diagnostic surfaced to callers.
    pub fn diagnostic(&self) -> String {
        self.to_string()
    }
}

/// Deployment backend that manages named stacks.
pub trait Backend: Send + Sync {
    /// Creates a stack, returning its id. Fails with [Error::AlreadyExists] if a stack
    /// with the same name exists.
    fn create_stack(&self, spec: &StackSpec) -> impl Future<Output = Result<String, Error>> + Send;

    /// Updates an existing stack, returning its id. Fails with [Error::NoChanges] if the
    /// stack already matches `spec`, with [Error::Busy] while another operation is in
    /// progress, and with [Error::Unrecoverable] if the stack failed and must be deleted.
    fn update_stack(&self, spec: &StackSpec) -> impl Future<Output = Result<String, Error>> + Send;

    /// Describes a stack, returning `None` if it does not exist.
    fn describe_stack(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<StackState>, Error>> + Send;

    /// Cancels an in-progress update (rolling it back).
    fn cancel_update(&self, name: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// Deletes a stack.
    fn delete_stack(&self, name: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// Returns the exit status the instance bootstrap signalled to the stack, if any.
    fn bootstrap_exit(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<Exit>, Error>> + Send;

    /// Lists live stacks whose name starts with `prefix`.
    fn list_stacks(
        &self,
        prefix: &str,
    ) -> impl Future<Output = Result<Vec<StackSummary>, Error>> + Send;
}
