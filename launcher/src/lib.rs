//! Provision a bootstrapped instance on demand through a child deployment stack.
//!
//! A caller supplies an inbound CIDR block and a key-pair name. The [orchestrator::Orchestrator]
//! validates the request, derives a collision-free stack name ([naming]), resolves the
//! instance template from a [template::TemplateStore], and drives a child stack on a
//! [backend::Backend] from submission to a terminal status. Every backend action is checked
//! against a fixed [permissions::PermissionSet] before it is issued.
//!
//! # Lifecycle
//!
//! ```txt
//! ABSENT --submit--> SUBMITTING --poll--> IN_PROGRESS --poll--> SUCCEEDED
//!                                              |                FAILED
//!                                              +--cancel------> ROLLED_BACK
//! ```
//!
//! Any record can be torn down with [orchestrator::Orchestrator::destroy], which archives it
//! as `DESTROYED`.
//!
//! # Status
//!
//! `commonware-launcher` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

#![doc(
    html_logo_url = "https://commonware.xyz/imgs/rustdoc_logo.svg",
    html_favicon_url = "https://commonware.xyz/favicon.ico"
)]

use thiserror::Error;

pub mod backend;
pub mod bootstrap;
pub mod config;
pub mod journal;
pub mod mocks;
pub mod naming;
pub mod orchestrator;
pub mod permissions;
pub mod request;
pub mod template;
cfg_if::cfg_if! {
    if #[cfg(feature = "aws")] {
        pub mod aws;
    }
}

pub use naming::ChildStackName;
pub use orchestrator::{DeploymentRecord, Orchestrator, Outcome, Status};
pub use request::{ProvisionRequest, RequestId};

/// Errors that can occur when provisioning.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    Validation(#[from] request::ValidationError),
    /// An action was refused, either by the local permission boundary (before any backend
    /// call) or by the backend itself.
    #[error("permission denied: {action} on {resource}")]
    PermissionDenied { action: String, resource: String },
    /// The backend rejected an operation. `name` is the deployment it targeted, if any.
    #[error("{operation} failed: {source}")]
    Backend {
        operation: backend::Operation,
        name: Option<ChildStackName>,
        #[source]
        source: backend::Error,
    },
    #[error("timed out waiting for {} (last status: {})", .0.name, .0.status)]
    Timeout(Box<DeploymentRecord>),
    #[error("unknown deployment: {0}")]
    UnknownDeployment(String),
    #[error("deployment already failed, destroy it before resubmitting: {0}")]
    AlreadyFailed(ChildStackName),
    #[error("deployment destroyed: {0}")]
    Destroyed(ChildStackName),
    #[error("invalid prefix: {0}")]
    InvalidPrefix(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("template error: {0}")]
    Template(String),
    #[cfg(feature = "aws")]
    #[error("s3 {operation} failed for bucket {bucket}: {source}")]
    AwsS3 {
        bucket: String,
        operation: aws::s3::Operation,
        #[source]
        source: Box<aws_sdk_s3::Error>,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
