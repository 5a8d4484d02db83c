//! CloudFormation deployment backend.

use crate::{
    backend::{self, Error, StackSpec, StackState, StackSummary},
    bootstrap::{self, Exit, SIGNAL_RESOURCE},
};
use aws_sdk_cloudformation::{
    error::{DisplayErrorContext, ProvideErrorMetadata},
    types::{Capability, OnFailure, Parameter, Tag},
    Client as CloudFormationClient,
};
use aws_config::SdkConfig;
use tracing::debug;

/// Native status of a stack that has been deleted (still visible by id).
const DELETE_COMPLETE: &str = "DELETE_COMPLETE";

/// Returns the stack status quoted in messages like `Stack:x is in ROLLBACK_COMPLETE state`.
fn quoted_state(message: &str) -> Option<&str> {
    let (_, rest) = message.split_once(" is in ")?;
    let (state, _) = rest.split_once(" state")?;
    Some(state)
}

/// Maps a CloudFormation error code and message onto a [backend::Error].
pub fn classify(code: Option<&str>, message: Option<&str>) -> Error {
    let message = message.unwrap_or_default().to_string();
    match code {
        Some("AlreadyExistsException") => Error::AlreadyExists,
        Some("AccessDenied" | "AccessDeniedException" | "UnauthorizedOperation") => {
            Error::AccessDenied(message)
        }
        Some("ValidationError") if message.contains("No updates are to be performed") => {
            Error::NoChanges
        }
        Some("ValidationError") if message.contains("does not exist") => Error::NotFound(message),
        Some("ValidationError")
            if message.contains("can not be updated")
                || message.contains("cannot be updated")
                || message.contains("_IN_PROGRESS state") =>
        {
            match quoted_state(&message) {
                Some(state) if state.ends_with("_IN_PROGRESS") => Error::Busy(message),
                Some(_) => Error::Unrecoverable(message),
                None => Error::Failure {
                    code: "ValidationError".to_string(),
                    message,
                },
            }
        }
        Some(code) => Error::Failure {
            code: code.to_string(),
            message,
        },
        None => Error::Failure {
            code: "Unknown".to_string(),
            message,
        },
    }
}

/// Converts an SDK error into a [backend::Error].
fn convert<E>(error: aws_sdk_cloudformation::error::SdkError<E>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    match error.code() {
        Some(code) => classify(Some(code), error.message()),
        None => Error::Failure {
            code: "Transport".to_string(),
            message: DisplayErrorContext(&error).to_string(),
        },
    }
}

fn parameters(spec: &StackSpec) -> Vec<Parameter> {
    spec.parameters
        .iter()
        .map(|(key, value)| {
            Parameter::builder()
                .parameter_key(key)
                .parameter_value(value)
                .build()
        })
        .collect()
}

fn tags(spec: &StackSpec) -> Vec<Tag> {
    spec.tags
        .iter()
        .map(|(key, value)| Tag::builder().key(key).value(value).build())
        .collect()
}

/// A [backend::Backend] that drives stacks with CloudFormation.
#[derive(Clone)]
pub struct Backend {
    client: CloudFormationClient,
}

impl Backend {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: CloudFormationClient::new(config),
        }
    }
}

impl backend::Backend for Backend {
    async fn create_stack(&self, spec: &StackSpec) -> Result<String, Error> {
        let output = self
            .client
            .create_stack()
            .stack_name(&spec.name)
            .template_url(&spec.template_url)
            .set_parameters(Some(parameters(spec)))
            .set_tags(Some(tags(spec)))
            .capabilities(Capability::CapabilityNamedIam)
            .on_failure(OnFailure::DoNothing)
            .send()
            .await
            .map_err(convert)?;
        let id = output.stack_id().unwrap_or(spec.name.as_str()).to_string();
        debug!(name = spec.name.as_str(), id = id.as_str(), "created stack");
        Ok(id)
    }

    async fn update_stack(&self, spec: &StackSpec) -> Result<String, Error> {
        let output = self
            .client
            .update_stack()
            .stack_name(&spec.name)
            .template_url(&spec.template_url)
            .set_parameters(Some(parameters(spec)))
            .set_tags(Some(tags(spec)))
            .capabilities(Capability::CapabilityNamedIam)
            .send()
            .await
            .map_err(convert)?;
        let id = output.stack_id().unwrap_or(spec.name.as_str()).to_string();
        debug!(name = spec.name.as_str(), id = id.as_str(), "updated stack");
        Ok(id)
    }

    async fn describe_stack(&self, name: &str) -> Result<Option<StackState>, Error> {
        let output = match self.client.describe_stacks().stack_name(name).send().await {
            Ok(output) => output,
            Err(e) => {
                return match convert(e) {
                    Error::NotFound(_) => Ok(None),
                    e => Err(e),
                }
            }
        };
        let Some(stack) = output.stacks().first() else {
            return Ok(None);
        };
        let status = stack
            .stack_status()
            .map(|status| status.as_str().to_string())
            .unwrap_or_default();
        if status == DELETE_COMPLETE {
            return Ok(None);
        }
        Ok(Some(StackState {
            id: stack.stack_id().unwrap_or(name).to_string(),
            status,
            reason: stack.stack_status_reason().map(str::to_string),
        }))
    }

    async fn cancel_update(&self, name: &str) -> Result<(), Error> {
        self.client
            .cancel_update_stack()
            .stack_name(name)
            .send()
            .await
            .map_err(convert)?;
        Ok(())
    }

    async fn delete_stack(&self, name: &str) -> Result<(), Error> {
        self.client
            .delete_stack()
            .stack_name(name)
            .send()
            .await
            .map_err(convert)?;
        Ok(())
    }

    async fn bootstrap_exit(&self, name: &str) -> Result<Option<Exit>, Error> {
        // Events are returned newest first
        let mut next_token: Option<String> = None;
        loop {
            let mut request = self.client.describe_stack_events().stack_name(name);
            if let Some(token) = next_token {
                request = request.next_token(token);
            }
            let output = request.send().await.map_err(convert)?;
            let signal = output
                .stack_events()
                .iter()
                .filter(|event| event.logical_resource_id() == Some(SIGNAL_RESOURCE))
                .find_map(|event| event.resource_status_reason().and_then(bootstrap::parse_signal));
            if let Some(exit) = signal {
                debug!(name, %exit, "found bootstrap signal");
                return Ok(Some(exit));
            }
            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => return Ok(None),
            }
        }
    }

    async fn list_stacks(&self, prefix: &str) -> Result<Vec<StackSummary>, Error> {
        let mut stacks = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut request = self.client.list_stacks();
            if let Some(token) = next_token {
                request = request.next_token(token);
            }
            let output = request.send().await.map_err(convert)?;
            for summary in output.stack_summaries() {
                let (Some(name), Some(id)) = (summary.stack_name(), summary.stack_id()) else {
                    continue;
                };
                let status = summary
                    .stack_status()
                    .map(|status| status.as_str())
                    .unwrap_or_default();
                if !name.starts_with(prefix) || status == DELETE_COMPLETE {
                    continue;
                }
                stacks.push(StackSummary {
                    name: name.to_string(),
                    id: id.to_string(),
                    status: status.to_string(),
                });
            }
            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }
        Ok(stacks)
    }
}
