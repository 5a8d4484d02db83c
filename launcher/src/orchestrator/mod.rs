//! Drive child stacks from submission to a terminal status.
//!
//! The [Orchestrator] owns every [DeploymentRecord]. Records are only mutated by submissions
//! and by status transitions observed on the backend, and are archived (never removed) by an
//! explicit [Orchestrator::destroy].
//!
//! # Submission
//!
//! A request is validated, mapped to a [ChildStackName], and submitted as a create. If the
//! backend reports that the stack already exists, the same specification is submitted as an
//! update instead. Any other backend error marks the record `FAILED` with the backend
//! diagnostic and is not retried here.
//!
//! # Concurrency
//!
//! Submissions and polls for different names proceed independently. The record map is the
//! only shared state and its lock is never held across a backend call.
//!
//! # Teardown
//!
//! [Orchestrator::destroy] requests deletion and keeps the record in progress until the
//! stack disappears (`DESTROYED`) or the deletion fails (`FAILED` with the backend
//! diagnostic).

use crate::{
    backend::{
        self, Backend, Operation, StackSpec, StackState, StackSummary, INBOUND_CIDR_PARAMETER,
        KEY_PAIR_PARAMETER, PREFIX_TAG, REQUEST_TAG,
    },
    bootstrap::{Exit, Reporter},
    config::Identity,
    naming::{self, ChildStackName, Prefix},
    permissions::{self, PermissionSet, ANY_RESOURCE},
    request::ProvisionRequest,
    template::{TemplateReference, TemplateStore},
    Error,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
    time::Duration,
};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

mod record;
pub use record::{DeploymentRecord, Outcome, Status, Submission};

/// Diagnostic attached to a record whose stack disappeared from the backend.
const STACK_GONE: &str = "stack no longer exists";

/// Native status of a stack whose deletion failed.
const DELETE_FAILED: &str = "DELETE_FAILED";

/// Orchestrator configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Account and region the child stacks live in.
    pub identity: Identity,
    /// Leading component of every child stack name.
    pub prefix: Prefix,
    /// Instance template submitted for every request.
    pub template: TemplateReference,
    /// Interval between status polls in [Orchestrator::await_terminal].
    pub poll_interval: Duration,
    /// Extra tags applied to every child stack.
    pub tags: BTreeMap<String, String>,
}

/// Result of handing a stack specification to the backend.
enum Submitted {
    Accepted {
        id: Option<String>,
        submission: Submission,
    },
    Rejected {
        operation: Operation,
        error: backend::Error,
    },
}

/// Stack lifecycle orchestrator.
pub struct Orchestrator<B: Backend, T: TemplateStore> {
    config: Config,
    backend: B,
    templates: T,
    permissions: PermissionSet,
    records: Mutex<HashMap<ChildStackName, DeploymentRecord>>,
}

impl<B: Backend, T: TemplateStore> Orchestrator<B, T> {
    /// Creates an orchestrator, computing its [PermissionSet] from the configured identity.
    pub fn new(config: Config, backend: B, templates: T) -> Self {
        let permissions = PermissionSet::for_identity(&config.identity);
        Self {
            config,
            backend,
            templates,
            permissions,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns the name a request resolves to.
    pub fn name(&self, request: &ProvisionRequest) -> ChildStackName {
        naming::derive(&self.config.prefix, &request.id)
    }

    /// Returns a snapshot of the record for `name`.
    pub fn record(&self, name: &ChildStackName) -> Option<DeploymentRecord> {
        self.records.lock().unwrap().get(name).cloned()
    }

    /// Returns a snapshot of all records, newest first.
    pub fn records(&self) -> Vec<DeploymentRecord> {
        let mut records: Vec<_> = self.records.lock().unwrap().values().cloned().collect();
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        records
    }

    /// Restores a record (e.g. one persisted by a previous process).
    pub fn restore(&self, record: DeploymentRecord) {
        debug!(name = record.name.as_str(), status = %record.status, "restored record");
        self.records
            .lock()
            .unwrap()
            .insert(record.name.clone(), record);
    }

    fn store(&self, record: &DeploymentRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.name.clone(), record.clone());
    }

    /// Applies `f` to the stored record for `name`, returning the updated snapshot.
    fn update<F>(&self, name: &ChildStackName, f: F) -> Result<DeploymentRecord, Error>
    where
        F: FnOnce(&mut DeploymentRecord),
    {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(name)
            .ok_or_else(|| Error::UnknownDeployment(name.to_string()))?;
        f(record);
        Ok(record.clone())
    }

    fn stack_arn(&self, name: &ChildStackName, id: Option<&str>) -> String {
        permissions::stack_arn(&self.config.identity, name.as_str(), id)
    }

    /// Fails closed if `operation` is not allowed on `resource`.
    fn authorize(&self, operation: Operation, resource: &str) -> Result<(), Error> {
        if self.permissions.is_allowed(operation.action(), resource) {
            return Ok(());
        }
        warn!(action = operation.action(), resource, "permission denied");
        Err(Error::PermissionDenied {
            action: operation.action().to_string(),
            resource: resource.to_string(),
        })
    }

    /// Maps a backend rejection onto the crate error, surfacing denials as
    /// [Error::PermissionDenied].
    fn backend_error(
        &self,
        operation: Operation,
        name: Option<&ChildStackName>,
        resource: &str,
        source: backend::Error,
    ) -> Error {
        warn!(
            name = name.map(|name| name.as_str()),
            %operation,
            error = %source,
            "backend rejected operation"
        );
        match source {
            backend::Error::AccessDenied(_) => Error::PermissionDenied {
                action: operation.action().to_string(),
                resource: resource.to_string(),
            },
            source => Error::Backend {
                operation,
                name: name.cloned(),
                source,
            },
        }
    }

    fn stack_spec(
        &self,
        name: &ChildStackName,
        request: &ProvisionRequest,
        template_url: String,
    ) -> StackSpec {
        let mut tags = self.config.tags.clone();
        tags.insert(PREFIX_TAG.to_string(), self.config.prefix.to_string());
        tags.insert(REQUEST_TAG.to_string(), request.id.to_string());
        StackSpec {
            name: name.to_string(),
            template_url,
            parameters: vec![
                (
                    INBOUND_CIDR_PARAMETER.to_string(),
                    request.inbound_cidr.clone(),
                ),
                (
                    KEY_PAIR_PARAMETER.to_string(),
                    request.key_pair_name.clone(),
                ),
            ],
            tags,
        }
    }

    /// Submits `spec` as an update of an existing stack.
    async fn submit_update(&self, spec: &StackSpec, resource: &str) -> Result<Submitted, Error> {
        self.authorize(Operation::Update, resource)?;
        self.authorize(Operation::Tag, resource)?;
        match self.backend.update_stack(spec).await {
            Ok(id) => Ok(Submitted::Accepted {
                id: Some(id),
                submission: Submission::Resubmitted,
            }),
            Err(backend::Error::NoChanges) => {
                debug!(name = spec.name.as_str(), "stack already up to date");
                Ok(Submitted::Accepted {
                    id: None,
                    submission: Submission::Resubmitted,
                })
            }
            Err(backend::Error::Busy(reason)) => {
                debug!(name = spec.name.as_str(), reason, "stack already being deployed");
                Ok(Submitted::Accepted {
                    id: None,
                    submission: Submission::Resubmitted,
                })
            }
            Err(error) => Ok(Submitted::Rejected {
                operation: Operation::Update,
                error,
            }),
        }
    }

    /// Submits `spec` as a new stack, falling back to an update if it already exists.
    async fn submit_create(&self, spec: &StackSpec, resource: &str) -> Result<Submitted, Error> {
        self.authorize(Operation::Create, resource)?;
        self.authorize(Operation::Tag, resource)?;
        match self.backend.create_stack(spec).await {
            Ok(id) => Ok(Submitted::Accepted {
                id: Some(id),
                submission: Submission::Created,
            }),
            Err(backend::Error::AlreadyExists) => {
                info!(
                    name = spec.name.as_str(),
                    "stack already exists, submitting as update"
                );
                self.submit_update(spec, resource).await
            }
            Err(error) => Ok(Submitted::Rejected {
                operation: Operation::Create,
                error,
            }),
        }
    }

    /// Submits a request, returning its record with status [Status::Submitting].
    ///
    /// Invalid requests are rejected before any backend call. If the backend rejects the
    /// submission, the record is returned with status [Status::Failed] and the backend
    /// diagnostic.
    pub async fn submit(&self, request: ProvisionRequest) -> Result<DeploymentRecord, Error> {
        let cidr = request.validate()?;
        let name = self.name(&request);
        debug!(name = name.as_str(), cidr = %cidr, "validated request");

        // A stack that failed (or was torn down) is never silently reused
        let prior = self.record(&name);
        if let Some(prior) = &prior {
            if prior.status == Status::Destroyed || prior.teardown_requested {
                return Err(Error::Destroyed(name));
            }
            if prior.status.is_failure() && prior.stack_id.is_some() {
                return Err(Error::AlreadyFailed(name));
            }
        }
        let known_id = prior.as_ref().and_then(|prior| prior.stack_id.clone());

        let template_url = self.templates.resolve(&self.config.template).await?;
        let spec = self.stack_spec(&name, &request, template_url);
        let mut record =
            DeploymentRecord::new(name.clone(), request, self.config.template.clone());
        if let Some(prior) = &prior {
            record.created_at = prior.created_at;
        }

        // Update directly if a live stack is already known for this request
        let resource = self.stack_arn(&name, known_id.as_deref());
        let submitted = match &known_id {
            Some(_) => self.submit_update(&spec, &resource).await?,
            None => self.submit_create(&spec, &resource).await?,
        };
        match submitted {
            Submitted::Accepted { id, submission } => {
                record.stack_id = id.or(known_id);
                record.submission = submission;
                info!(
                    name = name.as_str(),
                    submission = ?submission,
                    "submitted stack"
                );
                self.store(&record);
                Ok(record)
            }
            Submitted::Rejected { operation, error } => {
                warn!(
                    name = name.as_str(),
                    %operation,
                    error = %error,
                    "backend rejected submission"
                );
                record.stack_id = known_id;
                record.diagnostic = Some(error.diagnostic());
                record.transition(Status::Failed);
                self.store(&record);
                match error {
                    backend::Error::AccessDenied(_) => {
                        Err(self.backend_error(operation, Some(&name), &resource, error))
                    }
                    backend::Error::Unrecoverable(_) => Err(Error::AlreadyFailed(name)),
                    _ => Ok(record),
                }
            }
        }
    }

    /// Maps a backend observation onto a record.
    fn observe(record: &mut DeploymentRecord, state: Option<StackState>) {
        match state {
            Some(state) => {
                let mut status = Status::from_native(&state.status);
                if record.teardown_requested {
                    // Only the outcome of the deletion is terminal
                    status = match status {
                        Status::Destroyed => Status::Destroyed,
                        Status::Failed if state.status == DELETE_FAILED => {
                            record.teardown_requested = false;
                            Status::Failed
                        }
                        _ => Status::InProgress,
                    };
                } else if status == Status::Destroyed && record.cancel_requested {
                    status = Status::RolledBack;
                }
                if status == Status::Destroyed && record.teardown_requested {
                    record.teardown_requested = false;
                    record.diagnostic = None;
                } else if status.is_terminal() && status != Status::Succeeded {
                    record.diagnostic = state
                        .reason
                        .clone()
                        .or_else(|| Some(state.status.clone()));
                } else if status == Status::Succeeded {
                    record.diagnostic = None;
                }
                record.stack_id = Some(state.id);
                record.native_status = Some(state.status);
                record.transition(status);
            }
            None if record.teardown_requested => {
                record.native_status = None;
                record.teardown_requested = false;
                record.diagnostic = None;
                record.transition(Status::Destroyed);
            }
            None if record.status == Status::Submitting && record.stack_id.is_none() => {}
            None if record.cancel_requested => {
                record.native_status = None;
                record.transition(Status::RolledBack);
            }
            None => {
                record.native_status = None;
                record.diagnostic = Some(STACK_GONE.to_string());
                record.transition(Status::Destroyed);
            }
        }
    }

    /// Queries the backend for the current status of `name`.
    ///
    /// The only backend call is a describe; only the local record is updated.
    pub async fn poll_status(&self, name: &ChildStackName) -> Result<DeploymentRecord, Error> {
        let record = self
            .record(name)
            .ok_or_else(|| Error::UnknownDeployment(name.to_string()))?;

        // Nothing left to observe
        if record.status == Status::Destroyed
            || (record.status == Status::Failed
                && record.stack_id.is_none()
                && !record.teardown_requested)
        {
            return Ok(record);
        }

        let resource = self.stack_arn(name, record.stack_id.as_deref());
        self.authorize(Operation::Describe, &resource)?;
        let state = self
            .backend
            .describe_stack(name.as_str())
            .await
            .map_err(|source| {
                self.backend_error(Operation::Describe, Some(name), &resource, source)
            })?;
        debug!(
            name = name.as_str(),
            native = state.as_ref().map(|s| s.status.as_str()),
            "polled stack"
        );
        self.update(name, |record| Self::observe(record, state))
    }

    /// Polls until `name` reaches a terminal status.
    ///
    /// Returns [Error::Timeout] with the last known record if `timeout` elapses first,
    /// including while a poll is still waiting on the backend.
    pub async fn await_terminal(
        &self,
        name: &ChildStackName,
        timeout: Duration,
    ) -> Result<DeploymentRecord, Error> {
        let start = Instant::now();
        let deadline = start + timeout;
        loop {
            let record = match timeout_at(deadline, self.poll_status(name)).await {
                Ok(result) => result?,
                Err(_) => {
                    let record = self
                        .record(name)
                        .ok_or_else(|| Error::UnknownDeployment(name.to_string()))?;
                    warn!(
                        name = name.as_str(),
                        status = %record.status,
                        "timed out waiting for backend"
                    );
                    return Err(Error::Timeout(Box::new(record)));
                }
            };
            if record.status.is_terminal() {
                info!(
                    name = name.as_str(),
                    status = %record.status,
                    elapsed_secs = start.elapsed().as_secs(),
                    "deployment finished"
                );
                return Ok(record);
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    name = name.as_str(),
                    status = %record.status,
                    "timed out waiting for deployment"
                );
                return Err(Error::Timeout(Box::new(record)));
            }
            sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Requests a best-effort halt and rollback of an in-flight deployment.
    ///
    /// A stack that is still being created is deleted; a stack being updated has its update
    /// cancelled. Terminal deployments and pending teardowns are left untouched. The final
    /// status is observed with [Orchestrator::poll_status].
    pub async fn cancel(&self, name: &ChildStackName) -> Result<DeploymentRecord, Error> {
        let mut record = self
            .record(name)
            .ok_or_else(|| Error::UnknownDeployment(name.to_string()))?;

        // A submission may have found the stack already settled
        if record.status == Status::Submitting || record.native_status.is_none() {
            record = self.poll_status(name).await?;
        }
        if record.status.is_terminal() || record.teardown_requested {
            debug!(name = name.as_str(), status = %record.status, "nothing to cancel");
            return Ok(record);
        }

        let creating = match record.native_status.as_deref() {
            Some(native) => native.starts_with("CREATE_") || native == "REVIEW_IN_PROGRESS",
            None => record.submission == Submission::Created,
        };
        let operation = if creating {
            Operation::Delete
        } else {
            Operation::CancelUpdate
        };
        let resource = self.stack_arn(name, record.stack_id.as_deref());
        self.authorize(operation, &resource)?;
        let result = match operation {
            Operation::Delete => self.backend.delete_stack(name.as_str()).await,
            _ => self.backend.cancel_update(name.as_str()).await,
        };
        result.map_err(|source| self.backend_error(operation, Some(name), &resource, source))?;
        info!(name = name.as_str(), %operation, "requested cancellation");
        self.update(name, |record| record.cancel_requested = true)
    }

    /// Requests teardown of the stack for `name`.
    ///
    /// The record stays [Status::InProgress] until polling observes the stack gone
    /// ([Status::Destroyed], archived and never reused) or the deletion failed
    /// ([Status::Failed], after which teardown may be requested again).
    pub async fn destroy(&self, name: &ChildStackName) -> Result<DeploymentRecord, Error> {
        let record = self
            .record(name)
            .ok_or_else(|| Error::UnknownDeployment(name.to_string()))?;
        if record.status == Status::Destroyed {
            return Ok(record);
        }
        let resource = self.stack_arn(name, record.stack_id.as_deref());
        self.authorize(Operation::Delete, &resource)?;
        self.backend
            .delete_stack(name.as_str())
            .await
            .map_err(|source| {
                self.backend_error(Operation::Delete, Some(name), &resource, source)
            })?;
        info!(name = name.as_str(), "requested stack deletion");
        self.update(name, |record| {
            record.teardown_requested = true;
            record.diagnostic = None;
            record.transition(Status::InProgress);
        })
    }

    /// Reads the exit status the bootstrap of `name` signalled and hands it to `reporter`.
    ///
    /// Only succeeded deployments are read. If no status is found, `reporter` is dropped so
    /// the matching completion resolves without one.
    pub async fn observe_bootstrap(
        &self,
        name: &ChildStackName,
        reporter: Reporter,
    ) -> Result<Option<Exit>, Error> {
        let record = self
            .record(name)
            .ok_or_else(|| Error::UnknownDeployment(name.to_string()))?;
        if record.status != Status::Succeeded {
            return Ok(None);
        }
        let resource = self.stack_arn(name, record.stack_id.as_deref());
        self.authorize(Operation::Events, &resource)?;
        let exit = self
            .backend
            .bootstrap_exit(name.as_str())
            .await
            .map_err(|source| {
                self.backend_error(Operation::Events, Some(name), &resource, source)
            })?;
        match exit {
            Some(exit) => {
                info!(name = name.as_str(), %exit, "bootstrap finished");
                reporter.report(exit);
            }
            None => warn!(name = name.as_str(), "bootstrap did not signal"),
        }
        Ok(exit)
    }

    /// Lists live stacks created under the configured prefix.
    pub async fn list_remote(&self) -> Result<Vec<StackSummary>, Error> {
        self.authorize(Operation::List, ANY_RESOURCE)?;
        let prefix = format!("{}-", self.config.prefix);
        self.backend
            .list_stacks(&prefix)
            .await
            .map_err(|source| self.backend_error(Operation::List, None, ANY_RESOURCE, source))
    }
}
