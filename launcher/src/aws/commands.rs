//! Subcommands of the `launcher` binary.

use crate::{
    aws::{cloudformation, s3, sdk_config, Region},
    bootstrap::{self, Bootstrap},
    config::Config,
    journal::{launcher_directory, Journal},
    naming::ChildStackName,
    orchestrator::{DeploymentRecord, Orchestrator, Outcome},
    permissions::PermissionSet,
    request::{ProvisionRequest, RequestId},
    template::{TemplateReference, TemplateStore},
    Error,
};
use std::{path::Path, time::Duration};
use tracing::{info, warn};

/// Submit a request and wait for it to finish
pub const LAUNCH_CMD: &str = "launch";

/// Poll the status of a deployment
pub const STATUS_CMD: &str = "status";

/// Cancel an in-flight deployment
pub const CANCEL_CMD: &str = "cancel";

/// Tear down a deployment
pub const DESTROY_CMD: &str = "destroy";

/// List local and remote deployments
pub const LIST_CMD: &str = "list";

/// Publish an artifact to the template store
pub const PUBLISH_CMD: &str = "publish";

/// Print the permission boundary as an IAM policy document
pub const POLICY_CMD: &str = "policy";

/// Render the instance bootstrap commands
pub const USER_DATA_CMD: &str = "user-data";

/// Values that override the configuration file (flags or environment).
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub prefix: Option<String>,
    pub template_url: Option<String>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(prefix) = self.prefix {
            config.prefix = prefix;
        }
        if let Some(location) = self.template_url {
            config.template.location = location;
        }
    }
}

/// Parameters of a `launch`.
#[derive(Clone, Debug)]
pub struct Launch {
    pub inbound_cidr: String,
    pub key_pair_name: String,
    pub request_id: Option<String>,
    pub timeout: Option<Duration>,
}

type AwsOrchestrator = Orchestrator<cloudformation::Backend, s3::Store>;

/// Loads the configuration and builds an orchestrator over the persisted records.
async fn setup(path: &Path, overrides: Overrides) -> Result<(Config, AwsOrchestrator, Journal), Error> {
    let mut config = Config::load(path)?;
    overrides.apply(&mut config);
    let orchestrator_config = config.orchestrator()?;

    // Artifacts are read from the bucket of the template unless one is configured
    let bucket = config
        .bucket
        .clone()
        .or_else(|| s3::parse_location(&config.template.location).map(|(b, _)| b.to_string()))
        .unwrap_or_default();
    let sdk = sdk_config(Region::new(config.identity.region.clone())).await;
    let orchestrator = Orchestrator::new(
        orchestrator_config,
        cloudformation::Backend::new(&sdk),
        s3::Store::new(&sdk, bucket),
    );

    let journal = Journal::new(launcher_directory());
    for record in journal.list()? {
        orchestrator.restore(record);
    }
    Ok((config, orchestrator, journal))
}

fn parse_name(name: &str) -> Result<ChildStackName, Error> {
    ChildStackName::parse(name).ok_or_else(|| Error::UnknownDeployment(name.to_string()))
}

fn save(journal: &Journal, record: &DeploymentRecord) {
    if let Err(e) = journal.save(record) {
        warn!(name = record.name.as_str(), error = ?e, "failed to persist record");
    }
}

/// Submits a request and waits for a terminal status.
pub async fn launch(path: &Path, overrides: Overrides, launch: Launch) -> Result<Outcome, Error> {
    let (config, orchestrator, journal) = setup(path, overrides).await?;
    let mut request = ProvisionRequest::new(launch.inbound_cidr, launch.key_pair_name);
    if let Some(id) = launch.request_id {
        request = request.with_id(RequestId::new(id));
    }
    info!(request = request.id.as_str(), "launching");

    let record = orchestrator.submit(request).await?;
    save(&journal, &record);
    let timeout = launch.timeout.unwrap_or_else(|| config.timeout());
    let result = orchestrator.await_terminal(&record.name, timeout).await;
    if let Some(record) = orchestrator.record(&record.name) {
        save(&journal, &record);
    }
    let record = result?;

    // Success also requires the instance to report a clean bootstrap
    let (reporter, completion) = bootstrap::channel();
    orchestrator.observe_bootstrap(&record.name, reporter).await?;
    Ok(Outcome::evaluate(&record, completion.wait().await))
}

/// Polls the status of a deployment.
pub async fn status(path: &Path, name: &str) -> Result<Outcome, Error> {
    let (_, orchestrator, journal) = setup(path, Overrides::default()).await?;
    let record = orchestrator.poll_status(&parse_name(name)?).await?;
    save(&journal, &record);
    Ok(Outcome::from_record(&record))
}

/// Cancels an in-flight deployment.
pub async fn cancel(path: &Path, name: &str) -> Result<Outcome, Error> {
    let (_, orchestrator, journal) = setup(path, Overrides::default()).await?;
    let record = orchestrator.cancel(&parse_name(name)?).await?;
    save(&journal, &record);
    Ok(Outcome::from_record(&record))
}

/// Tears down a deployment and waits for the stack to disappear.
pub async fn destroy(path: &Path, name: &str) -> Result<Outcome, Error> {
    let (config, orchestrator, journal) = setup(path, Overrides::default()).await?;
    let name = parse_name(name)?;
    let record = orchestrator.destroy(&name).await?;
    save(&journal, &record);
    let result = orchestrator.await_terminal(&name, config.timeout()).await;
    if let Some(record) = orchestrator.record(&name) {
        save(&journal, &record);
    }
    Ok(Outcome::from_record(&result?))
}

/// Lists persisted records and live stacks under the configured prefix.
pub async fn list(path: &Path) -> Result<(), Error> {
    let (_, orchestrator, _) = setup(path, Overrides::default()).await?;
    let records = orchestrator.records();
    if records.is_empty() {
        info!("no local deployments");
    }
    for record in &records {
        info!(
            name = record.name.as_str(),
            status = %record.status,
            created_at = record.created_at,
            "local deployment"
        );
    }
    for stack in orchestrator.list_remote().await? {
        info!(
            name = stack.name.as_str(),
            status = stack.status.as_str(),
            "remote stack"
        );
    }
    Ok(())
}

/// Publishes an artifact and returns its reference.
pub async fn publish(path: &Path, artifact: &Path) -> Result<TemplateReference, Error> {
    let config = Config::load(path)?;
    let bucket = config
        .bucket
        .ok_or_else(|| Error::Config("publishing requires a bucket".into()))?;
    let sdk = sdk_config(Region::new(config.identity.region)).await;
    s3::Store::new(&sdk, bucket).publish(artifact).await
}

/// Renders the permission boundary of a configuration.
pub fn policy(path: &Path) -> Result<serde_json::Value, Error> {
    let config = Config::load(path)?;
    Ok(PermissionSet::for_identity(&config.identity).policy_document())
}

/// Renders the user-data script for a bootstrap artifact.
pub fn user_data(location: &str, checksum: &str) -> Result<String, Error> {
    let artifact = TemplateReference {
        location: location.to_string(),
        checksum: checksum.to_string(),
    };
    Ok(Bootstrap::new(&artifact)?.user_data())
}
