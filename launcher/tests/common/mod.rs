use commonware_launcher::{
    config::Identity,
    mocks,
    naming::Prefix,
    orchestrator::Config,
    template::TemplateReference,
    Orchestrator,
};
use std::{collections::BTreeMap, time::Duration};

pub const PREFIX: &str = "ec2-inst";

pub type MockOrchestrator = Orchestrator<mocks::Backend, mocks::Templates>;

pub fn config() -> Config {
    Config {
        identity: Identity {
            account: "123456789012".to_string(),
            region: "us-east-1".to_string(),
        },
        prefix: Prefix::new(PREFIX).unwrap(),
        template: TemplateReference {
            location: "s3://launcher-artifacts/templates/0f1e/ec2-instance.yaml".to_string(),
            checksum: "0f1e".to_string(),
        },
        poll_interval: Duration::from_secs(5),
        tags: BTreeMap::new(),
    }
}

pub fn orchestrator(backend: mocks::Backend) -> MockOrchestrator {
    let config = config();
    let templates = mocks::Templates::with(&config.template);
    Orchestrator::new(config, backend, templates)
}
