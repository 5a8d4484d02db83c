//! Persist deployment records across invocations.
//!
//! Each record is stored as YAML in `<directory>/<name>.yaml`, so later invocations
//! (`status`, `cancel`, `destroy`) can pick up where `launch` left off.

use crate::{naming::ChildStackName, orchestrator::DeploymentRecord, Error};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};
use tracing::debug;

/// Directory (under `$HOME`) records are persisted to by default.
pub const LAUNCHER_DIRECTORY: &str = ".commonware_launcher";

const EXTENSION: &str = "yaml";

/// Returns the default journal directory.
pub fn launcher_directory() -> PathBuf {
    let base = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(base).join(LAUNCHER_DIRECTORY)
}

/// A directory of persisted [DeploymentRecord]s.
#[derive(Clone, Debug)]
pub struct Journal {
    directory: PathBuf,
}

impl Journal {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path(&self, name: &str) -> Result<PathBuf, Error> {
        if !ChildStackName::is_well_formed(name) {
            return Err(Error::UnknownDeployment(name.to_string()));
        }
        Ok(self.directory.join(format!("{name}.{EXTENSION}")))
    }

    /// Persists a record, replacing any previous version.
    pub fn save(&self, record: &DeploymentRecord) -> Result<(), Error> {
        fs::create_dir_all(&self.directory)?;
        let path = self.path(record.name.as_str())?;
        let tmp = path.with_extension("tmp");
        serde_yaml::to_writer(File::create(&tmp)?, record)?;
        fs::rename(&tmp, &path)?;
        debug!(name = record.name.as_str(), path = ?path, "persisted record");
        Ok(())
    }

    /// Loads the record for `name`.
    pub fn load(&self, name: &str) -> Result<DeploymentRecord, Error> {
        let path = self.path(name)?;
        if !path.exists() {
            return Err(Error::UnknownDeployment(name.to_string()));
        }
        let record = serde_yaml::from_reader(File::open(&path)?)?;
        Ok(record)
    }

    /// Loads every persisted record, newest first.
    pub fn list(&self) -> Result<Vec<DeploymentRecord>, Error> {
        if !self.directory.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let record: DeploymentRecord = serde_yaml::from_reader(File::open(&path)?)?;
            records.push(record);
        }
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks,
        naming::Prefix,
        orchestrator::{Config, Orchestrator, Status},
        config::Identity,
        template::TemplateReference,
        ProvisionRequest,
    };
    use std::{collections::BTreeMap, time::Duration};

    async fn record() -> DeploymentRecord {
        let config = Config {
            identity: Identity {
                account: "123456789012".into(),
                region: "us-east-1".into(),
            },
            prefix: Prefix::new("ec2-inst").unwrap(),
            template: TemplateReference {
                location: "https://example.com/t.yaml".into(),
                checksum: "abc".into(),
            },
            poll_interval: Duration::from_secs(1),
            tags: BTreeMap::new(),
        };
        let templates = mocks::Templates::with(&config.template);
        let orchestrator = Orchestrator::new(config, mocks::Backend::default(), templates);
        orchestrator
            .submit(ProvisionRequest::new("203.0.113.0/24", "demo-key"))
            .await
            .unwrap()
    }

    fn journal() -> Journal {
        Journal::new(std::env::temp_dir().join(format!("launcher-{}", uuid::Uuid::new_v4())))
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let journal = journal();
        assert!(journal.list().unwrap().is_empty());

        let mut record = record().await;
        journal.save(&record).unwrap();
        assert_eq!(journal.load(record.name.as_str()).unwrap(), record);

        record.status = Status::Succeeded;
        journal.save(&record).unwrap();
        let records = journal.list().unwrap();
        assert_eq!(records, vec![record.clone()]);

        fs::remove_dir_all(journal.directory()).unwrap();
    }

    #[tokio::test]
    async fn test_rejects_unknown_names() {
        let journal = journal();
        assert!(matches!(
            journal.load("ec2-inst-missing"),
            Err(Error::UnknownDeployment(_))
        ));
        assert!(matches!(
            journal.load("../../etc/passwd"),
            Err(Error::UnknownDeployment(_))
        ));
    }
}
