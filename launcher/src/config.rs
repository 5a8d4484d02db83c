//! Launcher configuration.

use crate::{
    naming::Prefix,
    orchestrator,
    template::TemplateReference,
    Error,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs::File, path::Path, time::Duration};

/// Default interval between status polls.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Default time to wait for a deployment to reach a terminal status.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30 * 60;

/// Account and region the orchestrator operates in.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub account: String,
    pub region: String,
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Launcher configuration (loaded from YAML).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub identity: Identity,
    pub prefix: String,
    pub template: TemplateReference,
    /// Bucket artifacts are published to.
    pub bucket: Option<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra tags applied to every child stack.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Config {
    /// Loads a configuration file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        let config: Self = serde_yaml::from_reader(file)?;
        Ok(config)
    }

    /// Returns the time to wait for a terminal status.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Converts into the orchestrator configuration.
    pub fn orchestrator(&self) -> Result<orchestrator::Config, Error> {
        if self.poll_interval_secs == 0 {
            return Err(Error::Config("poll_interval_secs must be positive".into()));
        }
        if self.identity.account.is_empty() || self.identity.region.is_empty() {
            return Err(Error::Config("identity requires an account and region".into()));
        }
        Ok(orchestrator::Config {
            identity: self.identity.clone(),
            prefix: Prefix::new(self.prefix.clone())?,
            template: self.template.clone(),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            tags: self.tags.clone(),
        })
    }
}
