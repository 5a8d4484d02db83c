//! In-memory template store.

use crate::{
    template::{self, TemplateReference, TemplateStore},
    Error,
};
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
};

/// Bucket published artifacts are addressed under.
pub const BUCKET: &str = "launcher-artifacts";

/// A template store that keeps published artifacts in memory.
///
/// `s3://` locations resolve to their virtual-hosted `https://` URL. Clones share state.
#[derive(Clone, Default)]
pub struct Templates {
    artifacts: Arc<Mutex<HashMap<String, String>>>,
}

impl Templates {
    /// Creates a store that already holds `reference`.
    pub fn with(reference: &TemplateReference) -> Self {
        let templates = Self::default();
        templates.insert(reference);
        templates
    }

    /// Registers a published artifact.
    pub fn insert(&self, reference: &TemplateReference) {
        self.artifacts
            .lock()
            .unwrap()
            .insert(reference.location.clone(), reference.checksum.clone());
    }

    /// Returns the number of published artifacts.
    pub fn len(&self) -> usize {
        self.artifacts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TemplateStore for Templates {
    async fn publish(&self, artifact: &Path) -> Result<TemplateReference, Error> {
        let checksum = template::hash_file(artifact)?;
        let key = template::content_key(&checksum, template::file_name(artifact)?);
        let reference = TemplateReference {
            location: format!("s3://{BUCKET}/{key}"),
            checksum,
        };
        self.insert(&reference);
        Ok(reference)
    }

    async fn resolve(&self, reference: &TemplateReference) -> Result<String, Error> {
        let artifacts = self.artifacts.lock().unwrap();
        match artifacts.get(&reference.location) {
            Some(checksum) if *checksum == reference.checksum => {}
            _ => {
                return Err(Error::Template(format!(
                    "artifact not published: {}",
                    reference.location
                )))
            }
        }
        match reference.location.strip_prefix("s3://") {
            Some(rest) => match rest.split_once('/') {
                Some((bucket, key)) => Ok(format!("https://{bucket}.s3.amazonaws.com/{key}")),
                None => Err(Error::Template(format!(
                    "invalid location: {}",
                    reference.location
                ))),
            },
            None => Ok(reference.location.clone()),
        }
    }
}
