//! Content-addressed storage of the instance template and bootstrap artifacts.

use crate::Error;
use commonware_utils::hex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{future::Future, io::Read, path::Path};

/// Prefix of content-addressed keys: `templates/<sha256>/<file>`.
pub const TEMPLATE_PREFIX: &str = "templates";

/// Immutable reference to a published artifact.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateReference {
    /// Location of the artifact (`s3://bucket/key` or `https://...`).
    pub location: String,
    /// Hex-encoded SHA-256 of the artifact contents.
    pub checksum: String,
}

/// Publishes artifacts and resolves references to fetchable URLs.
pub trait TemplateStore: Send + Sync {
    /// Publishes a local artifact (a no-op if identical contents were already published).
    fn publish(&self, artifact: &Path)
        -> impl Future<Output = Result<TemplateReference, Error>> + Send;

    /// Resolves a reference to a URL the deployment backend can fetch.
    fn resolve(&self, reference: &TemplateReference)
        -> impl Future<Output = Result<String, Error>> + Send;
}

/// Computes the SHA-256 of `bytes` as a hex string.
pub fn digest(bytes: &[u8]) -> String {
    hex(&Sha256::digest(bytes))
}

/// Computes the SHA-256 of a file as a hex string.
pub fn hash_file(path: &Path) -> Result<String, Error> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hex(&hasher.finalize()))
}

/// Returns the file name of an artifact.
pub fn file_name(path: &Path) -> Result<&str, Error> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::Template(format!("invalid artifact path: {}", path.display())))
}

/// Returns the content-addressed key of an artifact.
pub fn content_key(checksum: &str, file_name: &str) -> String {
    format!("{TEMPLATE_PREFIX}/{checksum}/{file_name}")
}
