//! S3 template store for launcher artifacts.

use crate::{
    template::{self, TemplateReference, TemplateStore},
    Error,
};
use aws_config::SdkConfig;
use aws_sdk_s3::{
    operation::head_object::HeadObjectError, primitives::ByteStream, Client as S3Client,
};
use std::{fmt, path::Path};
use tracing::{debug, info};

/// S3 operations that can fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    HeadObject,
    PutObject,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::HeadObject => write!(f, "HeadObject"),
            Operation::PutObject => write!(f, "PutObject"),
        }
    }
}

/// Splits an `s3://bucket/key` location.
pub fn parse_location(location: &str) -> Option<(&str, &str)> {
    let (bucket, key) = location.strip_prefix("s3://")?.split_once('/')?;
    if bucket.is_empty() || key.is_empty() {
        return None;
    }
    Some((bucket, key))
}

/// Returns the virtual-hosted URL of an object.
pub fn object_url(bucket: &str, region: &str, key: &str) -> String {
    format!("https://{bucket}.s3.{region}.amazonaws.com/{key}")
}

/// Checks if an object exists in S3
pub async fn object_exists(client: &S3Client, bucket: &str, key: &str) -> Result<bool, Error> {
    match client.head_object().bucket(bucket).key(key).send().await {
        Ok(_) => Ok(true),
        Err(e) => {
            let service_err = e.into_service_error();
            if matches!(service_err, HeadObjectError::NotFound(_)) {
                Ok(false)
            } else {
                Err(Error::AwsS3 {
                    bucket: bucket.to_string(),
                    operation: Operation::HeadObject,
                    source: Box::new(aws_sdk_s3::Error::from(service_err)),
                })
            }
        }
    }
}

/// Uploads a file to S3
pub async fn upload_file(
    client: &S3Client,
    bucket: &str,
    key: &str,
    path: &Path,
) -> Result<(), Error> {
    let body = ByteStream::from_path(path)
        .await
        .map_err(std::io::Error::other)?;

    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(body)
        .send()
        .await
        .map_err(|e| Error::AwsS3 {
            bucket: bucket.to_string(),
            operation: Operation::PutObject,
            source: Box::new(aws_sdk_s3::Error::from(e.into_service_error())),
        })?;

    debug!(bucket = bucket, key = key, "uploaded file to S3");
    Ok(())
}

/// A [TemplateStore] backed by an S3 bucket.
///
/// Artifacts are stored under content-addressed keys (`templates/<sha256>/<file>`), so a
/// published artifact is never overwritten.
#[derive(Clone)]
pub struct Store {
    client: S3Client,
    bucket: String,
    region: String,
}

impl Store {
    pub fn new(config: &SdkConfig, bucket: impl Into<String>) -> Self {
        let region = config
            .region()
            .map(|region| region.to_string())
            .unwrap_or_else(|| "us-east-1".to_string());
        Self {
            client: S3Client::new(config),
            bucket: bucket.into(),
            region,
        }
    }
}

impl TemplateStore for Store {
    async fn publish(&self, artifact: &Path) -> Result<TemplateReference, Error> {
        let checksum = template::hash_file(artifact)?;
        let key = template::content_key(&checksum, template::file_name(artifact)?);
        if object_exists(&self.client, &self.bucket, &key).await? {
            debug!(key = key.as_str(), "artifact already published");
        } else {
            upload_file(&self.client, &self.bucket, &key, artifact).await?;
            info!(bucket = self.bucket.as_str(), key = key.as_str(), "published artifact");
        }
        Ok(TemplateReference {
            location: format!("s3://{}/{key}", self.bucket),
            checksum,
        })
    }

    async fn resolve(&self, reference: &TemplateReference) -> Result<String, Error> {
        if reference.location.starts_with("https://") {
            return Ok(reference.location.clone());
        }
        let (bucket, key) = parse_location(&reference.location).ok_or_else(|| {
            Error::Template(format!("unsupported location: {}", reference.location))
        })?;
        if !object_exists(&self.client, bucket, key).await? {
            return Err(Error::Template(format!(
                "artifact not published: {}",
                reference.location
            )));
        }
        Ok(object_url(bucket, &self.region, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_location() {
        assert_eq!(
            parse_location("s3://bucket/templates/abc/t.yaml"),
            Some(("bucket", "templates/abc/t.yaml"))
        );
        assert_eq!(parse_location("s3://bucket"), None);
        assert_eq!(parse_location("s3://bucket/"), None);
        assert_eq!(parse_location("https://bucket/key"), None);
    }

    #[test]
    fn test_object_url() {
        assert_eq!(
            object_url("bucket", "us-west-2", "templates/abc/t.yaml"),
            "https://bucket.s3.us-west-2.amazonaws.com/templates/abc/t.yaml"
        );
    }
}
