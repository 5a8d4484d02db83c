//! AWS implementations of the deployment backend (CloudFormation) and template store (S3).

use aws_config::{retry::RetryConfig, BehaviorVersion, SdkConfig};
pub use aws_config::Region;
use std::time::Duration;

pub mod cloudformation;
pub mod commands;
pub mod s3;

/// Maximum attempts of a single SDK request (transport-level retries only).
const MAX_ATTEMPTS: u32 = 3;

/// Loads the SDK configuration for a region.
pub async fn sdk_config(region: Region) -> SdkConfig {
    let retry = RetryConfig::adaptive()
        .with_max_attempts(MAX_ATTEMPTS)
        .with_initial_backoff(Duration::from_millis(500))
        .with_max_backoff(Duration::from_secs(30));
    aws_config::defaults(BehaviorVersion::latest())
        .region(region)
        .retry_config(retry)
        .load()
        .await
}
