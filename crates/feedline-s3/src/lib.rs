//! S3-compatible [`RemoteStore`] for shard offload
//!
//! Calls are async in the SDK and bridged onto the shared runtime, so the
//! offload mover's upload threads can use the store synchronously.

use std::path::Path;

use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client;

use feedline_core::offload::{OffloadError, RemoteStore};
use feedline_core::SHARED_RUNTIME;

/// Region that rejects an explicit location constraint on bucket creation
const DEFAULT_REGION: &str = "us-east-1";

/// Connection settings for [`S3Store`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct S3Config {
    pub bucket: String,
    /// Falls back to the AWS environment/profile chain when unset
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services (MinIO, R2, ...)
    pub endpoint: Option<String>,
    /// Path-style addressing, required by most self-hosted services
    pub path_style: bool,
}

pub struct S3Store {
    client: Client,
    bucket: String,
    region: Option<String>,
}

impl std::fmt::Debug for S3Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl S3Store {
    /// Build a client from the AWS credential chain plus `config` overrides.
    pub fn new(config: S3Config) -> Self {
        let sdk_config = SHARED_RUNTIME.block_on(async {
            let mut loader = aws_config::defaults(BehaviorVersion::latest());
            if let Some(region) = &config.region {
                loader = loader.region(Region::new(region.clone()));
            }
            loader.load().await
        });

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        let region = config
            .region
            .or_else(|| sdk_config.region().map(|r| r.to_string()));

        log::debug!(
            "S3 client for bucket {} (region {:?}, endpoint {:?})",
            config.bucket,
            region,
            config.endpoint
        );
        Self::from_client(Client::from_conf(builder.build()), config.bucket, region)
    }

    pub fn from_client(client: Client, bucket: impl Into<String>, region: Option<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            region,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn create_bucket_configuration(&self) -> Option<CreateBucketConfiguration> {
        let region = self.region.as_deref()?;
        if region == DEFAULT_REGION {
            return None;
        }
        Some(
            CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(region))
                .build(),
        )
    }
}

fn remote_error(action: &str, target: &str, e: impl std::error::Error) -> OffloadError {
    OffloadError::Remote(format!("{action} {target}: {}", DisplayErrorContext(e)))
}

impl RemoteStore for S3Store {
    fn describe(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    fn ensure_container(&self) -> Result<(), OffloadError> {
        SHARED_RUNTIME.block_on(async {
            let head = self.client.head_bucket().bucket(&self.bucket).send().await;
            let err = match head {
                Ok(_) => return Ok(()),
                Err(e) => e,
            };
            if !err.as_service_error().is_some_and(|e| e.is_not_found()) {
                return Err(remote_error("check bucket", &self.bucket, err));
            }

            log::info!("Creating bucket {}", self.bucket);
            let created = self
                .client
                .create_bucket()
                .bucket(&self.bucket)
                .set_create_bucket_configuration(self.create_bucket_configuration())
                .send()
                .await;
            match created {
                Ok(_) => Ok(()),
                Err(e)
                    if e
                        .as_service_error()
                        .is_some_and(|e| e.is_bucket_already_owned_by_you()) =>
                {
                    Ok(())
                }
                Err(e) => Err(remote_error("create bucket", &self.bucket, e)),
            }
        })
    }

    fn put_file(&self, local: &Path, key: &str) -> Result<(), OffloadError> {
        SHARED_RUNTIME.block_on(async {
            let body = ByteStream::from_path(local)
                .await
                .map_err(|e| remote_error("read", &local.display().to_string(), e))?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .content_type("application/x-ndjson")
                .body(body)
                .send()
                .await
                .map_err(|e| remote_error("upload to", &self.describe(key), e))?;
            Ok(())
        })
    }

    fn object_size(&self, key: &str) -> Result<u64, OffloadError> {
        let len = SHARED_RUNTIME.block_on(async {
            self.client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| remote_error("stat", &self.describe(key), e))
                .map(|resp| resp.content_length())
        })?;
        len.and_then(|n| u64::try_from(n).ok()).ok_or_else(|| {
            OffloadError::Remote(format!("{} reported no content length", self.describe(key)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_store(region: Option<&str>) -> S3Store {
        let conf = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.unwrap_or(DEFAULT_REGION).to_string()))
            .build();
        S3Store::from_client(
            Client::from_conf(conf),
            "feedline-test",
            region.map(str::to_string),
        )
    }

    #[test]
    fn describe_uses_s3_uri() {
        let store = offline_store(None);
        assert_eq!(
            store.describe("run_2024-01-01_00:00:00/events-shard-1.jsonl"),
            "s3://feedline-test/run_2024-01-01_00:00:00/events-shard-1.jsonl"
        );
        assert_eq!(store.bucket(), "feedline-test");
    }

    #[test]
    fn location_constraint_only_outside_default_region() {
        assert!(offline_store(None).create_bucket_configuration().is_none());
        assert!(offline_store(Some(DEFAULT_REGION))
            .create_bucket_configuration()
            .is_none());
        let conf = offline_store(Some("eu-west-1"))
            .create_bucket_configuration()
            .unwrap();
        assert_eq!(
            conf.location_constraint(),
            Some(&BucketLocationConstraint::from("eu-west-1"))
        );
    }
}
