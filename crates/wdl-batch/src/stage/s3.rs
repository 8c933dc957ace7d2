//! Implementation of an object store backed by S3.

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::primitives::Length;
use aws_sdk_s3::types::CompletedMultipartUpload;
use aws_sdk_s3::types::CompletedPart;
use tracing::debug;
use tracing::warn;

use super::ObjectStore;
use crate::aws::display;

/// One mebibyte (MiB).
const ONE_MEBIBYTE: u64 = 1024 * 1024;

/// Files larger than this are uploaded in parts.
const MULTIPART_THRESHOLD: u64 = 64 * ONE_MEBIBYTE;

/// The smallest part of a multipart upload.
const MIN_PART_SIZE: u64 = 64 * ONE_MEBIBYTE;

/// The largest number of parts S3 accepts for one object.
const MAX_PARTS: u64 = 10_000;

/// Splits an object of the given size into the `(offset, length)` ranges of
/// its parts.
///
/// Parts are at least [`MIN_PART_SIZE`] and grow as needed to stay within
/// [`MAX_PARTS`]; only the last part may be smaller.
fn part_ranges(size: u64) -> Vec<(u64, u64)> {
    let part_size = size.div_ceil(MAX_PARTS).max(MIN_PART_SIZE);
    let mut ranges = Vec::new();
    let mut offset = 0;
    while offset < size {
        let length = part_size.min(size - offset);
        ranges.push((offset, length));
        offset += length;
    }
    ranges
}

/// Uploads files to S3.
///
/// Files above [`MULTIPART_THRESHOLD`] are uploaded with a multipart upload,
/// which is aborted if any part fails.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    /// The S3 client.
    client: Client,
}

impl S3ObjectStore {
    /// Constructs a new object store from the given SDK configuration.
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: Client::new(config),
        }
    }

    /// Uploads a file with a single request.
    async fn put_whole(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("failed to read `{path}`", path = path.display()))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| anyhow!("{}", display(&e)))?;

        Ok(())
    }

    /// Uploads a file in parts.
    async fn put_multipart(&self, bucket: &str, key: &str, path: &Path, size: u64) -> Result<()> {
        let upload = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow!("{}", display(&e)))?;
        let upload_id = upload
            .upload_id()
            .context("S3 did not return a multipart upload id")?;

        let parts = match self.put_parts(bucket, key, upload_id, path, size).await {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await
                {
                    warn!(
                        bucket,
                        key,
                        upload_id,
                        "failed to abort multipart upload: {}",
                        display(&abort)
                    );
                }
                return Err(e);
            }
        };

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| anyhow!("{}", display(&e)))?;

        Ok(())
    }

    /// Uploads the parts of a multipart upload in order.
    async fn put_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        path: &Path,
        size: u64,
    ) -> Result<Vec<CompletedPart>> {
        let ranges = part_ranges(size);
        debug!(key, parts = ranges.len(), size, "uploading file in parts");

        let mut parts = Vec::with_capacity(ranges.len());
        for (n, (offset, length)) in (1..).zip(ranges) {
            let body = ByteStream::read_from()
                .path(path)
                .offset(offset)
                .length(Length::Exact(length))
                .build()
                .await
                .with_context(|| format!("failed to read `{path}`", path = path.display()))?;

            let part = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(n)
                .body(body)
                .send()
                .await
                .map_err(|e| anyhow!("part {n}: {}", display(&e)))?;

            parts.push(
                CompletedPart::builder()
                    .part_number(n)
                    .set_e_tag(part.e_tag().map(str::to_string))
                    .build(),
            );
        }

        Ok(parts)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
        let size = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed to read `{path}`", path = path.display()))?
            .len();

        if size > MULTIPART_THRESHOLD {
            self.put_multipart(bucket, key, path, size).await
        } else {
            self.put_whole(bucket, key, path).await
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parts_cover_the_file() {
        assert_eq!(
            part_ranges(150 * ONE_MEBIBYTE),
            [
                (0, 64 * ONE_MEBIBYTE),
                (64 * ONE_MEBIBYTE, 64 * ONE_MEBIBYTE),
                (128 * ONE_MEBIBYTE, 22 * ONE_MEBIBYTE),
            ]
        );

        // A 5 TiB object still fits in the part limit
        let size = 5 * 1024 * 1024 * ONE_MEBIBYTE;
        let ranges = part_ranges(size);
        assert!(ranges.len() as u64 <= MAX_PARTS);
        assert_eq!(ranges.iter().map(|(_, len)| len).sum::<u64>(), size);
        assert!(
            ranges
                .windows(2)
                .all(|w| w[0].0 + w[0].1 == w[1].0)
        );
    }
}
