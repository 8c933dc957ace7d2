//! Staging of run outputs to object storage.
//!
//! The effective upload location of a run depends on the configured prefix:
//!
//! * `s3://bucket/out/` uploads directly beneath `out/`, overwriting the
//!   outputs of earlier runs with the same prefix.
//! * `s3://bucket/out` uploads beneath `out/<run name>/`.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use thiserror::Error;
use tracing::debug;
use tracing::error;
use tracing::info;
use url::Url;
use walkdir::WalkDir;

use crate::scratch::TASKS_DIR_NAME;

pub mod s3;

pub use s3::S3ObjectStore;

/// The default number of concurrent uploads.
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 16;

/// Represents an error staging outputs.
#[derive(Debug, Error)]
pub enum StageError {
    /// The upload prefix is not a valid `s3://` URI.
    #[error("invalid upload prefix `{prefix}`: {reason}")]
    InvalidPrefix {
        /// The configured prefix.
        prefix: String,
        /// Why the prefix is invalid.
        reason: String,
    },
    /// The run directory could not be read.
    #[error("failed to read run directory `{}`: {message}", path.display())]
    Walk {
        /// The path that could not be read.
        path: PathBuf,
        /// The error message.
        message: String,
    },
    /// A file could not be uploaded.
    #[error("failed to upload `{}` to `{uri}`: {message}", path.display())]
    Upload {
        /// The file being uploaded.
        path: PathBuf,
        /// The destination URI.
        uri: String,
        /// The error message.
        message: String,
    },
}

/// The effective upload location of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadUri {
    /// The destination bucket.
    bucket: String,
    /// The key prefix of every object; empty or ending with `/`.
    key_prefix: String,
}

impl UploadUri {
    /// Resolves the upload location of a run from a configured prefix.
    pub fn resolve(prefix: &str, run_name: &str) -> Result<Self, StageError> {
        let invalid = |reason: &str| StageError::InvalidPrefix {
            prefix: prefix.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(prefix).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "s3" {
            return Err(invalid("the URI scheme must be `s3`"));
        }

        let bucket = match url.host_str() {
            Some(bucket) if !bucket.is_empty() => bucket.to_string(),
            _ => return Err(invalid("the URI has no bucket")),
        };

        if url.query().is_some() || url.fragment().is_some() {
            return Err(invalid("the URI cannot have a query or fragment"));
        }

        // Keys are taken verbatim; the parsed path would be percent-encoded
        let path = prefix
            .split_once("://")
            .and_then(|(_, rest)| rest.split_once('/'))
            .map(|(_, path)| path.trim_start_matches('/').to_string())
            .unwrap_or_default();

        let key_prefix = if prefix.ends_with('/') {
            path
        } else if path.is_empty() {
            format!("{run_name}/")
        } else {
            format!("{path}/{run_name}/")
        };

        Ok(Self { bucket, key_prefix })
    }

    /// Gets the destination bucket.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Gets the key prefix of every object.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Gets the key of the object for a path relative to the run directory.
    pub fn key(&self, relative: &Path) -> String {
        let mut key = self.key_prefix.clone();
        for (i, component) in relative.components().enumerate() {
            if i > 0 {
                key.push('/');
            }
            key.push_str(&component.as_os_str().to_string_lossy());
        }
        key
    }

    /// Gets the URI of the object for a path relative to the run directory.
    pub fn object_uri(&self, relative: &Path) -> String {
        format!("s3://{bucket}/{key}", bucket = self.bucket, key = self.key(relative))
    }
}

impl fmt::Display for UploadUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "s3://{bucket}/{prefix}",
            bucket = self.bucket,
            prefix = self.key_prefix
        )
    }
}

/// An object store that files are uploaded to.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads a local file as the given object.
    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()>;
}

/// The outcome of staging a run.
#[derive(Debug, Default)]
pub struct StageReport {
    /// The URIs of the uploaded objects.
    pub uploaded: Vec<String>,
    /// The files that failed to upload.
    pub failed: Vec<StageError>,
}

impl StageReport {
    /// Determines if every file was uploaded.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Uploads the files of a run directory.
pub struct OutputStager {
    /// The store receiving the files.
    store: Arc<dyn ObjectStore>,
    /// The maximum number of concurrent uploads.
    concurrency: usize,
}

impl OutputStager {
    /// Constructs a new stager.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            concurrency: DEFAULT_UPLOAD_CONCURRENCY,
        }
    }

    /// Sets the maximum number of concurrent uploads.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Uploads the regular files of a run directory beneath the given
    /// location, preserving their relative paths.
    ///
    /// The scratch directories of task attempts are not uploaded. Failed
    /// uploads are collected in the report rather than returned as errors.
    pub async fn stage(&self, run_dir: &Path, uri: &UploadUri) -> Result<StageReport, StageError> {
        let files = collect_files(run_dir)?;
        info!(files = files.len(), destination = %uri, "staging run outputs");

        let results = stream::iter(files)
            .map(|relative| async move {
                let path = run_dir.join(&relative);
                let key = uri.key(&relative);
                let object = uri.object_uri(&relative);
                match self.store.put_file(uri.bucket(), &key, &path).await {
                    Ok(()) => {
                        debug!(path = %path.display(), object, "uploaded file");
                        Ok(object)
                    }
                    Err(e) => Err(StageError::Upload {
                        path,
                        uri: object,
                        message: format!("{e:#}"),
                    }),
                }
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut report = StageReport::default();
        for result in results {
            match result {
                Ok(object) => report.uploaded.push(object),
                Err(e) => {
                    error!("{e}");
                    report.failed.push(e);
                }
            }
        }

        report.uploaded.sort();
        Ok(report)
    }
}

/// Collects the paths, relative to the run directory, of the files to stage.
fn collect_files(run_dir: &Path) -> Result<Vec<PathBuf>, StageError> {
    let mut files = Vec::new();
    let walker = WalkDir::new(run_dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && e.file_name() == TASKS_DIR_NAME));

    for entry in walker {
        let entry = entry.map_err(|e| StageError::Walk {
            path: e.path().unwrap_or(run_dir).to_path_buf(),
            message: e.to_string(),
        })?;

        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(run_dir)
            .map_err(|e| StageError::Walk {
                path: entry.path().to_path_buf(),
                message: e.to_string(),
            })?;
        files.push(relative.to_path_buf());
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Mutex;

    use anyhow::bail;
    use pretty_assertions::assert_eq;

    use super::*;

    const RUN: &str = "run-20240101_120000";

    #[test]
    fn direct_prefix() {
        let uri = UploadUri::resolve("s3://bucket/out/", RUN).unwrap();
        assert_eq!(
            uri.object_uri(Path::new("out/result.txt")),
            "s3://bucket/out/out/result.txt"
        );
        assert_eq!(uri.to_string(), "s3://bucket/out/");
    }

    #[test]
    fn run_name_prefix() {
        let uri = UploadUri::resolve("s3://bucket/out", RUN).unwrap();
        assert_eq!(
            uri.object_uri(Path::new("outputs.json")),
            "s3://bucket/out/run-20240101_120000/outputs.json"
        );

        let uri = UploadUri::resolve("s3://bucket", RUN).unwrap();
        assert_eq!(uri.key_prefix(), "run-20240101_120000/");
    }

    #[test]
    fn prefix_keys_are_literal() {
        let uri = UploadUri::resolve("s3://bucket/100%/a%20b", RUN).unwrap();
        assert_eq!(uri.key_prefix(), "100%/a%20b/run-20240101_120000/");

        let uri = UploadUri::resolve("s3://bucket/my outputs/", RUN).unwrap();
        assert_eq!(uri.key_prefix(), "my outputs/");
    }

    #[test]
    fn invalid_prefixes() {
        assert!(UploadUri::resolve("https://bucket/out", RUN).is_err());
        assert!(UploadUri::resolve("out/", RUN).is_err());
    }

    /// Records uploads, failing for files named `bad`.
    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl ObjectStore for Recorder {
        async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<()> {
            if path.file_name().is_some_and(|n| n == "bad") {
                bail!("access denied");
            }
            self.0.lock().unwrap().push(format!("{bucket}:{key}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn stages_files_but_not_scratch() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("out/nested")).unwrap();
        fs::create_dir_all(dir.path().join("tasks/call-a/0/work")).unwrap();
        fs::write(dir.path().join("outputs.json"), "{}").unwrap();
        fs::write(dir.path().join("out/nested/a.txt"), "a").unwrap();
        fs::write(dir.path().join("out/bad"), "b").unwrap();
        fs::write(dir.path().join("tasks/call-a/0/stdout.txt"), "").unwrap();

        let store = Arc::new(Recorder::default());
        let stager = OutputStager::new(store.clone()).with_concurrency(2);
        let uri = UploadUri::resolve("s3://bucket/prefix", "run").unwrap();
        let report = stager.stage(dir.path(), &uri).await.unwrap();

        assert_eq!(
            report.uploaded,
            [
                "s3://bucket/prefix/run/out/nested/a.txt",
                "s3://bucket/prefix/run/outputs.json"
            ]
        );
        assert_eq!(report.failed.len(), 1);
        assert!(!report.is_complete());

        let mut keys = store.0.lock().unwrap().clone();
        keys.sort();
        assert_eq!(
            keys,
            ["bucket:prefix/run/out/nested/a.txt", "bucket:prefix/run/outputs.json"]
        );
    }
}
