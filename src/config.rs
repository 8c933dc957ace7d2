//! Implementation of the configuration module.

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use wdl_batch::BatchConfig;

/// Represents the configuration for the `sprocket-batch` tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// Batch execution configuration.
    #[serde(default)]
    pub batch: BatchConfig,
}

impl Config {
    /// Reads a configuration file from the specified path.
    pub fn read_config(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| {
            format!(
                "failed to read configuration file `{path}`",
                path = path.display()
            )
        })?;

        toml::from_str(&text).with_context(|| {
            format!(
                "failed to parse configuration file `{path}`",
                path = path.display()
            )
        })
    }

    /// Loads the configuration from the given file or returns the default
    /// configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::read_config(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use wdl_batch::scratch::CleanupPolicy;

    use super::*;

    #[test]
    fn reads_batch_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sprocket-batch.toml");
        std::fs::write(
            &path,
            r#"
[batch]
task_queue = "tasks"
fsap = "fsap-1234"
cleanup = "never"

[batch.tags]
project = "demo"

[batch.retry]
max_retries = 3
"#,
        )
        .unwrap();

        let config = Config::read_config(&path).unwrap();
        assert_eq!(config.batch.task_queue.as_deref(), Some("tasks"));
        assert_eq!(config.batch.cleanup, CleanupPolicy::Never);
        assert_eq!(config.batch.tags["project"], "demo");
        assert_eq!(config.batch.retry.max_retries(), 3);
        config.batch.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sprocket-batch.toml");
        std::fs::write(&path, "[batch]\nqueue = \"tasks\"\n").unwrap();

        let err = Config::read_config(&path).unwrap_err();
        assert!(format!("{err:?}").contains("unknown field"), "{err:?}");
    }
}
