//! Coordination of scratch space on the shared filesystem.
//!
//! Every task attempt of a run is assigned its own directory:
//!
//! ```text
//! <runs dir>/
//! ├─ <run name>/
//! │  ├─ tasks/
//! │  │  ├─ <encoded task id>/
//! │  │  │  ├─ 0/             # First attempt
//! │  │  │  │  ├─ work/       # Working directory of the attempt
//! │  │  │  │  ├─ command     # The evaluated command
//! │  │  │  │  ├─ stdout.txt  # The standard output of the attempt
//! │  │  │  │  ├─ stderr.txt  # The standard error of the attempt
//! │  │  │  ├─ 1/             # Second attempt (first retry)
//! ```
//!
//! The task id is encoded into exactly one path segment and the attempt
//! number forms the next, so two distinct attempts can never be assigned
//! overlapping directories and no locking is needed.

use std::fmt;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use crate::job::JobState;

/// The name of the directory, within a run directory, holding task attempts.
pub const TASKS_DIR_NAME: &str = "tasks";

/// The name of the working directory of an attempt.
pub const WORK_DIR_NAME: &str = "work";

/// The name of the command file of an attempt.
pub const COMMAND_FILE_NAME: &str = "command";

/// The name of the stdout file of an attempt.
pub const STDOUT_FILE_NAME: &str = "stdout.txt";

/// The name of the stderr file of an attempt.
pub const STDERR_FILE_NAME: &str = "stderr.txt";

/// When the scratch directory of a task attempt (or a run directory) is
/// deleted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// The directory is always retained.
    Never,
    /// The directory is deleted after success and retained for diagnosis
    /// after failure.
    #[default]
    Success,
    /// The directory is deleted after failure.
    Failure,
    /// The directory is always deleted.
    Always,
}

impl CleanupPolicy {
    /// Determines if a directory should be deleted after the given outcome.
    pub fn applies(self, succeeded: bool) -> bool {
        match self {
            Self::Never => false,
            Self::Success => succeeded,
            Self::Failure => !succeeded,
            Self::Always => true,
        }
    }
}

impl fmt::Display for CleanupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => write!(f, "never"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Always => write!(f, "always"),
        }
    }
}

impl FromStr for CleanupPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(Self::Never),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "always" => Ok(Self::Always),
            _ => Err(format!(
                "unknown cleanup policy `{s}` (expected `never`, `success`, `failure` or `always`)"
            )),
        }
    }
}

/// The scratch directory of one task attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchPath {
    /// The root of the attempt's directory.
    root: PathBuf,
    /// The attempt number.
    attempt: u64,
}

impl ScratchPath {
    /// Gets the root of the attempt's directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Gets the attempt number.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Gets the working directory of the attempt.
    pub fn work_dir(&self) -> PathBuf {
        self.root.join(WORK_DIR_NAME)
    }

    /// Gets the command file path.
    pub fn command(&self) -> PathBuf {
        self.root.join(COMMAND_FILE_NAME)
    }

    /// Gets the stdout file path.
    pub fn stdout(&self) -> PathBuf {
        self.root.join(STDOUT_FILE_NAME)
    }

    /// Gets the stderr file path.
    pub fn stderr(&self) -> PathBuf {
        self.root.join(STDERR_FILE_NAME)
    }

    /// Determines if this path and another overlap (one contains the other).
    pub fn overlaps(&self, other: &Self) -> bool {
        self.root.starts_with(&other.root) || other.root.starts_with(&self.root)
    }
}

/// Assigns disjoint scratch directories to task attempts.
#[derive(Debug, Clone)]
pub struct ScratchCoordinator {
    /// The directory holding run directories.
    runs_dir: PathBuf,
    /// The cleanup policy of task attempts.
    policy: CleanupPolicy,
}

impl ScratchCoordinator {
    /// Constructs a new coordinator for the given runs directory.
    pub fn new(runs_dir: impl Into<PathBuf>, policy: CleanupPolicy) -> Self {
        Self {
            runs_dir: runs_dir.into(),
            policy,
        }
    }

    /// Gets the directory of the given run.
    pub fn run_dir(&self, run_name: &str) -> PathBuf {
        self.runs_dir.join(encode_segment(run_name))
    }

    /// Derives the scratch path of a task attempt without touching the
    /// filesystem.
    pub fn path(&self, run_name: &str, task_id: &str, attempt: u64) -> ScratchPath {
        let mut root = self.run_dir(run_name);
        root.push(TASKS_DIR_NAME);
        root.push(encode_segment(task_id));
        root.push(attempt.to_string());
        ScratchPath { root, attempt }
    }

    /// Assigns the scratch path of a task attempt, creating its working
    /// directory.
    pub fn assign(&self, run_name: &str, task_id: &str, attempt: u64) -> Result<ScratchPath> {
        let path = self.path(run_name, task_id, attempt);
        let work_dir = path.work_dir();
        fs::create_dir_all(&work_dir).with_context(|| {
            format!(
                "failed to create directory `{path}`",
                path = work_dir.display()
            )
        })?;

        debug!(path = %path.root.display(), task_id, attempt, "assigned scratch path");
        Ok(path)
    }

    /// Applies the cleanup policy to a task attempt that reached the given
    /// terminal state.
    ///
    /// Returns `true` if the directory was deleted. Failure to delete is
    /// logged and otherwise ignored.
    pub fn cleanup(&self, path: &ScratchPath, state: JobState) -> bool {
        if !state.is_terminal() || !self.policy.applies(state == JobState::Succeeded) {
            return false;
        }

        match fs::remove_dir_all(&path.root) {
            Ok(()) => {
                debug!(path = %path.root.display(), "removed scratch path");
                true
            }
            Err(e) => {
                warn!(
                    path = %path.root.display(),
                    error = %e,
                    "failed to remove scratch path"
                );
                false
            }
        }
    }
}

/// Encodes a string into a single path segment.
///
/// Everything outside `[A-Za-z0-9_-]` is percent-encoded (including `.` so
/// that `.` and `..` cannot occur), which makes the encoding injective.
fn encode_segment(s: &str) -> String {
    if s.is_empty() {
        return "%".to_string();
    }

    urlencoding::encode(s)
        .replace('.', "%2E")
        .replace('~', "%7E")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn layout() {
        let coordinator = ScratchCoordinator::new("/mnt/efs/runs", CleanupPolicy::default());
        let path = coordinator.path("20240101_120000_hello", "call-greet", 2);
        assert_eq!(
            path.root(),
            Path::new("/mnt/efs/runs/20240101_120000_hello/tasks/call-greet/2")
        );
        assert_eq!(
            path.stdout(),
            Path::new("/mnt/efs/runs/20240101_120000_hello/tasks/call-greet/2/stdout.txt")
        );
    }

    #[test]
    fn task_ids_encode_to_one_segment() {
        assert_eq!(encode_segment("a/b"), "a%2Fb");
        assert_eq!(encode_segment(".."), "%2E%2E");
        assert_eq!(encode_segment("a.b"), "a%2Eb");
        assert_ne!(encode_segment("a/b"), encode_segment("a%2Fb"));
    }

    #[test]
    fn policies() {
        assert!(!CleanupPolicy::Never.applies(true));
        assert!(CleanupPolicy::Success.applies(true));
        assert!(!CleanupPolicy::Success.applies(false));
        assert!(CleanupPolicy::Failure.applies(false));
        assert!(CleanupPolicy::Always.applies(false));

        for policy in ["never", "success", "failure", "always"] {
            assert_eq!(policy.parse::<CleanupPolicy>().unwrap().to_string(), policy);
        }
        assert!("sometimes".parse::<CleanupPolicy>().is_err());
    }

    #[test]
    fn concurrent_assignments_are_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Arc::new(ScratchCoordinator::new(dir.path(), CleanupPolicy::Never));

        let ids = ["a", "a/0", "a.0", "b", "a%2F0", "call-x", "call-x-1", ""];
        let handles = ids
            .iter()
            .flat_map(|id| (0..3).map(move |attempt| (id.to_string(), attempt)))
            .map(|(id, attempt)| {
                let coordinator = coordinator.clone();
                std::thread::spawn(move || coordinator.assign("run", &id, attempt).unwrap())
            })
            .collect::<Vec<_>>();

        let paths = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>();

        for (i, a) in paths.iter().enumerate() {
            assert!(a.work_dir().is_dir());
            for b in &paths[i + 1..] {
                assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn cleanup_follows_policy() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = ScratchCoordinator::new(dir.path(), CleanupPolicy::Success);

        let succeeded = coordinator.assign("run", "ok", 0).unwrap();
        let failed = coordinator.assign("run", "bad", 0).unwrap();

        assert!(coordinator.cleanup(&succeeded, JobState::Succeeded));
        assert!(!coordinator.cleanup(&failed, JobState::Failed));
        assert!(!succeeded.root().exists());
        assert!(failed.root().exists());
    }
}
