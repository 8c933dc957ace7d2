//! Resolution and retrieval of job logs.
//!
//! The output of every job is forwarded by the execution substrate into one
//! log group. [`LogForwarder`] resolves the stream of a job once and caches
//! it until the job is released, so engine logs can reference the stream;
//! [`LogFollower`] reads a stream incrementally for follow mode.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::job::JobHandle;
use crate::job::JobStatus;

pub mod cloudwatch;

pub use cloudwatch::CloudWatchLogs;

/// Represents an error reading a log stream.
#[derive(Debug, Clone, Error)]
#[error("failed to read log stream `{stream}`: {message}")]
pub struct LogError {
    /// The stream being read.
    pub stream: String,
    /// The error message.
    pub message: String,
}

/// An event of a log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// The unique identifier of the event.
    pub id: String,
    /// The timestamp of the event, in milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// The logged message.
    pub message: String,
}

/// A source of log events.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Fetches the events of a stream at or after `start_time`, in timestamp
    /// order.
    ///
    /// A stream that does not exist yet has no events.
    async fn fetch(
        &self,
        group: &str,
        stream: &str,
        start_time: Option<i64>,
    ) -> Result<Vec<LogEvent>, LogError>;
}

/// Identifies the log stream of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogStreamId {
    /// The log group.
    group: String,
    /// The stream name.
    stream: String,
}

impl LogStreamId {
    /// Constructs a new stream identifier.
    pub fn new(group: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            stream: stream.into(),
        }
    }

    /// Gets the log group.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Gets the stream name.
    pub fn stream(&self) -> &str {
        &self.stream
    }
}

impl fmt::Display for LogStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{group}/{stream}", group = self.group, stream = self.stream)
    }
}

/// Resolves and caches the log streams of jobs.
pub struct LogForwarder {
    /// The log group of every stream.
    group: String,
    /// The source for reading streams.
    source: Arc<dyn LogSource>,
    /// The resolved streams, keyed by job id.
    streams: Mutex<HashMap<String, LogStreamId>>,
}

impl LogForwarder {
    /// Constructs a new forwarder for the given log group.
    pub fn new(group: impl Into<String>, source: Arc<dyn LogSource>) -> Self {
        Self {
            group: group.into(),
            source,
            streams: Default::default(),
        }
    }

    /// Gets the log group of the forwarder.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Resolves the log stream of a job.
    ///
    /// The first resolution is taken from the stream name reported in the
    /// job's status and cached; later resolutions return the cached
    /// identifier regardless of the status. Returns `None` while the
    /// scheduler has not reported a stream.
    pub fn resolve(&self, handle: &JobHandle, status: &JobStatus) -> Option<LogStreamId> {
        let mut streams = self.streams.lock().expect("failed to lock log streams");
        if let Some(id) = streams.get(handle.id()) {
            return Some(id.clone());
        }

        let id = LogStreamId::new(&self.group, status.log_stream.as_deref()?);
        debug!(job_id = %handle, stream = %id, "resolved log stream");
        streams.insert(handle.id().to_string(), id.clone());
        Some(id)
    }

    /// Forgets the cached stream of a job that is no longer tracked.
    pub fn forget(&self, handle: &JobHandle) {
        self.streams
            .lock()
            .expect("failed to lock log streams")
            .remove(handle.id());
    }

    /// Gets the number of jobs with a cached stream.
    pub fn cached(&self) -> usize {
        self.streams.lock().expect("failed to lock log streams").len()
    }

    /// Creates a follower of the given stream.
    pub fn follow(&self, stream: LogStreamId) -> LogFollower {
        LogFollower::new(self.source.clone(), stream)
    }
}

/// Reads a log stream incrementally.
///
/// The follower remembers the newest timestamp it delivered and the ids of
/// the events at that timestamp. Each read resumes from that timestamp and
/// drops the events already delivered, so a failed read can simply be
/// retried and every event is delivered in order exactly once per follower.
pub struct LogFollower {
    /// The source of the stream.
    source: Arc<dyn LogSource>,
    /// The stream being followed.
    stream: LogStreamId,
    /// The newest delivered timestamp.
    newest: Option<i64>,
    /// The ids of the delivered events at the newest timestamp.
    seen: HashSet<String>,
}

impl LogFollower {
    /// Constructs a follower reading the stream from its beginning.
    pub fn new(source: Arc<dyn LogSource>, stream: LogStreamId) -> Self {
        Self {
            source,
            stream,
            newest: None,
            seen: HashSet::new(),
        }
    }

    /// Gets the followed stream.
    pub fn stream(&self) -> &LogStreamId {
        &self.stream
    }

    /// Reads the events appended since the last read.
    ///
    /// On error nothing is consumed.
    pub async fn next_batch(&mut self) -> Result<Vec<LogEvent>, LogError> {
        let events = self
            .source
            .fetch(&self.stream.group, &self.stream.stream, self.newest)
            .await?;

        let mut fresh = Vec::with_capacity(events.len());
        for event in events {
            match self.newest {
                Some(newest) if event.timestamp < newest => continue,
                Some(newest) if event.timestamp == newest => {
                    if !self.seen.insert(event.id.clone()) {
                        continue;
                    }
                }
                _ => {
                    self.newest = Some(event.timestamp);
                    self.seen.clear();
                    self.seen.insert(event.id.clone());
                }
            }

            fresh.push(event);
        }

        Ok(fresh)
    }
}
