//! Tests of the batch task execution backend.

mod common;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use common::FakeLogSource;
use common::FakeScheduler;
use common::config;
use common::runs_forever;
use common::script;
use common::succeeds;
use futures::future::try_join_all;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;
use wdl_batch::BatchBackend;
use wdl_batch::JobHandle;
use wdl_batch::JobState;
use wdl_batch::JobStatus;
use wdl_batch::TaskExecutionBackend;
use wdl_batch::backend::TaskExecutionResult;
use wdl_batch::backend::TaskSpawnRequest;
use wdl_batch::logs::LogForwarder;
use wdl_batch::logs::LogStreamId;
use wdl_batch::run::WorkflowRun;
use wdl_batch::scratch::ScratchCoordinator;

/// The name of the run used by every test.
const RUN: &str = "20240101_120000_test";

/// Opens a backend over the given scheduler.
fn backend(dir: &std::path::Path, scheduler: Arc<FakeScheduler>) -> BatchBackend {
    let config = Arc::new(config(dir));
    let scratch = ScratchCoordinator::new(config.dir(), config.cleanup);
    let run = WorkflowRun::with_name(RUN.to_string(), &scratch, None).unwrap();
    BatchBackend::open(config, run, scheduler, Arc::new(FakeLogSource::default())).unwrap()
}

/// Spawns the given tasks and waits for their results.
async fn run_tasks(backend: &BatchBackend, ids: &[&str]) -> Vec<TaskExecutionResult> {
    let token = CancellationToken::new();
    let receivers = ids
        .iter()
        .map(|id| {
            backend
                .spawn(
                    TaskSpawnRequest::builder()
                        .id(*id)
                        .command("echo hello")
                        .build(),
                    token.clone(),
                )
                .unwrap()
        })
        .collect::<Vec<_>>();

    try_join_all(receivers)
        .await
        .unwrap()
        .into_iter()
        .map(Result::unwrap)
        .collect()
}

#[tokio::test]
async fn concurrent_tasks_report_each_outcome_once() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler::scripted(|spec| {
        if spec.name().starts_with("call-c") {
            script(
                &[JobState::Runnable, JobState::Running, JobState::Failed],
                Some(3),
            )
        } else {
            succeeds()
        }
    }));
    let backend = backend(dir.path(), scheduler.clone());

    let results = run_tasks(&backend, &["call-a", "call-b", "call-c"]).await;
    assert_eq!(results.len(), 3);
    assert_eq!(scheduler.jobs_created(), 3);
    assert_eq!(results.iter().filter(|r| r.succeeded()).count(), 2);

    let failed = results.iter().find(|r| !r.succeeded()).unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.exit_code, 3);
    assert_eq!(failed.failure.as_ref().unwrap().exit_code, Some(3));

    let mut ids = results.iter().map(|r| r.job_id.clone()).collect::<Vec<_>>();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);

    // Successful attempts are cleaned up; the failed one is kept for diagnosis
    for result in &results {
        assert_eq!(result.scratch.root().exists(), !result.succeeded());
    }

    for (i, a) in results.iter().enumerate() {
        for b in &results[i + 1..] {
            assert!(!a.scratch.overlaps(&b.scratch));
        }
    }

    // Every tracked job was released along with its cached log stream
    assert!(backend.driver().registry().is_empty());
    assert_eq!(backend.logs().cached(), 0);
    backend.close().await;
}

#[tokio::test]
async fn task_jobs_run_the_command_in_their_scratch() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler::scripted(|_| {
        script(&[JobState::Running, JobState::Failed], Some(1))
    }));
    let backend = backend(dir.path(), scheduler.clone());

    let result = run_tasks(&backend, &["call-hello"]).await.remove(0);
    let scratch = backend.scratch_path("call-hello", 0);
    assert_eq!(result.scratch, scratch);
    assert_eq!(fs::read_to_string(scratch.command()).unwrap(), "echo hello");
    assert!(scratch.stdout().is_file());
    assert!(scratch.stderr().is_file());

    let spec = scheduler.spec(&result.job_id).unwrap();
    assert_eq!(spec.queue(), "tasks");
    assert_eq!(spec.image(), "ubuntu:latest");
    assert_eq!(spec.resources().memory_mib, 2048);
    assert_eq!(spec.mounts()[0].filesystem, "fs-1234");
    assert_eq!(spec.tags()["sprocket-batch-run"], RUN);
    assert!(
        spec.command()[2].starts_with(&format!("cd {}/work && ", scratch.root().display())),
        "{:?}",
        spec.command()
    );

    backend.close().await;
}

#[tokio::test]
async fn log_stream_is_reported_and_stable() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler::new());
    let backend = backend(dir.path(), scheduler.clone());

    let result = run_tasks(&backend, &["call-hello"]).await.remove(0);
    let expected = LogStreamId::new("/aws/batch/job", format!("default/{}", result.job_id));
    assert_eq!(result.log_stream, Some(expected.clone()));

    let forwarder = LogForwarder::new("/aws/batch/job", Arc::new(FakeLogSource::default()));
    let spec = scheduler.spec(&result.job_id).unwrap();
    let handle = JobHandle::new(&result.job_id, &spec);
    let mut status = JobStatus::submitted();
    status.log_stream = Some(format!("default/{}", result.job_id));

    assert_eq!(forwarder.resolve(&handle, &status), Some(expected.clone()));

    // Later resolutions are served from the cache
    status.log_stream = None;
    assert_eq!(forwarder.resolve(&handle, &status), Some(expected.clone()));
    assert_eq!(forwarder.resolve(&handle, &status), Some(expected));

    forwarder.forget(&handle);
    assert_eq!(forwarder.cached(), 0);
    assert_eq!(forwarder.resolve(&handle, &status), None);

    backend.close().await;
}

#[tokio::test]
async fn timed_out_task_is_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler::scripted(|_| runs_forever()));
    let backend = backend(dir.path(), scheduler.clone());

    let rx = backend
        .spawn(
            TaskSpawnRequest::builder()
                .id("call-slow")
                .command("sleep infinity")
                .timeout(Duration::from_millis(50))
                .build(),
            CancellationToken::new(),
        )
        .unwrap();

    let result = rx.await.unwrap().unwrap();
    assert!(result.timed_out);
    assert!(!result.succeeded());
    assert_eq!(result.state, JobState::Cancelled);
    assert_eq!(result.exit_code, -1);
    assert_eq!(scheduler.terminated(), [result.job_id.clone()]);
    assert!(result.scratch.root().exists());

    backend.close().await;
}

#[tokio::test]
async fn cancelled_task_terminates_its_job() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler::scripted(|_| runs_forever()));
    let backend = backend(dir.path(), scheduler.clone());

    let token = CancellationToken::new();
    let rx = backend
        .spawn(
            TaskSpawnRequest::builder()
                .id("call-slow")
                .command("sleep infinity")
                .build(),
            token.clone(),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();

    let result = rx.await.unwrap().unwrap();
    assert!(!result.timed_out);
    assert_eq!(result.state, JobState::Cancelled);
    assert_eq!(scheduler.terminated().len(), 1);

    backend.close().await;
}

#[tokio::test]
async fn cancelled_task_resolves_when_its_job_never_stops() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler::scripted(|_| runs_forever()));
    scheduler.reject_terminations();
    let backend = backend(dir.path(), scheduler.clone());

    let token = CancellationToken::new();
    let rx = backend
        .spawn(
            TaskSpawnRequest::builder()
                .id("call-stuck")
                .command("sleep infinity")
                .build(),
            token.clone(),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();

    let err = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("the attempt should resolve once the stop wait expires")
        .unwrap()
        .unwrap_err();
    assert!(
        format!("{err:#}").contains("failed to stop task `call-stuck`"),
        "{err:#}"
    );
    assert!(scheduler.terminated().is_empty());

    // The job is no longer polled and its scratch is kept
    assert!(backend.driver().registry().is_empty());
    assert_eq!(backend.logs().cached(), 0);
    assert!(backend.scratch_path("call-stuck", 0).root().exists());

    backend.close().await;
}

#[tokio::test]
async fn oversized_requests_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler::new());
    let backend = backend(dir.path(), scheduler.clone());

    let err = backend
        .spawn(
            TaskSpawnRequest::builder()
                .id("call-big")
                .command("true")
                .cpu(512.0)
                .build(),
            CancellationToken::new(),
        )
        .unwrap_err();
    assert!(err.to_string().contains("maximum of 64"), "{err}");
    assert_eq!(scheduler.submit_calls(), 0);

    backend.close().await;
}
