//! Tests of running an engine's tasks through the served batch backend.

#![cfg(unix)]

mod common;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::FakeLogSource;
use common::FakeScheduler;
use common::config;
use common::runs_forever;
use common::script;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;
use wdl_batch::BatchBackend;
use wdl_batch::JobState;
use wdl_batch::run::Runner;
use wdl_batch::run::WorkflowRun;
use wdl_batch::scratch::ScratchCoordinator;
use wdl_batch::service::TaskReply;
use wdl_batch::service::TaskRequest;
use wdl_batch::service::TaskService;
use wdl_batch::service::run_task;

/// The name of the run used by every test.
const RUN: &str = "20240101_120000_test";

/// Opens a backend over the given scheduler.
fn backend(dir: &Path, scheduler: Arc<FakeScheduler>) -> Arc<BatchBackend> {
    let config = Arc::new(config(dir));
    let scratch = ScratchCoordinator::new(config.dir(), config.cleanup);
    let run = WorkflowRun::with_name(RUN.to_string(), &scratch, None).unwrap();
    Arc::new(
        BatchBackend::open(config, run, scheduler, Arc::new(FakeLogSource::default())).unwrap(),
    )
}

/// Builds the request of a task attempt.
fn request(id: &str) -> TaskRequest {
    TaskRequest {
        id: id.to_string(),
        attempt: 0,
        command: "echo hello".to_string(),
        image: None,
        cpu: Some(2.0),
        memory: None,
        env: [("GREETING".to_string(), "hello".to_string())].into(),
        timeout_secs: None,
    }
}

/// Writes an engine that publishes the task socket it was given in the run
/// directory and then waits for the run directory to hold `done`.
fn engine(dir: &Path) -> PathBuf {
    let path = dir.join("engine.sh");
    fs::write(
        &path,
        r#"#!/bin/sh
[ -S "$SPROCKET_BATCH__TASK_SOCKET" ] || exit 9
echo "$SPROCKET_BATCH__TASK_SOCKET" > "$SPROCKET_BATCH__RUN_DIR/socket.tmp"
mv "$SPROCKET_BATCH__RUN_DIR/socket.tmp" "$SPROCKET_BATCH__RUN_DIR/socket"
while [ ! -e "$SPROCKET_BATCH__RUN_DIR/done" ]; do sleep 0.01; done
"#,
    )
    .unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Polls until the condition yields a value.
async fn wait_for<T>(mut condition: impl FnMut() -> Option<T>) -> T {
    for _ in 0..500 {
        if let Some(value) = condition() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition was not met in time");
}

#[tokio::test]
async fn engine_tasks_run_as_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler::new());
    let backend = backend(dir.path(), scheduler.clone());
    let run = backend.run().clone();

    let runner = Runner::builder()
        .engine(engine(dir.path()).to_string_lossy().into_owned())
        .backend(backend.clone())
        .build();
    let running = tokio::spawn({
        let run = run.clone();
        async move { runner.run(&run, CancellationToken::new()).await }
    });

    let published = run.dir().join("socket");
    let socket = wait_for(|| fs::read_to_string(&published).ok()).await;
    let socket = PathBuf::from(socket.trim());

    let (job_id, state, exit_code, timed_out, scratch) =
        match run_task(&socket, &request("call-hello")).await.unwrap() {
            TaskReply::Finished {
                job_id,
                state,
                exit_code,
                timed_out,
                scratch,
                ..
            } => (job_id, state, exit_code, timed_out, scratch),
            reply => panic!("unexpected reply {reply:?}"),
        };
    assert_eq!(state.parse::<JobState>().unwrap(), JobState::Succeeded);
    assert_eq!(exit_code, 0);
    assert!(!timed_out);
    assert!(scratch.starts_with(run.dir()));

    assert_eq!(scheduler.jobs_created(), 1);
    let spec = scheduler.spec(&job_id).unwrap();
    assert_eq!(spec.queue(), "tasks");
    assert_eq!(spec.resources().vcpus, 2.0);
    assert_eq!(spec.environment()["GREETING"], "hello");
    assert_eq!(spec.mounts()[0].filesystem, "fs-1234");

    fs::write(run.dir().join("done"), "").unwrap();
    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome.exit_code, 0);

    // The service is gone with the engine
    assert!(!socket.exists());
    assert!(backend.driver().registry().is_empty());
    backend.close().await;
}

#[tokio::test]
async fn self_test_runs_tasks_as_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler::new());
    let backend = backend(dir.path(), scheduler.clone());

    let runner = Runner::builder()
        .self_test(true)
        .backend(backend.clone())
        .build();
    let outcome = runner
        .run(backend.run(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(scheduler.jobs_created(), 2);
    let mut names = scheduler
        .specs()
        .iter()
        .map(|s| s.name().split('-').take(3).collect::<Vec<_>>().join("-"))
        .collect::<Vec<_>>();
    names.sort();
    assert_eq!(names, ["self-test-0", "self-test-1"]);

    backend.close().await;
}

#[tokio::test]
async fn failed_self_test_reports_the_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler::scripted(|_| {
        script(&[JobState::Running, JobState::Failed], Some(4))
    }));
    let backend = backend(dir.path(), scheduler.clone());

    let runner = Runner::builder()
        .self_test(true)
        .backend(backend.clone())
        .build();
    let outcome = runner
        .run(backend.run(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.exit_code, 4);

    backend.close().await;
}

#[tokio::test]
async fn closing_the_connection_cancels_the_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler::scripted(|_| runs_forever()));
    let backend = backend(dir.path(), scheduler.clone());

    let service = TaskService::bind(backend.clone()).unwrap();
    let socket = service.socket().to_path_buf();
    let stop = CancellationToken::new();
    let serving = tokio::spawn(service.serve(stop.clone()));

    let client = tokio::spawn({
        let socket = socket.clone();
        async move { run_task(&socket, &request("call-slow")).await }
    });

    wait_for(|| (scheduler.jobs_created() == 1).then_some(())).await;
    client.abort();
    wait_for(|| (scheduler.terminated().len() == 1).then_some(())).await;

    stop.cancel();
    serving.await.unwrap();
    assert!(backend.driver().registry().is_empty());
    backend.close().await;
}

#[tokio::test]
async fn refused_attempts_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = Arc::new(FakeScheduler::new());
    let backend = backend(dir.path(), scheduler.clone());

    let service = TaskService::bind(backend.clone()).unwrap();
    let socket = service.socket().to_path_buf();
    let stop = CancellationToken::new();
    let serving = tokio::spawn(service.serve(stop.clone()));

    let mut big = request("call-big");
    big.cpu = Some(512.0);
    match run_task(&socket, &big).await.unwrap() {
        TaskReply::Failed { error } => assert!(error.contains("maximum of 64"), "{error}"),
        reply => panic!("unexpected reply {reply:?}"),
    }
    assert_eq!(scheduler.submit_calls(), 0);

    stop.cancel();
    serving.await.unwrap();
    backend.close().await;
}
