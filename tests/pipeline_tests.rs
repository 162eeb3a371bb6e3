//! Pipeline integration tests
//!
//! Runs real workflows through `sh -c` with the executor publishing into a
//! live hub, then checks persisted state and the event stream.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

use streamhub::event_store::{EventStore, EventStoreConfig};
use streamhub::hub::{ClientOptions, ClientRegistration, Hub, HubHandle, HubConfig};
use streamhub::pipeline::{
    validate, CommandStepRunner, PipelineExecutor, ResumeRequest, RunRequest, RunStatus,
    StateStore, StepStatus, Workflow,
};

fn setup(dir: &TempDir) -> (Arc<PipelineExecutor>, HubHandle) {
    let store = Arc::new(EventStore::memory_only(EventStoreConfig::default()));
    let hub = Hub::spawn(store, HubConfig::default());
    let states = StateStore::open(dir.path().join("pipelines")).unwrap();
    let executor = PipelineExecutor::new(
        states,
        dir.path(),
        Arc::new(CommandStepRunner::new()),
        Arc::new(hub.clone()),
    );
    (Arc::new(executor), hub)
}

/// Next envelope whose `type` is `event_type`
async fn wait_for(client: &mut ClientRegistration, event_type: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let frame = client.outbound.recv().await.expect("hub closed");
            let value: Value = serde_json::from_str(&frame.text).unwrap();
            if value["type"] == event_type {
                return value;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {} event", event_type))
}

#[tokio::test]
async fn test_cancel_after_first_step() {
    let dir = TempDir::new().unwrap();
    let (executor, hub) = setup(&dir);
    let mut client = hub
        .register(ClientOptions::new("test").subscribe(["pipelines:*"]))
        .await
        .unwrap();

    let workflow = Workflow::from_yaml(
        r#"
name: three-steps
steps:
  - id: first
    name: Say one
    command: echo one
  - id: second
    command: sleep 30
  - id: third
    command: echo three
"#,
    )
    .unwrap();
    let started = executor
        .start(RunRequest {
            workflow,
            session: "s1".to_string(),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(started.status, RunStatus::Running);

    let completed = wait_for(&mut client, "pipeline.step.completed").await;
    assert_eq!(completed["data"]["step_id"], "first");
    assert_eq!(completed["data"]["name"], "Say one");
    assert_eq!(completed["data"]["output"], "one");

    let cancelled = executor.cancel(&started.run_id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert_eq!(cancelled.current_step, 1);

    let persisted = executor.status(&started.run_id).unwrap();
    assert_eq!(persisted, cancelled);

    let event = wait_for(&mut client, "pipeline.cancelled").await;
    assert_eq!(event["topic"], format!("pipelines:{}", started.run_id));
    assert_eq!(event["data"]["current_step"], 1);
}

#[tokio::test]
async fn test_resume_skips_completed_steps() {
    let dir = TempDir::new().unwrap();
    let (executor, _hub) = setup(&dir);
    let marker = dir.path().join("ready");
    let yaml = format!(
        r#"
schema_version: 1
name: flaky
description: second step fails until the marker exists
steps:
  - id: a
    command: echo a
    output_var: first
  - id: b
    command: test -f {}
  - id: c
    command: echo "${{first}}-c"
"#,
        marker.display()
    );
    std::fs::write(dir.path().join("flaky.yaml"), yaml).unwrap();

    let workflow = executor.load_workflow("flaky.yaml").unwrap();
    let failed = executor
        .run(RunRequest {
            workflow,
            workflow_file: Some("flaky.yaml".to_string()),
            session: "s1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.current_step, 1);

    std::fs::write(&marker, b"").unwrap();
    executor
        .resume(&failed.run_id, ResumeRequest::default())
        .unwrap();
    let done = executor.wait(&failed.run_id).await.unwrap();

    assert_eq!(done.status, RunStatus::Succeeded);
    assert_eq!(done.current_step, 3);
    assert_eq!(done.steps.iter().filter(|s| s.step_id == "a").count(), 1);
    let last = done.steps.last().unwrap();
    assert_eq!(last.step_id, "c");
    assert_eq!(last.status, StepStatus::Succeeded);
    assert_eq!(last.output.as_deref(), Some("a-c"));

    // Succeeded runs stay put
    assert!(executor
        .resume(&failed.run_id, ResumeRequest::default())
        .is_err());
}

#[tokio::test]
async fn test_state_file_matches_after_each_step() {
    let dir = TempDir::new().unwrap();
    let (executor, hub) = setup(&dir);
    let mut client = hub
        .register(ClientOptions::new("test").subscribe(["pipelines:*"]))
        .await
        .unwrap();

    let workflow = Workflow::from_yaml(
        "name: two\nsteps:\n  - id: a\n    command: echo a\n  - id: b\n    command: sleep 30\n",
    )
    .unwrap();
    let run = executor
        .start(RunRequest {
            workflow,
            session: "s1".to_string(),
            ..Default::default()
        })
        .unwrap();
    wait_for(&mut client, "pipeline.step.completed").await;

    let store = StateStore::open(dir.path().join("pipelines")).unwrap();
    let on_disk = store.load(&run.run_id).unwrap();
    assert_eq!(on_disk.current_step, 1);
    assert_eq!(on_disk.steps.len(), 1);
    assert_eq!(on_disk.steps[0].output.as_deref(), Some("a"));

    executor.cancel(&run.run_id).await.unwrap();
}

#[test]
fn test_validation_report() {
    let workflow = Workflow::from_yaml(
        r#"
name: checks
vars:
  target: prod
steps:
  - id: deploy
    command: deploy ${target} ${region}
  - id: deploy
    prompt: summarize
    command: echo both
  - id: ""
"#,
    )
    .unwrap();

    let report = validate(&workflow);
    assert!(!report.valid);
    assert_eq!(report.workflow_id, "checks");
    assert_eq!(report.step_count, 3);
    assert!(report.errors.iter().any(|e| e.contains("duplicate step id 'deploy'")));
    assert!(report.errors.iter().any(|e| e.contains("both command and prompt")));
    assert!(report.errors.iter().any(|e| e.contains("neither command nor prompt")));
    assert!(report.warnings.contains(&"no version specified".to_string()));
    assert!(report.warnings.iter().any(|w| w.contains("'region'")));
    assert!(!report.warnings.iter().any(|w| w.contains("'target'")));

    // Same input, same report
    assert_eq!(validate(&workflow), report);
}
