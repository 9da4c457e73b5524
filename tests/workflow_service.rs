//! End-to-end tests over the assembled service: planner, engine, stream
//! multiplexer, monitor, and scheduler wired together with a scripted
//! worker client.

use std::path::Path;
use std::sync::{Arc, Mutex};

use futures::StreamExt;

use weft::{
    AppConfig, ExecOptions, ProgressSink, ProgressUpdate, ScheduleSpec, ScheduleStatus,
    SessionStatus, StepStatus, WorkerType, WorkflowEvent, WorkflowService,
};
use weft_core::config::StreamConfig;
use weft_core::event::EventBus;
use weft_engine::WorkflowEngine;
use weft_stream::StreamMux;
use weft_test_utils::{MockWorker, WorkerScript};

fn config_at(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.workspace.base_dir = dir.join("workspaces").display().to_string();
    config.monitor.state_file = dir.join("monitoring_state.json").display().to_string();
    config.scheduler.state_file = dir.join("scheduled_workflows.json").display().to_string();
    config
}

/// Twelve ten-word chunks, 120 words per run.
fn ten_word_chunks() -> WorkerScript {
    let chunk = "alpha bravo charlie delta echo foxtrot golf hotel india juliet";
    WorkerScript::chunks(&[chunk; 12])
}

fn service_with(dir: &Path, script: WorkerScript) -> WorkflowService {
    WorkflowService::new(config_at(dir), Arc::new(MockWorker::new(script)))
}

#[tokio::test]
async fn test_research_goal_runs_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), ten_word_chunks());

    let (session_id, feed) = service
        .start_workflow("Research AI trends", ExecOptions::default())
        .unwrap();
    let events: Vec<WorkflowEvent> = feed.collect().await;

    // The research template plans researcher -> analyst -> writer
    match &events[1] {
        WorkflowEvent::WorkflowPlanned {
            category,
            total_steps,
            steps,
            ..
        } => {
            assert_eq!(category, "research");
            assert_eq!(*total_steps, 3);
            assert_eq!(steps[0].worker_type, WorkerType::Researcher);
            assert_eq!(steps[1].worker_type, WorkerType::Analyst);
            assert_eq!(steps[2].worker_type, WorkerType::Writer);
        }
        other => panic!("expected WorkflowPlanned, got {other:?}"),
    }

    // Step 1 streams 120 words before its terminal event
    let step1_words: u64 = events
        .iter()
        .filter_map(|e| match e {
            WorkflowEvent::TextChunk {
                step: 1,
                word_count,
                ..
            } => Some(*word_count),
            _ => None,
        })
        .sum();
    assert_eq!(step1_words, 120);

    // Within the feed, step 1 fully settles before step 2 starts
    let last_chunk_1 = events
        .iter()
        .rposition(|e| matches!(e, WorkflowEvent::TextChunk { step: 1, .. }))
        .unwrap();
    let completed_1 = events
        .iter()
        .position(|e| matches!(e, WorkflowEvent::StepCompleted { step: 1, .. }))
        .unwrap();
    let started_2 = events
        .iter()
        .position(|e| matches!(e, WorkflowEvent::StepStarted { step: 2, .. }))
        .unwrap();
    assert!(last_chunk_1 < completed_1);
    assert!(completed_1 < started_2);

    match events.last().unwrap() {
        WorkflowEvent::WorkflowCompleted { metrics, .. } => {
            assert_eq!(metrics.total_words, 360);
            assert_eq!(metrics.completed_runs, 3);
        }
        other => panic!("expected WorkflowCompleted, got {other:?}"),
    }

    let session = service.get_workflow_status(&session_id).unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert!((session.progress() - 1.0).abs() < f64::EPSILON);

    // The monitor observed the session and its runs
    let snapshot = service.monitor().snapshot();
    assert_eq!(
        snapshot.workflow_sessions[&session_id.0].status,
        SessionStatus::Completed
    );
    assert_eq!(snapshot.agent_runs.len(), 3);
}

/// Captures every session snapshot the engine pushes, in order.
struct RecordingSink(Mutex<Vec<ProgressUpdate>>);

impl ProgressSink for RecordingSink {
    fn record(&self, update: ProgressUpdate) {
        self.0.lock().unwrap().push(update);
    }
}

#[tokio::test]
async fn test_step_index_advances_only_after_terminal_event() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
    let mux = Arc::new(StreamMux::new(
        Arc::new(MockWorker::new(ten_word_chunks())),
        StreamConfig::default(),
    ));
    let engine = Arc::new(WorkflowEngine::new(
        mux,
        Arc::new(EventBus::default()),
        dir.path().join("workspaces"),
        Some(sink.clone()),
    ));

    let (_, feed) = engine
        .start("Research AI trends", ExecOptions::default())
        .unwrap();
    let _events: Vec<WorkflowEvent> = feed.collect().await;

    let snapshots: Vec<_> = sink
        .0
        .lock()
        .unwrap()
        .iter()
        .filter_map(|u| match u {
            ProgressUpdate::SessionUpserted(s) => Some(s.clone()),
            _ => None,
        })
        .collect();

    // current_step_index never goes backwards, and progress is monotonic
    for pair in snapshots.windows(2) {
        assert!(pair[1].current_step_index >= pair[0].current_step_index);
        assert!(pair[1].progress() >= pair[0].progress());
    }

    // The index reaches 1 only once step 1 has a terminal result
    let first_at_one = snapshots
        .iter()
        .find(|s| s.current_step_index == 1)
        .expect("index never advanced");
    assert!(!first_at_one.steps.is_empty());
    assert_eq!(first_at_one.steps[0].status, StepStatus::Completed);
}

#[tokio::test]
async fn test_interrupt_through_service() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), WorkerScript::Hangs);

    let (session_id, mut feed) = service
        .start_workflow("Research AI trends", ExecOptions::default())
        .unwrap();
    while let Some(event) = feed.next().await {
        if matches!(event, WorkflowEvent::StepStarted { .. }) {
            break;
        }
    }

    assert!(service.interrupt_workflow(&session_id));
    let rest: Vec<WorkflowEvent> = feed.collect().await;
    assert!(matches!(
        rest.last().unwrap(),
        WorkflowEvent::WorkflowInterrupted { .. }
    ));
    assert_eq!(
        service.get_workflow_status(&session_id).unwrap().status,
        SessionStatus::Interrupted
    );
}

#[tokio::test]
async fn test_broadcast_feed_sees_all_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let service = service_with(dir.path(), WorkerScript::chunks(&["short output"]));

    let mut bus = service.subscribe();
    let (session_id, feed) = service
        .start_workflow("Research AI trends", ExecOptions::default())
        .unwrap();
    let _events: Vec<WorkflowEvent> = feed.collect().await;

    // The broadcast subscriber observes the same session's lifecycle
    let mut saw_completed = false;
    while let Ok(event) = bus.try_recv() {
        assert_eq!(event.session_id(), &session_id);
        if matches!(event, WorkflowEvent::WorkflowCompleted { .. }) {
            saw_completed = true;
        }
    }
    assert!(saw_completed);
}

#[tokio::test]
async fn test_state_survives_service_restart() {
    let dir = tempfile::tempdir().unwrap();

    let (session_id, entry_id) = {
        let service = service_with(dir.path(), WorkerScript::chunks(&["persisted output"]));
        service.start_background();

        let (session_id, feed) = service
            .start_workflow("Research AI trends", ExecOptions::default())
            .unwrap();
        let _events: Vec<WorkflowEvent> = feed.collect().await;

        let entry_id = service
            .schedule_workflow(
                "nightly research",
                "Research AI trends",
                ScheduleSpec::Daily { hour: 3, minute: 0 },
                None,
            )
            .await
            .unwrap();

        // Shutdown flushes monitor and scheduler state to disk
        service.shutdown().await;
        (session_id, entry_id)
    };

    let restored = service_with(dir.path(), WorkerScript::chunks(&["unused"]));
    let snapshot = restored.monitor().snapshot();
    assert_eq!(
        snapshot.workflow_sessions[&session_id.0].status,
        SessionStatus::Completed
    );

    let entries = restored.list_scheduled();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, entry_id);
    assert_eq!(entries[0].status, ScheduleStatus::Pending);
    assert_eq!(entries[0].name, "nightly research");
}
