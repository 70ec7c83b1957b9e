//! End-to-end runs through the engine with in-memory boundaries.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::RunPlan;
use crate::config::{EngineConfig, StepOverride};
use crate::core::{RunMode, RunStatus, StepStatus};
use crate::errors::{EngageflowError, GuardError, StepError};
use crate::executor::{SkipReason, StepOutcome};
use crate::guard::ResourceGuardDecision;
use crate::steps::{FaceDetection, StepKind, Transcription, VideoAnalysis, VideoLabel};
use crate::subject::{SubjectKind, SubjectRecord};
use crate::testing::{
    assert_run_status, assert_step_failed_with, assert_step_result, assert_step_status,
    fixture_post, ScriptedGuard, TestEngine,
};
use pretty_assertions::assert_eq;

fn analysis_plan() -> RunPlan {
    RunPlan::new()
        .required(StepKind::FaceRecognition)
        .required(StepKind::Ocr)
        .required(StepKind::VisualAnalysis)
        .deferred(StepKind::MetadataTagging)
}

fn face() -> FaceDetection {
    FaceDetection {
        bbox: [0, 0, 10, 10],
        confidence: 0.9,
        age: None,
        gender: None,
        embedding: Some(vec![0.5, 0.25]),
    }
}

#[tokio::test]
async fn test_all_steps_succeed_and_deferred_run_once() {
    let t = TestEngine::new().unwrap();
    t.insert(fixture_post("post-1"));
    t.backend.push_faces(Ok(vec![face()]));

    let run_id = t.engine.start_run("post-1", &analysis_plan()).await.unwrap();
    assert_eq!(t.queue.len(), 3);

    let deliveries = t.drain().await;
    assert!(deliveries.iter().all(|d| d.outcome.is_ok()));

    let run = t.run("post-1", &run_id).await.unwrap();
    assert_run_status(&run, RunStatus::Completed);
    assert_step_result(&run, "face", "face_count", &json!(1));
    assert_step_status(&run, "metadata", StepStatus::Succeeded);
    assert_step_result(&run, "metadata", "hashtags", &json!(["sunset", "travel"]));
    assert_eq!(t.queue.tasks_for("metadata").len(), 1);
    assert_eq!(t.events.events_of_type("pipeline.finished").len(), 1);
    assert!(run.deferred_enqueued_at.is_some());
    assert_eq!(run.summary.as_ref().unwrap()["succeeded"], 3);

    let subject = t.repo.get("post-1").unwrap();
    assert_eq!(subject.ai_status.as_deref(), Some("completed"));
}

#[tokio::test]
async fn test_required_failure_fails_the_run() {
    let t = TestEngine::new().unwrap();
    t.insert(fixture_post("post-1"));
    t.backend
        .push_faces(Err(StepError::domain("face_analysis_failed", "model rejected the image")));

    let plan = RunPlan::new()
        .required(StepKind::FaceRecognition)
        .required(StepKind::Ocr);
    let run_id = t.engine.start_run("post-1", &plan).await.unwrap();
    t.drain().await;

    let run = t.run("post-1", &run_id).await.unwrap();
    assert_run_status(&run, RunStatus::Failed);
    assert_step_failed_with(&run, "face", "face_analysis_failed");
    assert_step_status(&run, "ocr", StepStatus::Succeeded);
    assert_eq!(run.failure_reason.as_deref(), Some("face:face_analysis_failed"));
}

#[tokio::test]
async fn test_optional_failure_completes_with_warnings() {
    let t = TestEngine::new().unwrap();
    t.insert(fixture_post("post-1"));
    t.backend
        .push_faces(Err(StepError::domain("face_analysis_failed", "model rejected the image")));

    let plan = RunPlan::new()
        .optional(StepKind::FaceRecognition)
        .required(StepKind::Ocr);
    let run_id = t.engine.start_run("post-1", &plan).await.unwrap();
    t.drain().await;

    let run = t.run("post-1", &run_id).await.unwrap();
    assert_run_status(&run, RunStatus::CompletedWithWarnings);
    assert!(run.failure_reason.is_none());
}

#[tokio::test]
async fn test_duplicate_delivery_is_a_no_op() {
    let t = TestEngine::new().unwrap();
    t.insert(fixture_post("post-1"));
    let plan = RunPlan::new()
        .required(StepKind::FaceRecognition)
        .required(StepKind::Ocr);
    let run_id = t.engine.start_run("post-1", &plan).await.unwrap();

    let ocr = t.queue.take_all().into_iter().find(|task| task.args.step == "ocr").unwrap();
    let first = t.engine.handle_task(&ocr.task_id, &ocr.args).await.unwrap();
    assert!(matches!(first, StepOutcome::Succeeded { .. }));

    let before = t.run("post-1", &run_id).await.unwrap();
    let events_before = t.events.len();

    let second = t.engine.handle_task(&ocr.task_id, &ocr.args).await.unwrap();
    assert_eq!(second, StepOutcome::Skipped(SkipReason::StepTerminal));
    assert_eq!(t.run("post-1", &run_id).await.unwrap(), before);
    assert_eq!(t.events.len(), events_before);
    assert!(t.queue.is_empty());
}

#[tokio::test]
async fn test_guard_denials_then_admission() {
    let guard = Arc::new(ScriptedGuard::new());
    for _ in 0..3 {
        guard.push(Ok(ResourceGuardDecision::deny("soft_limit", 20)));
    }
    let config = EngineConfig::default().with_step(
        StepKind::Ocr,
        StepOverride {
            max_defer_attempts: Some(4),
            ..StepOverride::default()
        },
    );
    let t = TestEngine::with_builder(|b| b.guard(guard.clone()).config(config)).unwrap();
    t.insert(fixture_post("post-1"));

    let run_id = t
        .engine
        .start_run("post-1", &RunPlan::new().required(StepKind::Ocr))
        .await
        .unwrap();
    let deliveries = t.drain().await;

    let outcomes: Vec<&StepOutcome> = deliveries
        .iter()
        .map(|d| d.outcome.as_ref().unwrap())
        .collect();
    assert_eq!(outcomes.len(), 4);
    for (index, outcome) in outcomes[..3].iter().enumerate() {
        assert_eq!(
            **outcome,
            StepOutcome::Deferred {
                attempts: u32::try_from(index).unwrap() + 1,
                retry_in: Duration::from_secs(20),
                reason: "soft_limit".into(),
            }
        );
    }
    assert!(matches!(outcomes[3], StepOutcome::Succeeded { .. }));

    let run = t.run("post-1", &run_id).await.unwrap();
    assert_run_status(&run, RunStatus::Completed);
    assert_eq!(run.step("ocr").unwrap().attempts, 3);
    assert_eq!(guard.queries(), 4);
    assert_eq!(guard.released(), 1);

    let defer_attempts: Vec<u32> = t
        .queue
        .tasks_for("ocr")
        .iter()
        .map(|task| task.args.defer_attempt)
        .collect();
    assert_eq!(defer_attempts, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_guard_exhaustion_fails_with_resource_constraints() {
    let guard = Arc::new(ScriptedGuard::new());
    for _ in 0..10 {
        guard.push(Ok(ResourceGuardDecision::deny("hard_limit", 5)));
    }
    let t = TestEngine::with_builder(|b| b.guard(guard.clone())).unwrap();
    t.insert(fixture_post("post-1"));

    let run_id = t
        .engine
        .start_run("post-1", &RunPlan::new().required(StepKind::Ocr))
        .await
        .unwrap();
    t.drain().await;

    let run = t.run("post-1", &run_id).await.unwrap();
    assert_run_status(&run, RunStatus::Failed);
    assert_step_failed_with(&run, "ocr", "resource_constraints");
    assert_eq!(run.step("ocr").unwrap().attempts, 6);
    assert_eq!(guard.released(), 0);
}

#[tokio::test]
async fn test_guard_errors_fail_open() {
    let guard = Arc::new(ScriptedGuard::new());
    guard.push(Err(GuardError("load snapshot unavailable".into())));
    let t = TestEngine::with_builder(|b| b.guard(guard.clone())).unwrap();
    t.insert(fixture_post("post-1"));

    let run_id = t
        .engine
        .start_run("post-1", &RunPlan::new().required(StepKind::Ocr))
        .await
        .unwrap();
    t.drain().await;

    assert_run_status(&t.run("post-1", &run_id).await.unwrap(), RunStatus::Completed);
    assert_eq!(guard.released(), 0);
}

#[tokio::test]
async fn test_deleted_subject_aborts_silently() {
    let t = TestEngine::new().unwrap();
    t.insert(fixture_post("post-1"));
    t.engine.start_run("post-1", &analysis_plan()).await.unwrap();
    let events_before = t.events.len();

    t.repo.remove("post-1");
    let deliveries = t.drain().await;

    assert_eq!(deliveries.len(), 3);
    for delivery in &deliveries {
        assert_eq!(
            delivery.outcome.as_ref().unwrap(),
            &StepOutcome::Skipped(SkipReason::StaleContext)
        );
    }
    assert!(t.repo.get("post-1").is_none());
    assert_eq!(t.events.len(), events_before);
}

#[tokio::test]
async fn test_start_run_for_missing_subject() {
    let t = TestEngine::new().unwrap();
    let result = t.engine.start_run("ghost", &analysis_plan()).await;
    assert!(matches!(result, Err(EngageflowError::Store(_))));
    assert!(t.queue.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_completions_finalize_once() {
    let t = Arc::new(TestEngine::new().unwrap());
    for i in 0..20 {
        t.insert(fixture_post(&format!("post-{i}")));
        t.engine
            .start_run(&format!("post-{i}"), &analysis_plan())
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for task in t.queue.take_all() {
        let t = Arc::clone(&t);
        handles.push(tokio::spawn(async move {
            t.engine.handle_task(&task.task_id, &task.args).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(t.events.events_of_type("pipeline.finished").len(), 20);
    assert_eq!(t.queue.tasks_for("metadata").len(), 20);
    for i in 0..20 {
        let run = t
            .engine
            .latest_pipeline(&format!("post-{i}"))
            .await
            .unwrap()
            .unwrap();
        assert_run_status(&run, RunStatus::Completed);
    }
}

#[tokio::test]
async fn test_chain_mode_runs_steps_in_order() {
    let t = TestEngine::new().unwrap();
    t.insert(fixture_post("post-1"));

    let run_id = t
        .engine
        .start_run("post-1", &analysis_plan().mode(RunMode::Chain))
        .await
        .unwrap();
    assert_eq!(t.queue.len(), 1);

    t.drain().await;

    let order: Vec<String> = t
        .queue
        .history()
        .into_iter()
        .map(|task| task.args.step)
        .collect();
    assert_eq!(order, vec!["face", "ocr", "visual", "metadata"]);
    assert_run_status(&t.run("post-1", &run_id).await.unwrap(), RunStatus::Completed);
}

#[tokio::test]
async fn test_generation_opens_once_after_analysis() {
    let t = TestEngine::new().unwrap();
    t.insert(fixture_post("post-1"));

    let run_id = t.engine.start_run("post-1", &RunPlan::standard()).await.unwrap();
    assert_eq!(t.queue.len(), 3);
    t.drain().await;

    let run = t.run("post-1", &run_id).await.unwrap();
    assert_run_status(&run, RunStatus::Completed);
    assert_step_result(&run, "comments", "comment_count", &json!(1));
    assert_eq!(t.queue.tasks_for("comments").len(), 1);
    assert!(run.generation.is_some());

    let requests = t.backend.comment_requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].analysis.get("ocr").is_some());
}

#[tokio::test]
async fn test_comment_generation_waits_for_profile_then_fails() {
    let t = TestEngine::new().unwrap();
    t.insert(
        SubjectRecord::new("post-1", SubjectKind::Post)
            .with_media("/media/post-1.jpg")
            .with_caption("hello"),
    );

    let run_id = t.engine.start_run("post-1", &RunPlan::standard()).await.unwrap();
    t.drain().await;

    let run = t.run("post-1", &run_id).await.unwrap();
    assert_run_status(&run, RunStatus::Failed);
    assert_step_failed_with(&run, "comments", "profile_data_incomplete");
    let comments = run.step("comments").unwrap();
    assert_eq!(comments.reason_waits, 6);
    assert_eq!(comments.attempts, 0);
    assert_eq!(t.queue.tasks_for("comments").len(), 7);
}

#[tokio::test]
async fn test_profile_waits_do_not_spend_guard_deferrals() {
    let guard = Arc::new(ScriptedGuard::new());
    for _ in 0..7 {
        guard.push(Ok(ResourceGuardDecision::allow("ok")));
    }
    guard.push(Ok(ResourceGuardDecision::deny("soft_limit", 20)));
    let config = EngineConfig::default().with_step(
        StepKind::CommentGeneration,
        StepOverride {
            max_defer_attempts: Some(2),
            ..StepOverride::default()
        },
    );
    let t = TestEngine::with_builder(|b| b.guard(guard.clone()).config(config)).unwrap();
    t.insert(SubjectRecord::new("post-1", SubjectKind::Post).with_media("/media/post-1.jpg"));

    let plan = RunPlan::new()
        .required(StepKind::Ocr)
        .generation(StepKind::CommentGeneration)
        .generate_comments(true);
    let run_id = t.engine.start_run("post-1", &plan).await.unwrap();
    let deliveries = t.drain().await;

    let comments: Vec<&StepOutcome> = deliveries
        .iter()
        .filter(|d| d.task.args.step == "comments")
        .map(|d| d.outcome.as_ref().unwrap())
        .collect();
    assert_eq!(comments.len(), 8);
    assert_eq!(
        *comments[6],
        StepOutcome::Deferred {
            attempts: 1,
            retry_in: Duration::from_secs(20),
            reason: "soft_limit".into(),
        }
    );

    let run = t.run("post-1", &run_id).await.unwrap();
    assert_step_failed_with(&run, "comments", "profile_data_incomplete");
    let state = run.step("comments").unwrap();
    assert_eq!(state.attempts, 1);
    assert_eq!(state.reason_waits, 6);
}

#[tokio::test]
async fn test_guard_exhaustion_wins_over_the_delivery_budget() {
    let guard = Arc::new(ScriptedGuard::new());
    for _ in 0..30 {
        guard.push(Ok(ResourceGuardDecision::deny("hard_limit", 5)));
    }
    let t = TestEngine::with_builder(|b| b.guard(guard.clone())).unwrap();
    t.insert(fixture_post("post-1"));

    let run_id = t
        .engine
        .start_run("post-1", &RunPlan::new().required(StepKind::VisualAnalysis))
        .await
        .unwrap();
    t.drain().await;

    let run = t.run("post-1", &run_id).await.unwrap();
    assert_run_status(&run, RunStatus::Failed);
    assert_step_failed_with(&run, "visual", "resource_constraints");
    assert_eq!(run.step("visual").unwrap().attempts, 8);
    assert_eq!(guard.queries(), 9);
}

#[test]
fn test_budget_below_deferrals_is_rejected() {
    let config = EngineConfig::default().with_step(
        StepKind::Ocr,
        StepOverride {
            max_total_attempts: Some(4),
            ..StepOverride::default()
        },
    );
    let built = TestEngine::with_builder(|b| b.config(config));
    assert!(matches!(
        built,
        Err(EngageflowError::Config(message)) if message.contains("'ocr'")
    ));
}

#[tokio::test]
async fn test_failed_chain_enqueue_recovers_on_redelivery() {
    let t = TestEngine::new().unwrap();
    t.insert(fixture_post("post-1"));
    let plan = RunPlan::new()
        .required(StepKind::Ocr)
        .required(StepKind::FaceRecognition)
        .mode(RunMode::Chain);
    let run_id = t.engine.start_run("post-1", &plan).await.unwrap();
    let ocr = t.queue.take_all().remove(0);
    assert_eq!(ocr.args.step, "ocr");

    t.queue.fail_next(1);
    let first = t.engine.handle_task(&ocr.task_id, &ocr.args).await;
    assert!(matches!(first, Err(EngageflowError::Queue(_))));

    let run = t.run("post-1", &run_id).await.unwrap();
    assert_step_status(&run, "ocr", StepStatus::Succeeded);
    assert_step_status(&run, "face", StepStatus::Pending);
    assert!(run.step("face").unwrap().queue_name.is_none());
    assert!(t.queue.is_empty());

    let again = t.engine.handle_task(&ocr.task_id, &ocr.args).await.unwrap();
    assert_eq!(again, StepOutcome::Skipped(SkipReason::StepTerminal));
    assert_eq!(t.queue.len(), 1);

    t.drain().await;
    assert_run_status(&t.run("post-1", &run_id).await.unwrap(), RunStatus::Completed);
    assert_eq!(t.queue.tasks_for("face").len(), 1);
    assert_eq!(t.events.events_of_type("pipeline.finished").len(), 1);
}

#[tokio::test]
async fn test_failed_deferred_enqueue_is_retried_by_finalize() {
    let t = TestEngine::new().unwrap();
    t.insert(fixture_post("post-1"));
    let plan = RunPlan::new()
        .required(StepKind::Ocr)
        .deferred(StepKind::MetadataTagging);
    let run_id = t.engine.start_run("post-1", &plan).await.unwrap();
    let ocr = t.queue.take_all().remove(0);

    t.queue.fail_next(1);
    let first = t.engine.handle_task(&ocr.task_id, &ocr.args).await;
    assert!(matches!(first, Err(EngageflowError::Queue(_))));

    let run = t.run("post-1", &run_id).await.unwrap();
    assert_run_status(&run, RunStatus::Completed);
    assert_step_status(&run, "metadata", StepStatus::Pending);
    assert!(run.deferred_enqueued_at.is_none());

    assert!(t.engine.finalize("post-1", &run_id).await.unwrap().is_none());
    t.drain().await;

    let run = t.run("post-1", &run_id).await.unwrap();
    assert_step_status(&run, "metadata", StepStatus::Succeeded);
    assert!(run.deferred_enqueued_at.is_some());
    assert_eq!(t.queue.tasks_for("metadata").len(), 1);
    assert_eq!(t.events.events_of_type("pipeline.finished").len(), 1);
}

/// Delivers what is pending now, leaving follow-ups queued.
async fn deliver_round(t: &TestEngine) -> Vec<StepOutcome> {
    let mut outcomes = Vec::new();
    for task in t.queue.take_all() {
        outcomes.push(t.engine.handle_task(&task.task_id, &task.args).await.unwrap());
    }
    outcomes
}

#[tokio::test]
async fn test_steps_waiting_on_one_reason_keep_separate_budgets() {
    let t = TestEngine::new().unwrap();
    t.insert(SubjectRecord::new("post-1", SubjectKind::Post).with_caption("#later"));
    let plan = RunPlan::new()
        .required(StepKind::FaceRecognition)
        .required(StepKind::Ocr);
    let run_id = t.engine.start_run("post-1", &plan).await.unwrap();

    for _ in 0..2 {
        let outcomes = deliver_round(&t).await;
        assert_eq!(outcomes.len(), 2);
        for outcome in outcomes {
            assert!(
                matches!(&outcome, StepOutcome::Deferred { reason, .. } if reason == "media_not_ready"),
                "{outcome:?}"
            );
        }
    }

    let mut subject = t.repo.get("post-1").unwrap();
    subject.media_ref = Some("/media/post-1.jpg".into());
    t.insert(subject);
    for _ in 0..4 {
        t.backend
            .push_faces(Err(StepError::not_ready("media_not_ready", "thumbnail still rendering")));
    }
    t.drain().await;

    let run = t.run("post-1", &run_id).await.unwrap();
    assert_step_status(&run, "ocr", StepStatus::Succeeded);
    assert_eq!(run.step("ocr").unwrap().reason_waits, 2);
    assert_step_failed_with(&run, "face", "media_not_ready");
    assert_eq!(run.step("face").unwrap().reason_waits, 5);
    assert_eq!(t.queue.tasks_for("face").len(), 6);
}

#[tokio::test]
async fn test_video_post_runs_media_steps() {
    let t = TestEngine::new().unwrap();
    t.insert(fixture_post("reel-1").with_media("https://cdn.example.com/reels/reel-1.mp4"));
    t.backend.push_video(Ok(VideoAnalysis {
        duration: 14.0,
        fps: 30.0,
        frames_analyzed: 14,
        static_detected: false,
        labels: vec![VideoLabel {
            label: "Surfing".into(),
            count: 11,
            max_confidence: 0.93,
        }],
        face_groups: Vec::new(),
        text: None,
        scene_changes: vec![6.5],
    }));
    t.backend.push_transcription(Ok(Transcription {
        text: "first #wave of the day".into(),
        segments: Vec::new(),
        duration: Some(14.0),
        language: Some("en".into()),
        language_probability: Some(0.97),
        confidence: Some(0.85),
        model: Some("base".into()),
    }));

    let run_id = t.engine.start_run("reel-1", &RunPlan::video()).await.unwrap();
    assert_eq!(t.queue.len(), 2);
    t.drain().await;

    let run = t.run("reel-1", &run_id).await.unwrap();
    assert_run_status(&run, RunStatus::Completed);
    assert_step_result(&run, "video", "labels", &json!(["Surfing"]));
    assert_step_result(&run, "video", "scene_change_count", &json!(1));
    assert_step_result(&run, "audio", "has_speech", &json!(true));
    assert_step_result(&run, "metadata", "labels", &json!(["surfing"]));
    assert_step_result(&run, "metadata", "hashtags", &json!(["sunset", "travel", "wave"]));

    let requests = t.backend.comment_requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].analysis.get("video").is_some());
    assert!(requests[0].analysis.get("audio").is_some());
}

#[tokio::test]
async fn test_video_plan_skips_image_posts() {
    let t = TestEngine::new().unwrap();
    t.insert(fixture_post("post-1"));

    let run_id = t.engine.start_run("post-1", &RunPlan::video()).await.unwrap();
    t.drain().await;

    let run = t.run("post-1", &run_id).await.unwrap();
    assert_run_status(&run, RunStatus::Completed);
    assert_step_result(&run, "video", "reason", &json!("not_video"));
    assert_step_result(&run, "audio", "reason", &json!("not_video"));
    assert!(t.backend.transcription_requests().is_empty());
}

#[tokio::test]
async fn test_transient_error_is_retried_by_the_dispatcher() {
    let t = TestEngine::new().unwrap();
    t.insert(fixture_post("post-1"));
    t.backend.push_text(Err(StepError::transient("connection reset")));

    let run_id = t
        .engine
        .start_run("post-1", &RunPlan::new().required(StepKind::Ocr))
        .await
        .unwrap();
    let deliveries = t.drain().await;

    assert!(matches!(
        deliveries[0].outcome,
        Ok(StepOutcome::Retrying { retry_attempt: 1, .. })
    ));
    let retries: Vec<u32> = t
        .queue
        .tasks_for("ocr")
        .iter()
        .map(|task| task.args.retry_attempt)
        .collect();
    assert_eq!(retries, vec![0, 1]);

    let run = t.run("post-1", &run_id).await.unwrap();
    assert_run_status(&run, RunStatus::Completed);
    assert_eq!(run.step("ocr").unwrap().attempts, 0);
}

#[tokio::test]
async fn test_deferred_step_preflight_skip() {
    let t = TestEngine::new().unwrap();
    t.insert(SubjectRecord::new("post-1", SubjectKind::Post).with_media("/media/post-1.jpg"));

    let plan = RunPlan::new()
        .required(StepKind::FaceRecognition)
        .deferred(StepKind::MetadataTagging);
    let run_id = t.engine.start_run("post-1", &plan).await.unwrap();
    t.drain().await;

    let run = t.run("post-1", &run_id).await.unwrap();
    assert_run_status(&run, RunStatus::Completed);
    assert_step_status(&run, "metadata", StepStatus::Succeeded);
    assert_step_result(&run, "metadata", "skipped", &json!(true));
    assert_step_result(&run, "metadata", "reason", &json!("nothing_to_tag"));
}

#[tokio::test]
async fn test_stagger_delays_parallel_dispatch() {
    let mut config = EngineConfig::default();
    config.coordinator.stagger_seconds = 5;
    let t = TestEngine::with_builder(|b| b.config(config)).unwrap();
    t.insert(fixture_post("post-1"));

    t.engine.start_run("post-1", &analysis_plan()).await.unwrap();

    let delays: std::collections::BTreeMap<String, Option<Duration>> = t
        .queue
        .pending()
        .into_iter()
        .map(|task| (task.args.step, task.delay))
        .collect();
    assert_eq!(delays["face"], None);
    assert_eq!(delays["ocr"], Some(Duration::from_secs(5)));
    assert_eq!(delays["visual"], Some(Duration::from_secs(10)));
}

#[tokio::test]
async fn test_history_is_pruned_across_runs() {
    let mut config = EngineConfig::default();
    config.coordinator.history_limit = 2;
    let t = TestEngine::with_builder(|b| b.config(config)).unwrap();
    t.insert(fixture_post("post-1"));

    let mut last = String::new();
    for _ in 0..4 {
        last = t
            .engine
            .start_run("post-1", &RunPlan::new().required(StepKind::Ocr))
            .await
            .unwrap();
        t.drain().await;
    }

    let latest = t.engine.latest_pipeline("post-1").await.unwrap().unwrap();
    assert_eq!(latest.run_id, last);
    let blob = t.repo.get("post-1").unwrap().metadata;
    assert_eq!(blob["ai_pipeline"]["runs"].as_object().unwrap().len(), 2);
}

#[tokio::test]
async fn test_late_task_of_finalized_run_is_dropped() {
    let t = TestEngine::new().unwrap();
    t.insert(fixture_post("post-1"));
    let run_id = t
        .engine
        .start_run("post-1", &RunPlan::new().required(StepKind::Ocr))
        .await
        .unwrap();
    let task = t.queue.pending().remove(0);
    t.drain().await;

    let late = t.engine.handle_task(&task.task_id, &task.args).await.unwrap();
    assert_eq!(late, StepOutcome::Skipped(SkipReason::PipelineTerminal));
    assert_run_status(&t.run("post-1", &run_id).await.unwrap(), RunStatus::Completed);
}
