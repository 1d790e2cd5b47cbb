//! Manual retry, page regeneration and degraded-page follow-up.

use crate::integration::support::{fast_config, store_path, story, FlakyTaskStore, Harness, REFERENCE_PROMPT};
use picturebook::error::PipelineError;
use picturebook::references::ReferencesConfig;
use picturebook::scheduler::QueueCommand;
use picturebook::store::{SledStore, TaskRecordStore};
use picturebook::task::{IllustrationStatus, TaskStatus};
use picturebook::types::StoryId;
use tempfile::TempDir;

#[tokio::test]
async fn test_regenerate_replaces_the_single_illustration() {
    let harness = Harness::new();
    let story_id = StoryId::new("s1");
    harness.engine.submit_story(story("s1", 2, false), None).unwrap();
    harness.engine.run_story(&story_id).await.unwrap();
    let before = harness.pages("s1")[0].illustration().unwrap().clone();

    let task_id = harness
        .engine
        .handle(QueueCommand::Regenerate {
            story_id: story_id.clone(),
            page_number: 1,
        })
        .unwrap();
    let cleared = &harness.pages("s1")[0];
    assert!(cleared.illustration().is_none());
    assert_eq!(cleared.illustration_status, IllustrationStatus::Pending);
    assert_eq!(harness.engine.task(&task_id).unwrap().status, TaskStatus::Pending);

    let snapshot = harness.engine.run_story(&story_id).await.unwrap();
    assert!(snapshot.is_complete());
    let after = harness.pages("s1")[0].illustration().unwrap().clone();
    assert_ne!(before.cache_key(), after.cache_key());
    assert_eq!(harness.provider.call_count(), 3);
}

#[tokio::test]
async fn test_regenerate_is_refused_while_the_page_is_generating() {
    let harness = Harness::new();
    let story_id = StoryId::new("s1");
    harness.engine.submit_story(story("s1", 1, false), None).unwrap();
    harness.engine.run_story(&story_id).await.unwrap();

    let gate = harness.provider.hold();
    let regenerate = QueueCommand::Regenerate {
        story_id: story_id.clone(),
        page_number: 1,
    };
    let task_id = harness.engine.handle(regenerate.clone()).unwrap();
    assert!(harness.pages("s1")[0].illustration().is_none());

    let run = harness.engine.run_story(&story_id);
    let interfere = async {
        while harness.engine.task(&task_id).map(|t| t.status) != Some(TaskStatus::Generating) {
            tokio::task::yield_now().await;
        }
        let err = harness.engine.handle(regenerate.clone()).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
        // The refused request leaves the in-flight page alone.
        assert_eq!(harness.pages("s1")[0].illustration_status, IllustrationStatus::Generating);
        gate.add_permits(1);
    };
    let (snapshot, ()) = tokio::join!(run, interfere);

    assert!(snapshot.unwrap().is_complete());
    let page = &harness.pages("s1")[0];
    assert_eq!(page.illustration_status, IllustrationStatus::Ready);
    assert!(page.illustration().is_some());
    assert_eq!(harness.provider.call_count(), 2);
}

#[tokio::test]
async fn test_regenerate_reuses_a_pending_task() {
    let harness = Harness::new();
    let ids = harness.engine.submit_story(story("s1", 1, false), None).unwrap();
    let again = harness
        .engine
        .handle(QueueCommand::Regenerate {
            story_id: StoryId::new("s1"),
            page_number: 1,
        })
        .unwrap();
    assert_eq!(again, ids[0]);
    assert_eq!(harness.engine.stats().pending, 1);
}

#[tokio::test]
async fn test_regenerate_unknown_page_fails() {
    let harness = Harness::new();
    harness.engine.submit_story(story("s1", 1, false), None).unwrap();
    let err = harness
        .engine
        .handle(QueueCommand::Regenerate {
            story_id: StoryId::new("s1"),
            page_number: 9,
        })
        .unwrap_err();
    assert!(matches!(err, PipelineError::PageNotFound(_)));
}

#[tokio::test]
async fn test_manual_retry_after_abandonment() {
    let harness = Harness::new();
    let story_id = StoryId::new("s1");
    harness.provider.always_fail("Page 1 text");
    let ids = harness.engine.submit_story(story("s1", 1, false), None).unwrap();
    harness.engine.run_story(&story_id).await.unwrap();
    assert_eq!(harness.engine.task(&ids[0]).unwrap().status, TaskStatus::Abandoned);

    harness.provider.recover();
    harness.engine.handle(QueueCommand::Retry(ids[0].clone())).unwrap();
    let task = harness.engine.task(&ids[0]).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempt_count, 0);

    let snapshot = harness.engine.run_story(&story_id).await.unwrap();
    assert!(snapshot.is_complete());
    assert_eq!(harness.provider.call_count(), 4);
}

#[tokio::test]
async fn test_retry_requires_a_failed_task() {
    let harness = Harness::new();
    let ids = harness.engine.submit_story(story("s1", 1, false), None).unwrap();
    let err = harness.engine.handle(QueueCommand::Retry(ids[0].clone())).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_degraded_pages_follow_a_late_reference() {
    let references = ReferencesConfig {
        regenerate_degraded_pages: true,
        ..ReferencesConfig::default()
    };
    let harness = Harness::with_config(fast_config(), references);
    let story_id = StoryId::new("s1");
    harness.provider.always_fail(REFERENCE_PROMPT);
    let ids = harness.engine.submit_story(story("s1", 2, true), None).unwrap();
    harness.engine.run_story(&story_id).await.unwrap();
    assert!(harness.pages("s1").iter().all(|p| p.degraded));

    harness.provider.recover();
    harness.engine.handle(QueueCommand::Retry(ids[0].clone())).unwrap();
    let snapshot = harness.engine.run_story(&story_id).await.unwrap();
    assert!(snapshot.is_complete());

    let pages = harness.pages("s1");
    assert!(pages.iter().all(|p| !p.degraded));
    let calls = harness.provider.page_calls();
    assert_eq!(calls.len(), 4);
    for call in &calls[2..] {
        assert!(call.reference_labels.contains(&"global_reference".to_string()));
    }
}

#[tokio::test]
async fn test_degraded_pages_stay_without_opt_in() {
    let harness = Harness::new();
    let story_id = StoryId::new("s1");
    harness.provider.always_fail(REFERENCE_PROMPT);
    let ids = harness.engine.submit_story(story("s1", 2, true), None).unwrap();
    harness.engine.run_story(&story_id).await.unwrap();

    harness.provider.recover();
    harness.engine.handle(QueueCommand::Retry(ids[0].clone())).unwrap();
    harness.engine.run_story(&story_id).await.unwrap();
    assert!(harness.pages("s1").iter().all(|p| p.degraded));
    assert_eq!(harness.provider.page_calls().len(), 2);

    let requeued = harness.engine.regenerate_degraded(&story_id).unwrap();
    assert_eq!(requeued.len(), 2);
    harness.engine.run_story(&story_id).await.unwrap();
    assert!(harness.pages("s1").iter().all(|p| !p.degraded));
}

#[tokio::test]
async fn test_store_failure_is_recorded_not_thrown() {
    let dir = TempDir::new().unwrap();
    let store = SledStore::shared(store_path(&dir)).unwrap();
    let flaky = FlakyTaskStore::new(store.clone());
    let tasks: std::sync::Arc<dyn TaskRecordStore> = flaky.clone();
    let harness = Harness::with_task_store(tasks, store, dir);

    let ids = harness.engine.submit_story(story("s1", 1, false), None).unwrap();
    flaky.set_failing(true);
    let status = harness.engine.execute(&ids[0]).await.unwrap();
    assert_eq!(status, TaskStatus::Failed);
    assert_eq!(harness.provider.call_count(), 0);
    let task = harness.engine.task(&ids[0]).unwrap();
    assert_eq!(task.attempt_count, 1);
    assert!(task.last_error.unwrap().contains("disk unavailable"));

    flaky.set_failing(false);
    let snapshot = harness.engine.run_story(&StoryId::new("s1")).await.unwrap();
    assert!(snapshot.is_complete());
}

#[tokio::test]
async fn test_uncommitted_image_is_discarded() {
    let dir = TempDir::new().unwrap();
    let store = SledStore::shared(store_path(&dir)).unwrap();
    let flaky = FlakyTaskStore::new(store.clone());
    let tasks: std::sync::Arc<dyn TaskRecordStore> = flaky.clone();
    let harness = Harness::with_task_store(tasks, store, dir);

    let ids = harness.engine.submit_story(story("s1", 1, false), None).unwrap();
    // The start is persisted; the ready record is not.
    flaky.fail_after(1);
    let status = harness.engine.execute(&ids[0]).await.unwrap();
    assert_eq!(status, TaskStatus::Failed);
    assert_eq!(harness.provider.call_count(), 1);

    let page = &harness.pages("s1")[0];
    assert_eq!(page.illustration_status, IllustrationStatus::Failed);
    assert!(page.illustration().is_none());
    assert_eq!(harness.engine.task(&ids[0]).unwrap().attempt_count, 1);
}
