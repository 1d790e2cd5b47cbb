//! Restart behavior: rebuilding the queue from the durable task store.

use crate::integration::support::{story, Harness};
use picturebook::store::{PageStore, SledStore, TaskRecordStore};
use picturebook::task::{IllustrationStatus, TaskStatus};
use picturebook::types::StoryId;

#[tokio::test]
async fn test_interrupted_task_resumes_as_pending() {
    let harness = Harness::new();
    let ids = harness.engine.submit_story(story("s1", 1, false), None).unwrap();

    // Crash mid-flight: the record says generating, so does the page.
    let mut record = harness.store.get_task(&ids[0]).unwrap().unwrap();
    record.status = TaskStatus::Generating;
    harness.store.put_task(&record).unwrap();
    let mut page = harness.pages("s1").remove(0);
    page.illustration_status = IllustrationStatus::Generating;
    harness.store.put_page(&page).unwrap();
    TaskRecordStore::flush(harness.store.as_ref()).unwrap();

    let harness = harness.reopen();
    let recovery = harness.engine.resume();
    assert_eq!(recovery.interrupted, 1);
    assert_eq!(recovery.tasks.len(), 1);

    let task = harness.engine.task(&ids[0]).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(
        harness.store.get_task(&ids[0]).unwrap().unwrap().status,
        TaskStatus::Pending
    );
    assert_eq!(harness.pages("s1")[0].illustration_status, IllustrationStatus::Pending);

    let snapshot = harness.engine.run_story(&StoryId::new("s1")).await.unwrap();
    assert!(snapshot.is_complete());
}

#[tokio::test]
async fn test_corrupt_record_is_discarded() {
    let harness = Harness::new();
    harness.engine.submit_story(story("s1", 2, false), None).unwrap();
    harness.store.put_raw_task("garbage", b"{not json").unwrap();

    let harness = harness.reopen();
    let recovery = harness.engine.resume();
    assert_eq!(recovery.discarded, vec!["garbage".to_string()]);
    assert_eq!(recovery.tasks.len(), 2);

    let (records, unreadable) = harness.store.list_tasks().unwrap();
    assert_eq!(records.len(), 2);
    assert!(unreadable.is_empty());
}

#[tokio::test]
async fn test_committed_reference_satisfies_pages_after_restart() {
    let harness = Harness::new();
    let ids = harness.engine.submit_story(story("s1", 2, true), None).unwrap();

    // Only the global reference finishes before the restart.
    let status = harness.engine.execute(&ids[0]).await.unwrap();
    assert_eq!(status, TaskStatus::Ready);
    assert!(harness.store.get_task(&ids[0]).unwrap().is_none());

    let harness = harness.reopen();
    let recovery = harness.engine.resume();
    assert_eq!(recovery.tasks.len(), 2);
    assert_eq!(recovery.completed, vec![ids[0].clone()]);

    let snapshot = harness.engine.run_story(&StoryId::new("s1")).await.unwrap();
    assert!(snapshot.is_complete());
    for call in harness.provider.page_calls() {
        assert!(call.reference_labels.contains(&"global_reference".to_string()));
    }
    assert!(harness.pages("s1").iter().all(|p| !p.degraded));
}

#[tokio::test]
async fn test_ready_record_with_interrupted_commit_counts_as_done() {
    let harness = Harness::new();
    let ids = harness.engine.submit_story(story("s1", 1, false), None).unwrap();
    let mut record = harness.store.get_task(&ids[0]).unwrap().unwrap();
    record.status = TaskStatus::Ready;
    harness.store.put_task(&record).unwrap();

    let harness = harness.reopen();
    let recovery = harness.engine.resume();
    assert_eq!(recovery.completed, vec![ids[0].clone()]);
    assert!(recovery.tasks.is_empty());
    assert!(harness.store.get_task(&ids[0]).unwrap().is_none());
}

#[test]
fn test_empty_store_recovers_nothing() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = SledStore::open(dir.path()).unwrap();
    let recovery = picturebook::store::recover(&store);
    assert!(recovery.tasks.is_empty());
    assert!(recovery.discarded.is_empty());
}

#[tokio::test]
async fn test_prune_drops_abandoned_tasks() {
    let harness = Harness::new();
    harness.provider.always_fail("Page 1 text");
    let ids = harness.engine.submit_story(story("s1", 1, false), None).unwrap();
    harness.engine.run_story(&StoryId::new("s1")).await.unwrap();

    let pruned = harness.engine.prune_abandoned().unwrap();
    assert_eq!(pruned, ids);
    assert!(harness.engine.task(&ids[0]).is_none());
    assert!(harness.store.get_task(&ids[0]).unwrap().is_none());
}
